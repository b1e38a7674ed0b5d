//! Postgres backend. Counter changes are always relative `UPDATE`s.

use chrono::Utc;
use sqlx::{Pool, Postgres};

use super::*;

const CATEGORY_COLUMNS: &str = "id, name, icon, description, is_active, created_at";
const QUESTION_COLUMNS: &str =
    "id, category_id, option_a, option_b, option_a_image, option_b_image, votes_a, votes_b, is_active, featured, created_at";
const VOTE_COLUMNS: &str = "id, question_id, user_id, session_key, choice, voted_at, user_agent, ip_address";

fn db_err(e: sqlx::Error) -> RepoError {
    match e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(ref d) if d.is_unique_violation() => RepoError::Conflict,
        // foreign key target missing
        sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => RepoError::NotFound,
        other => RepoError::Internal(other.to_string()),
    }
}

/// `%term%` ILIKE patterns, wildcards inside a term matched literally.
fn like_patterns(search: Option<&str>) -> Vec<String> {
    search_terms(search)
        .into_iter()
        .map(|t| format!("%{}%", t.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")))
        .collect()
}

fn expect_affected(rows: u64) -> RepoResult<()> {
    if rows == 0 { Err(RepoError::NotFound) } else { Ok(()) }
}

#[derive(Clone)]
pub struct PgRepo { pool: Pool<Postgres> }

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

    /// Insert the vote or lock and update the existing row. `None` when the row
    /// the insert conflicted with is gone by the time it is locked.
    async fn upsert_vote(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        question_id: Id,
        identity: &Identity,
        choice: VoteChoice,
        meta: &VoteMeta,
    ) -> RepoResult<Option<VoteOutcome>> {
        let key = identity.key();
        let inserted: Option<Id> = sqlx::query_scalar(
            "INSERT INTO tot_votes (question_id, identity_key, user_id, session_key, choice, user_agent, ip_address) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (question_id, identity_key) DO NOTHING RETURNING id"
        )
        .bind(question_id)
        .bind(&key)
        .bind(identity.user_id())
        .bind(identity.session_key())
        .bind(choice.as_str())
        .bind(&meta.user_agent)
        .bind(meta.ip_address.as_deref())
        .fetch_optional(&mut **tx).await.map_err(db_err)?;
        if inserted.is_some() {
            return Ok(Some(VoteOutcome::Created(choice)));
        }

        let previous: Option<String> = sqlx::query_scalar(
            "SELECT choice FROM tot_votes WHERE question_id = $1 AND identity_key = $2 FOR UPDATE"
        )
        .bind(question_id)
        .bind(&key)
        .fetch_optional(&mut **tx).await.map_err(db_err)?;
        let Some(previous) = previous else { return Ok(None) };
        let previous: VoteChoice = previous.parse().map_err(|e: InvalidChoice| RepoError::Internal(e.to_string()))?;
        if previous == choice {
            return Ok(Some(VoteOutcome::Unchanged(choice)));
        }
        sqlx::query(
            "UPDATE tot_votes SET choice = $3, voted_at = now(), user_agent = $4, ip_address = $5 \
             WHERE question_id = $1 AND identity_key = $2"
        )
        .bind(question_id)
        .bind(&key)
        .bind(choice.as_str())
        .bind(&meta.user_agent)
        .bind(meta.ip_address.as_deref())
        .execute(&mut **tx).await.map_err(db_err)?;
        Ok(Some(VoteOutcome::Changed { from: previous, to: choice }))
    }
}

#[async_trait]
impl CategoryRepo for PgRepo {
    async fn list_categories(&self, query: &CategoryQuery) -> RepoResult<Vec<Category>> {
        sqlx::query_as::<_, Category>(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM tot_categories WHERE ($1::BOOLEAN IS NULL OR is_active = $1) \
             AND NOT EXISTS (SELECT 1 FROM unnest($2::TEXT[]) AS t(p) WHERE NOT (name ILIKE t.p OR description ILIKE t.p)) \
             ORDER BY id"
        ))
        .bind(query.active)
        .bind(like_patterns(query.search.as_deref()))
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn get_category(&self, id: Id) -> RepoResult<Category> {
        sqlx::query_as::<_, Category>(&format!("SELECT {CATEGORY_COLUMNS} FROM tot_categories WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
        sqlx::query_as::<_, Category>(&format!(
            "INSERT INTO tot_categories (name, icon, description, is_active) VALUES ($1,$2,$3,$4) RETURNING {CATEGORY_COLUMNS}"
        ))
        .bind(&new.name).bind(&new.icon).bind(&new.description).bind(new.is_active)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn update_category(&self, id: Id, upd: UpdateCategory) -> RepoResult<Category> {
        sqlx::query_as::<_, Category>(&format!(
            "UPDATE tot_categories SET name = COALESCE($2, name), icon = COALESCE($3, icon), \
             description = COALESCE($4, description), is_active = COALESCE($5, is_active) \
             WHERE id = $1 RETURNING {CATEGORY_COLUMNS}"
        ))
        .bind(id)
        .bind(upd.name.as_ref())
        .bind(upd.icon.as_ref())
        .bind(upd.description.as_ref())
        .bind(upd.is_active)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn delete_category(&self, id: Id) -> RepoResult<()> {
        // questions and votes go with it (ON DELETE CASCADE)
        let res = sqlx::query("DELETE FROM tot_categories WHERE id = $1")
            .bind(id)
            .execute(&self.pool).await.map_err(db_err)?;
        expect_affected(res.rows_affected())
    }
}

#[async_trait]
impl QuestionRepo for PgRepo {
    async fn list_questions(&self, query: &QuestionQuery) -> RepoResult<Vec<Question>> {
        sqlx::query_as::<_, Question>(&format!(
            "SELECT {QUESTION_COLUMNS} FROM tot_questions \
             WHERE ($1::BIGINT IS NULL OR category_id = $1) AND ($2::BOOLEAN IS NULL OR is_active = $2) \
             AND ($3::BOOLEAN IS NULL OR featured = $3) \
             AND NOT EXISTS (SELECT 1 FROM unnest($4::TEXT[]) AS t(p) WHERE NOT (option_a ILIKE t.p OR option_b ILIKE t.p)) \
             ORDER BY id"
        ))
        .bind(query.category_id)
        .bind(query.active)
        .bind(query.featured)
        .bind(like_patterns(query.search.as_deref()))
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn get_question(&self, id: Id) -> RepoResult<Question> {
        sqlx::query_as::<_, Question>(&format!("SELECT {QUESTION_COLUMNS} FROM tot_questions WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn create_question(&self, new: NewQuestion) -> RepoResult<Question> {
        sqlx::query_as::<_, Question>(&format!(
            "INSERT INTO tot_questions (category_id, option_a, option_b, option_a_image, option_b_image, is_active, featured) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {QUESTION_COLUMNS}"
        ))
        .bind(new.category_id)
        .bind(&new.option_a)
        .bind(&new.option_b)
        .bind(new.option_a_image.as_ref())
        .bind(new.option_b_image.as_ref())
        .bind(new.is_active)
        .bind(new.featured)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn update_question(&self, id: Id, upd: UpdateQuestion) -> RepoResult<Question> {
        // an empty image string clears the image
        sqlx::query_as::<_, Question>(&format!(
            "UPDATE tot_questions SET category_id = COALESCE($2, category_id), option_a = COALESCE($3, option_a), \
             option_b = COALESCE($4, option_b), \
             option_a_image = CASE WHEN $5::TEXT IS NULL THEN option_a_image ELSE NULLIF($5, '') END, \
             option_b_image = CASE WHEN $6::TEXT IS NULL THEN option_b_image ELSE NULLIF($6, '') END, \
             is_active = COALESCE($7, is_active), featured = COALESCE($8, featured) \
             WHERE id = $1 RETURNING {QUESTION_COLUMNS}"
        ))
        .bind(id)
        .bind(upd.category_id)
        .bind(upd.option_a.as_ref())
        .bind(upd.option_b.as_ref())
        .bind(upd.option_a_image.as_ref())
        .bind(upd.option_b_image.as_ref())
        .bind(upd.is_active)
        .bind(upd.featured)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn delete_question(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM tot_questions WHERE id = $1")
            .bind(id)
            .execute(&self.pool).await.map_err(db_err)?;
        expect_affected(res.rows_affected())
    }
}

#[async_trait]
impl VoteRepo for PgRepo {
    async fn cast_vote(&self, question_id: Id, identity: &Identity, choice: VoteChoice, meta: VoteMeta) -> RepoResult<CastVote> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let outcome = match Self::upsert_vote(&mut tx, question_id, identity, choice, &meta).await? {
            Some(outcome) => outcome,
            // the existing row was reset away between the insert and the lock; insert again
            None => Self::upsert_vote(&mut tx, question_id, identity, choice, &meta)
                .await?
                .ok_or_else(|| RepoError::Internal("vote row vanished twice".into()))?,
        };

        let (da, db) = outcome.deltas();
        let (votes_a, votes_b): (i64, i64) = if (da, db) == (0, 0) {
            sqlx::query_as("SELECT votes_a, votes_b FROM tot_questions WHERE id = $1")
                .bind(question_id)
                .fetch_one(&mut *tx).await.map_err(db_err)?
        } else {
            sqlx::query_as(
                "UPDATE tot_questions SET votes_a = votes_a + $2, votes_b = votes_b + $3 \
                 WHERE id = $1 RETURNING votes_a, votes_b"
            )
            .bind(question_id)
            .bind(da)
            .bind(db)
            .fetch_one(&mut *tx).await.map_err(db_err)?
        };

        tx.commit().await.map_err(db_err)?;
        Ok(CastVote { outcome, tally: Tally { votes_a, votes_b } })
    }

    async fn identity_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<Vec<Vote>> {
        sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM tot_votes WHERE identity_key = $1 \
             AND question_id IN (SELECT id FROM tot_questions WHERE category_id = $2) ORDER BY id"
        ))
        .bind(identity.key())
        .bind(category_id)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn reset_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<u64> {
        let removed: i64 = sqlx::query_scalar(r#"
            WITH removed AS (
                DELETE FROM tot_votes v USING tot_questions q
                WHERE v.question_id = q.id AND q.category_id = $2 AND v.identity_key = $1
                RETURNING v.question_id, v.choice
            ), per_question AS (
                SELECT question_id,
                       COUNT(*) FILTER (WHERE choice = 'A') AS a,
                       COUNT(*) FILTER (WHERE choice = 'B') AS b
                FROM removed GROUP BY question_id
            ), adjusted AS (
                UPDATE tot_questions q SET votes_a = q.votes_a - p.a, votes_b = q.votes_b - p.b
                FROM per_question p WHERE q.id = p.question_id
                RETURNING q.id
            )
            SELECT COUNT(*) FROM removed
        "#)
        .bind(identity.key())
        .bind(category_id)
        .fetch_one(&self.pool).await.map_err(db_err)?;
        Ok(removed as u64)
    }

    async fn list_votes(&self, query: &VoteQuery) -> RepoResult<Vec<Vote>> {
        sqlx::query_as::<_, Vote>(&format!(
            "SELECT {VOTE_COLUMNS} FROM tot_votes v WHERE ($1::BIGINT IS NULL OR question_id = $1) \
             AND ($2::BIGINT IS NULL OR question_id IN (SELECT id FROM tot_questions WHERE category_id = $2)) \
             AND ($3::TEXT IS NULL OR choice = $3) \
             AND NOT EXISTS (SELECT 1 FROM unnest($4::TEXT[]) AS t(p) WHERE NOT ( \
                 COALESCE(v.user_id, '') ILIKE t.p OR EXISTS (SELECT 1 FROM tot_questions q \
                 WHERE q.id = v.question_id AND (q.option_a ILIKE t.p OR q.option_b ILIKE t.p)))) \
             ORDER BY id"
        ))
        .bind(query.question_id)
        .bind(query.category_id)
        .bind(query.choice.map(VoteChoice::as_str))
        .bind(like_patterns(query.search.as_deref()))
        .fetch_all(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl AnalyticsRepo for PgRepo {
    async fn count_votes(&self, filter: VoteFilter) -> RepoResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM tot_votes v JOIN tot_questions q ON q.id = v.question_id \
             WHERE ($1::TIMESTAMPTZ IS NULL OR v.voted_at >= $1) AND ($2::BIGINT IS NULL OR q.category_id = $2)"
        )
        .bind(filter.since)
        .bind(filter.category_id)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn count_active_voters(&self, since: DateTime<Utc>) -> RepoResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(DISTINCT user_id) FROM tot_votes WHERE voted_at >= $1 AND user_id IS NOT NULL"
        )
        .bind(since)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn votes_by_category(&self) -> RepoResult<Vec<CategoryVotes>> {
        sqlx::query_as::<_, CategoryVotes>(r#"
            SELECT c.id AS category_id, c.name, c.icon, COUNT(v.id) AS votes
            FROM tot_votes v
            JOIN tot_questions q ON q.id = v.question_id
            JOIN tot_categories c ON c.id = q.category_id
            GROUP BY c.id, c.name, c.icon
            ORDER BY votes DESC, c.id ASC
        "#)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn trending_questions(&self, since: DateTime<Utc>, limit: usize) -> RepoResult<Vec<TrendingQuestion>> {
        sqlx::query_as::<_, TrendingQuestion>(r#"
            SELECT q.id, q.category_id, q.option_a, q.option_b, q.option_a_image, q.option_b_image,
                   q.votes_a, q.votes_b, q.is_active, q.featured, q.created_at,
                   COUNT(v.id) AS recent_votes
            FROM tot_questions q
            JOIN tot_votes v ON v.question_id = q.id
            WHERE q.is_active AND v.voted_at >= $1
            GROUP BY q.id
            ORDER BY recent_votes DESC, q.id ASC
            LIMIT $2
        "#)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn daily_vote_counts(&self, start: NaiveDate, end: NaiveDate, category_id: Option<Id>) -> RepoResult<Vec<DayCount>> {
        sqlx::query_as::<_, DayCount>(r#"
            SELECT (v.voted_at AT TIME ZONE 'UTC')::DATE AS day, COUNT(*) AS votes
            FROM tot_votes v
            JOIN tot_questions q ON q.id = v.question_id
            WHERE (v.voted_at AT TIME ZONE 'UTC')::DATE BETWEEN $1 AND $2
              AND ($3::BIGINT IS NULL OR q.category_id = $3)
            GROUP BY day
            ORDER BY day
        "#)
        .bind(start)
        .bind(end)
        .bind(category_id)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn hourly_vote_counts(&self, category_id: Option<Id>) -> RepoResult<Vec<HourCount>> {
        sqlx::query_as::<_, HourCount>(r#"
            SELECT EXTRACT(HOUR FROM v.voted_at AT TIME ZONE 'UTC')::INT AS hour, COUNT(*) AS votes
            FROM tot_votes v
            JOIN tot_questions q ON q.id = v.question_id
            WHERE ($1::BIGINT IS NULL OR q.category_id = $1)
            GROUP BY hour
            ORDER BY hour
        "#)
        .bind(category_id)
        .fetch_all(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl PollRepo for PgRepo {
    async fn list_polls(&self) -> RepoResult<Vec<Poll>> {
        sqlx::query_as::<_, Poll>("SELECT id, question_text, pub_date FROM polls ORDER BY pub_date DESC")
            .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn latest_polls(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<Poll>> {
        sqlx::query_as::<_, Poll>(
            "SELECT id, question_text, pub_date FROM polls WHERE pub_date <= $1 ORDER BY pub_date DESC LIMIT $2"
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn get_poll(&self, id: Id) -> RepoResult<PollDetail> {
        let poll = sqlx::query_as::<_, Poll>("SELECT id, question_text, pub_date FROM polls WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool).await.map_err(db_err)?;
        let choices = sqlx::query_as::<_, PollChoice>(
            "SELECT id, poll_id, choice_text, votes FROM poll_choices WHERE poll_id = $1 ORDER BY id"
        )
        .bind(id)
        .fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(PollDetail { poll, choices })
    }

    async fn create_poll(&self, new: NewPoll) -> RepoResult<PollDetail> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let poll = sqlx::query_as::<_, Poll>(
            "INSERT INTO polls (question_text, pub_date) VALUES ($1,$2) RETURNING id, question_text, pub_date"
        )
        .bind(&new.question_text)
        .bind(new.pub_date.unwrap_or_else(Utc::now))
        .fetch_one(&mut *tx).await.map_err(db_err)?;
        let mut choices = Vec::with_capacity(new.choices.len());
        for text in &new.choices {
            let choice = sqlx::query_as::<_, PollChoice>(
                "INSERT INTO poll_choices (poll_id, choice_text) VALUES ($1,$2) RETURNING id, poll_id, choice_text, votes"
            )
            .bind(poll.id)
            .bind(text)
            .fetch_one(&mut *tx).await.map_err(db_err)?;
            choices.push(choice);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(PollDetail { poll, choices })
    }

    async fn delete_poll(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(id)
            .execute(&self.pool).await.map_err(db_err)?;
        expect_affected(res.rows_affected())
    }

    async fn vote_poll_choice(&self, poll_id: Id, choice_id: Id) -> RepoResult<PollChoice> {
        sqlx::query_as::<_, PollChoice>(
            "UPDATE poll_choices SET votes = votes + 1 WHERE id = $1 AND poll_id = $2 \
             RETURNING id, poll_id, choice_text, votes"
        )
        .bind(choice_id)
        .bind(poll_id)
        .fetch_one(&self.pool).await.map_err(db_err)
    }
}
