use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::identity::Identity;
use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("storage: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Optional restrictions applied to vote counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoteFilter {
    pub since: Option<DateTime<Utc>>,
    pub category_id: Option<Id>,
}

/// Whitespace-separated search terms; blank input yields none.
pub fn search_terms(search: Option<&str>) -> Vec<String> {
    search
        .map(|s| s.split_whitespace().map(str::to_lowercase).collect())
        .unwrap_or_default()
}

/// Every term must occur, case-insensitively, in at least one of `fields`.
fn matches_search(terms: &[String], fields: &[&str]) -> bool {
    let fields: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
    terms.iter().all(|t| fields.iter().any(|f| f.contains(t.as_str())))
}

#[derive(Debug, Clone, Default)]
pub struct CategoryQuery {
    pub active: Option<bool>,
    /// Matched against name and description.
    pub search: Option<String>,
}

impl CategoryQuery {
    pub fn active() -> Self {
        Self { active: Some(true), ..Self::default() }
    }

    pub fn matches(&self, c: &Category) -> bool {
        self.active.map_or(true, |a| c.is_active == a)
            && matches_search(&search_terms(self.search.as_deref()), &[c.name.as_str(), c.description.as_str()])
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuestionQuery {
    pub category_id: Option<Id>,
    pub active: Option<bool>,
    pub featured: Option<bool>,
    /// Matched against both options.
    pub search: Option<String>,
}

impl QuestionQuery {
    pub fn active() -> Self {
        Self { active: Some(true), ..Self::default() }
    }

    pub fn active_in(category_id: Id) -> Self {
        Self { category_id: Some(category_id), ..Self::active() }
    }

    pub fn matches(&self, q: &Question) -> bool {
        self.category_id.map_or(true, |c| q.category_id == c)
            && self.active.map_or(true, |a| q.is_active == a)
            && self.featured.map_or(true, |f| q.featured == f)
            && matches_search(&search_terms(self.search.as_deref()), &[q.option_a.as_str(), q.option_b.as_str()])
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoteQuery {
    pub question_id: Option<Id>,
    pub category_id: Option<Id>,
    pub choice: Option<VoteChoice>,
    /// Matched against the voter's user subject and the question's options.
    pub search: Option<String>,
}

impl VoteQuery {
    pub fn question(question_id: Id) -> Self {
        Self { question_id: Some(question_id), ..Self::default() }
    }

    /// `question` is the vote's question, if it still exists.
    pub fn matches(&self, v: &Vote, question: Option<&Question>) -> bool {
        let (option_a, option_b) = question.map_or(("", ""), |q| (q.option_a.as_str(), q.option_b.as_str()));
        self.question_id.map_or(true, |id| v.question_id == id)
            && self.category_id.map_or(true, |c| question.map(|q| q.category_id) == Some(c))
            && self.choice.map_or(true, |c| v.choice == c)
            && matches_search(
                &search_terms(self.search.as_deref()),
                &[v.user_id.as_deref().unwrap_or_default(), option_a, option_b],
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DayCount {
    pub day: NaiveDate,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HourCount {
    pub hour: i32,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CategoryVotes {
    pub category_id: Id,
    pub name: String,
    pub icon: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema, sqlx::FromRow)]
pub struct TrendingQuestion {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub question: Question,
    pub recent_votes: i64,
}

#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list_categories(&self, query: &CategoryQuery) -> RepoResult<Vec<Category>>;
    async fn get_category(&self, id: Id) -> RepoResult<Category>;
    async fn create_category(&self, new: NewCategory) -> RepoResult<Category>;
    async fn update_category(&self, id: Id, upd: UpdateCategory) -> RepoResult<Category>;
    /// Removes the category together with its questions and their votes.
    async fn delete_category(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait QuestionRepo: Send + Sync {
    /// Questions in id order.
    async fn list_questions(&self, query: &QuestionQuery) -> RepoResult<Vec<Question>>;
    async fn get_question(&self, id: Id) -> RepoResult<Question>;
    async fn create_question(&self, new: NewQuestion) -> RepoResult<Question>;
    async fn update_question(&self, id: Id, upd: UpdateQuestion) -> RepoResult<Question>;
    async fn delete_question(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait VoteRepo: Send + Sync {
    /// Insert-or-update the identity's vote and adjust the counters relatively, atomically.
    async fn cast_vote(&self, question_id: Id, identity: &Identity, choice: VoteChoice, meta: VoteMeta) -> RepoResult<CastVote>;
    async fn identity_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<Vec<Vote>>;
    /// Deletes the identity's votes in a category, keeping counters consistent. Returns votes removed.
    async fn reset_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<u64>;
    async fn list_votes(&self, query: &VoteQuery) -> RepoResult<Vec<Vote>>;
}

#[async_trait]
pub trait AnalyticsRepo: Send + Sync {
    async fn count_votes(&self, filter: VoteFilter) -> RepoResult<i64>;
    /// Distinct registered users with a vote at or after `since`.
    async fn count_active_voters(&self, since: DateTime<Utc>) -> RepoResult<i64>;
    /// Vote totals per category, most votes first. Categories without votes are omitted.
    async fn votes_by_category(&self) -> RepoResult<Vec<CategoryVotes>>;
    async fn trending_questions(&self, since: DateTime<Utc>, limit: usize) -> RepoResult<Vec<TrendingQuestion>>;
    /// Per-day counts (UTC) for `start..=end`; days without votes are omitted.
    async fn daily_vote_counts(&self, start: NaiveDate, end: NaiveDate, category_id: Option<Id>) -> RepoResult<Vec<DayCount>>;
    /// Per-hour-of-day counts (UTC) over all history; empty hours are omitted.
    async fn hourly_vote_counts(&self, category_id: Option<Id>) -> RepoResult<Vec<HourCount>>;
}

#[async_trait]
pub trait PollRepo: Send + Sync {
    /// Every poll, scheduled ones included, newest first.
    async fn list_polls(&self) -> RepoResult<Vec<Poll>>;
    /// Published polls, newest first.
    async fn latest_polls(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<Poll>>;
    async fn get_poll(&self, id: Id) -> RepoResult<PollDetail>;
    async fn create_poll(&self, new: NewPoll) -> RepoResult<PollDetail>;
    async fn delete_poll(&self, id: Id) -> RepoResult<()>;
    /// `votes = votes + 1` on a choice belonging to `poll_id`.
    async fn vote_poll_choice(&self, poll_id: Id, choice_id: Id) -> RepoResult<PollChoice>;
}

pub trait Repo: CategoryRepo + QuestionRepo + VoteRepo + AnalyticsRepo + PollRepo {}

impl<T> Repo for T where T: CategoryRepo + QuestionRepo + VoteRepo + AnalyticsRepo + PollRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem;

#[cfg(feature = "postgres-store")]
pub mod pg;
