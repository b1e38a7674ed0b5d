//! Vote recording and question selection for the "This or That" game.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::analytics::round1;
use crate::identity::Identity;
use crate::models::*;
use crate::repo::{
    AnalyticsRepo, CategoryQuery, CategoryRepo, QuestionQuery, QuestionRepo, Repo, RepoError, VoteFilter, VoteRepo,
};

#[derive(thiserror::Error, Debug)]
pub enum VoteError {
    #[error("invalid choice")] InvalidChoice,
    #[error("malformed request")] MalformedRequest,
    #[error("question not found")] QuestionNotFound,
    #[error("category not found")] CategoryNotFound,
    #[error(transparent)] Repo(#[from] RepoError),
}

/// Extract the choice from a raw `{"choice": "A"|"B"}` body.
pub fn parse_vote_body(body: &[u8]) -> Result<VoteChoice, VoteError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| VoteError::MalformedRequest)?;
    value
        .get("choice")
        .and_then(serde_json::Value::as_str)
        .ok_or(VoteError::InvalidChoice)?
        .parse()
        .map_err(|_| VoteError::InvalidChoice)
}

fn question_lookup(e: RepoError) -> VoteError {
    match e {
        RepoError::NotFound => VoteError::QuestionNotFound,
        other => VoteError::Repo(other),
    }
}

async fn active_category(repo: &dyn Repo, category_id: Id) -> Result<Category, VoteError> {
    match repo.get_category(category_id).await {
        Ok(c) if c.is_active => Ok(c),
        Ok(_) | Err(RepoError::NotFound) => Err(VoteError::CategoryNotFound),
        Err(e) => Err(e.into()),
    }
}

async fn active_question(repo: &dyn Repo, question_id: Id) -> Result<Question, VoteError> {
    match repo.get_question(question_id).await {
        Ok(q) if q.is_active => Ok(q),
        Ok(_) => Err(VoteError::QuestionNotFound),
        Err(e) => Err(question_lookup(e)),
    }
}

/// Record `identity`'s vote on an active question and return the fresh tally.
///
/// Re-voting the same option leaves the stored vote (including its timestamp) untouched.
pub async fn record_vote(
    repo: &dyn Repo,
    question_id: Id,
    identity: &Identity,
    choice: VoteChoice,
    meta: VoteMeta,
) -> Result<VoteResults, VoteError> {
    active_question(repo, question_id).await?;
    let cast = repo
        .cast_vote(question_id, identity, choice, meta)
        .await
        .map_err(question_lookup)?;
    metrics::counter!("tot_votes_recorded_total", "outcome" => cast.outcome.label()).increment(1);
    info!(question_id, outcome = cast.outcome.label(), choice = %choice, "vote recorded");
    Ok(cast.tally.results())
}

/// HTTP flavour of [`record_vote`]: an unknown question wins over a bad body.
pub async fn record_vote_body(
    repo: &dyn Repo,
    question_id: Id,
    identity: &Identity,
    body: &[u8],
    meta: VoteMeta,
) -> Result<VoteResults, VoteError> {
    active_question(repo, question_id).await?;
    let choice = parse_vote_body(body)?;
    record_vote(repo, question_id, identity, choice, meta).await
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextQuestion {
    Question {
        category: Category,
        question: Question,
        current_question: usize,
        total_questions: usize,
        progress_percentage: f64,
    },
    Complete { category: Category },
}

async fn voted_choices(repo: &dyn Repo, identity: Option<&Identity>, category_id: Id) -> Result<HashMap<Id, VoteChoice>, VoteError> {
    let Some(identity) = identity else { return Ok(HashMap::new()) };
    let votes = repo.identity_votes(identity, category_id).await?;
    Ok(votes.into_iter().map(|v| (v.question_id, v.choice)).collect())
}

/// Pick a random active question of the category the identity has not voted on yet.
pub async fn next_question(repo: &dyn Repo, category_id: Id, identity: Option<&Identity>) -> Result<NextQuestion, VoteError> {
    let category = active_category(repo, category_id).await?;
    let questions = repo.list_questions(&QuestionQuery::active_in(category_id)).await?;
    let voted: HashSet<Id> = voted_choices(repo, identity, category_id).await?.into_keys().collect();

    let remaining: Vec<&Question> = questions.iter().filter(|q| !voted.contains(&q.id)).collect();
    let picked = remaining.choose(&mut rand::thread_rng()).map(|q| (*q).clone());

    let Some(question) = picked else {
        return Ok(NextQuestion::Complete { category });
    };
    let total = questions.len();
    let answered = total - remaining.len();
    Ok(NextQuestion::Question {
        category,
        question,
        current_question: answered + 1,
        total_questions: total,
        progress_percentage: round1(answered as f64 / total as f64 * 100.0),
    })
}

/// Forget the identity's votes in a category so every question is offered again.
pub async fn reset_progress(repo: &dyn Repo, category_id: Id, identity: &Identity) -> Result<u64, VoteError> {
    active_category(repo, category_id).await?;
    let removed = repo.reset_votes(identity, category_id).await?;
    info!(category_id, removed, "voting history reset");
    Ok(removed)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QuestionSummary {
    pub question: Question,
    pub results: VoteResults,
    /// The caller's own vote, when known.
    pub your_choice: Option<VoteChoice>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QuizSummary {
    pub category: Category,
    pub answered: usize,
    pub total_questions: usize,
    pub questions: Vec<QuestionSummary>,
}

pub async fn quiz_summary(repo: &dyn Repo, category_id: Id, identity: Option<&Identity>) -> Result<QuizSummary, VoteError> {
    let category = active_category(repo, category_id).await?;
    let questions = repo.list_questions(&QuestionQuery::active_in(category_id)).await?;
    let mine = voted_choices(repo, identity, category_id).await?;

    let questions: Vec<QuestionSummary> = questions
        .into_iter()
        .map(|q| QuestionSummary {
            results: q.tally().results(),
            your_choice: mine.get(&q.id).copied(),
            question: q,
        })
        .collect();
    Ok(QuizSummary {
        category,
        answered: questions.iter().filter(|s| s.your_choice.is_some()).count(),
        total_questions: questions.len(),
        questions,
    })
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CategoryOverview {
    #[serde(flatten)]
    pub category: Category,
    pub question_count: usize,
    pub total_votes: i64,
}

/// Active categories with their active question count and all-time vote count.
pub async fn category_overview(repo: &dyn Repo) -> Result<Vec<CategoryOverview>, RepoError> {
    let categories = repo.list_categories(&CategoryQuery::active()).await?;
    let questions = repo.list_questions(&QuestionQuery::active()).await?;
    let mut out = Vec::with_capacity(categories.len());
    for category in categories {
        let question_count = questions.iter().filter(|q| q.category_id == category.id).count();
        let total_votes = repo
            .count_votes(VoteFilter { since: None, category_id: Some(category.id) })
            .await?;
        out.push(CategoryOverview { category, question_count, total_votes });
    }
    Ok(out)
}
