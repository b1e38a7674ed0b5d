use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::analytics::round1;
use crate::identity::Identity;

// Always Postgres-shaped ids, the in-memory store hands out the same kind
pub type Id = i64;

pub const DEFAULT_CATEGORY_ICON: &str = "🎯";

fn default_icon() -> String { DEFAULT_CATEGORY_ICON.to_string() }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Category {
    pub id: Id,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Display label of a category, e.g. "🍕 Food".
pub fn category_label(icon: &str, name: &str) -> String {
    format!("{icon} {name}")
}

impl Category {
    pub fn label(&self) -> String {
        category_label(&self.icon, &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCategory {
    pub name: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateCategory {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// A two-option "This or That" question.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Question {
    pub id: Id,
    pub category_id: Id,
    pub option_a: String,
    pub option_b: String,
    pub option_a_image: Option<String>,
    pub option_b_image: Option<String>,
    pub votes_a: i64,
    pub votes_b: i64,
    pub is_active: bool,
    pub featured: bool,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn title(&self) -> String {
        format!("{} vs {}", self.option_a, self.option_b)
    }

    pub fn tally(&self) -> Tally {
        Tally { votes_a: self.votes_a, votes_b: self.votes_b }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewQuestion {
    pub category_id: Id,
    pub option_a: String,
    pub option_b: String,
    #[serde(default)]
    pub option_a_image: Option<String>,
    #[serde(default)]
    pub option_b_image: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub featured: bool,
}

/// Admin edit of a question. Vote counters are deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateQuestion {
    pub category_id: Option<Id>,
    pub option_a: Option<String>,
    pub option_b: Option<String>,
    pub option_a_image: Option<String>,
    pub option_b_image: Option<String>,
    pub is_active: Option<bool>,
    pub featured: Option<bool>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid choice: {0:?}")]
pub struct InvalidChoice(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum VoteChoice {
    A,
    B,
}

impl VoteChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteChoice::A => "A",
            VoteChoice::B => "B",
        }
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteChoice {
    type Err = InvalidChoice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(VoteChoice::A),
            "B" => Ok(VoteChoice::B),
            other => Err(InvalidChoice(other.to_string())),
        }
    }
}

impl TryFrom<String> for VoteChoice {
    type Error = InvalidChoice;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One voter's vote on one question. Exactly one of `user_id` / `session_key` is set.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Vote {
    pub id: Id,
    pub question_id: Id,
    pub user_id: Option<String>,
    pub session_key: Option<String>,
    #[sqlx(try_from = "String")]
    pub choice: VoteChoice,
    pub voted_at: DateTime<Utc>,
    pub user_agent: String,
    pub ip_address: Option<String>,
}

impl Vote {
    pub fn identity(&self) -> Identity {
        match (&self.user_id, &self.session_key) {
            (Some(user), _) => Identity::User(user.clone()),
            (None, Some(token)) => Identity::AnonymousSession(token.clone()),
            // the storage layer never writes such a row
            (None, None) => Identity::AnonymousSession(String::new()),
        }
    }
}

/// Client metadata captured alongside a vote.
#[derive(Debug, Clone, Default)]
pub struct VoteMeta {
    pub user_agent: String,
    pub ip_address: Option<String>,
}

/// What a single vote did to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Created(VoteChoice),
    Changed { from: VoteChoice, to: VoteChoice },
    Unchanged(VoteChoice),
}

impl VoteOutcome {
    /// Relative counter adjustment `(votes_a, votes_b)` this outcome requires.
    pub fn deltas(self) -> (i64, i64) {
        fn unit(c: VoteChoice) -> (i64, i64) {
            match c {
                VoteChoice::A => (1, 0),
                VoteChoice::B => (0, 1),
            }
        }
        match self {
            VoteOutcome::Created(c) => unit(c),
            VoteOutcome::Changed { from, to } => {
                let (fa, fb) = unit(from);
                let (ta, tb) = unit(to);
                (ta - fa, tb - fb)
            }
            VoteOutcome::Unchanged(_) => (0, 0),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VoteOutcome::Created(_) => "created",
            VoteOutcome::Changed { .. } => "changed",
            VoteOutcome::Unchanged(_) => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastVote {
    pub outcome: VoteOutcome,
    pub tally: Tally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum WinningOption {
    A,
    B,
    #[serde(rename = "TIE")]
    Tie,
}

/// Counter pair of a question.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Tally {
    pub votes_a: i64,
    pub votes_b: i64,
}

impl Tally {
    pub fn total(&self) -> i64 {
        self.votes_a + self.votes_b
    }

    /// Share of option A, 50 when nobody voted yet.
    pub fn percentage_a(&self) -> f64 {
        self.share(self.votes_a)
    }

    pub fn percentage_b(&self) -> f64 {
        self.share(self.votes_b)
    }

    fn share(&self, part: i64) -> f64 {
        match self.total() {
            0 => 50.0,
            total => round1(part as f64 / total as f64 * 100.0),
        }
    }

    pub fn winning_option(&self) -> WinningOption {
        use std::cmp::Ordering::*;
        match self.votes_a.cmp(&self.votes_b) {
            Greater => WinningOption::A,
            Less => WinningOption::B,
            Equal => WinningOption::Tie,
        }
    }

    pub fn results(&self) -> VoteResults {
        VoteResults {
            success: true,
            votes_a: self.votes_a,
            votes_b: self.votes_b,
            total_votes: self.total(),
            percentage_a: self.percentage_a(),
            percentage_b: self.percentage_b(),
            winning_option: self.winning_option(),
        }
    }
}

/// Response body of a successful vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VoteResults {
    pub success: bool,
    pub votes_a: i64,
    pub votes_b: i64,
    pub total_votes: i64,
    pub percentage_a: f64,
    pub percentage_b: f64,
    pub winning_option: WinningOption,
}

// ---------------- Legacy polls ----------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Poll {
    pub id: Id,
    pub question_text: String,
    pub pub_date: DateTime<Utc>,
}

impl Poll {
    pub fn is_published(&self, now: DateTime<Utc>) -> bool {
        self.pub_date <= now
    }

    pub fn was_published_recently(&self, now: DateTime<Utc>) -> bool {
        now - Duration::days(1) <= self.pub_date && self.pub_date <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PollChoice {
    pub id: Id,
    pub poll_id: Id,
    pub choice_text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPoll {
    pub question_text: String,
    /// Defaults to now.
    #[serde(default)]
    pub pub_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PollDetail {
    #[serde(flatten)]
    pub poll: Poll,
    pub choices: Vec<PollChoice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_three_to_one_then_switch() {
        let t = Tally { votes_a: 3, votes_b: 1 };
        assert_eq!(t.percentage_a(), 75.0);
        assert_eq!(t.percentage_b(), 25.0);
        assert_eq!(t.winning_option(), WinningOption::A);

        let (da, db) = VoteOutcome::Changed { from: VoteChoice::A, to: VoteChoice::B }.deltas();
        let t = Tally { votes_a: t.votes_a + da, votes_b: t.votes_b + db };
        assert_eq!(t, Tally { votes_a: 2, votes_b: 2 });
        assert_eq!(t.winning_option(), WinningOption::Tie);
        assert_eq!(t.total(), 4);
    }

    #[test]
    fn empty_tally_is_fifty_fifty() {
        let r = Tally::default().results();
        assert_eq!((r.percentage_a, r.percentage_b), (50.0, 50.0));
        assert_eq!(r.winning_option, WinningOption::Tie);
    }

    #[test]
    fn percentages_sum_to_hundred() {
        for (a, b) in [(1, 2), (2, 1), (1, 6), (7, 3), (1, 1), (0, 5), (333, 667)] {
            let t = Tally { votes_a: a, votes_b: b };
            let sum = t.percentage_a() + t.percentage_b();
            assert!((sum - 100.0).abs() <= 0.1 + f64::EPSILON, "{a}/{b} summed to {sum}");
        }
    }

    #[test]
    fn choice_parsing_is_strict() {
        assert_eq!("A".parse::<VoteChoice>(), Ok(VoteChoice::A));
        assert_eq!("B".parse::<VoteChoice>(), Ok(VoteChoice::B));
        assert!("a".parse::<VoteChoice>().is_err());
        assert!("C".parse::<VoteChoice>().is_err());
        assert!("".parse::<VoteChoice>().is_err());
    }

    #[test]
    fn outcome_deltas() {
        assert_eq!(VoteOutcome::Created(VoteChoice::B).deltas(), (0, 1));
        assert_eq!(VoteOutcome::Changed { from: VoteChoice::B, to: VoteChoice::A }.deltas(), (1, -1));
        assert_eq!(VoteOutcome::Unchanged(VoteChoice::A).deltas(), (0, 0));
    }

    #[test]
    fn winning_option_serializes_tie_upper() {
        assert_eq!(serde_json::to_string(&WinningOption::Tie).unwrap(), "\"TIE\"");
        assert_eq!(serde_json::to_string(&WinningOption::A).unwrap(), "\"A\"");
    }

    #[test]
    fn poll_recency_window() {
        let now = Utc::now();
        let mk = |d: DateTime<Utc>| Poll { id: 1, question_text: "q".into(), pub_date: d };
        assert!(mk(now - Duration::hours(23)).was_published_recently(now));
        assert!(!mk(now - Duration::days(2)).was_published_recently(now));
        assert!(!mk(now + Duration::hours(1)).was_published_recently(now));
        assert!(!mk(now + Duration::hours(1)).is_published(now));
    }
}
