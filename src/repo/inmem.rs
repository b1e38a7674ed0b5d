//! In-memory backend with an optional JSON snapshot on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::*;

const SNAPSHOT_FILE: &str = "state.json";

#[derive(Default, Serialize, Deserialize)]
struct State {
    categories: BTreeMap<Id, Category>,
    questions: BTreeMap<Id, Question>,
    votes: BTreeMap<Id, Vote>,
    polls: BTreeMap<Id, Poll>,
    poll_choices: BTreeMap<Id, PollChoice>,
    next_id: Id,
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn category_of(&self, question_id: Id) -> Option<Id> {
        self.questions.get(&question_id).map(|q| q.category_id)
    }

    fn vote_matches(&self, v: &Vote, filter: &VoteFilter) -> bool {
        filter.since.map_or(true, |since| v.voted_at >= since)
            && filter
                .category_id
                .map_or(true, |cat| self.category_of(v.question_id) == Some(cat))
    }

    fn drop_question(&mut self, id: Id) {
        self.questions.remove(&id);
        self.votes.retain(|_, v| v.question_id != id);
    }
}

#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<Arc<PathBuf>>,
}

impl InMemRepo {
    /// Store persisted under `TOT_DATA_DIR` (default `data/`).
    pub fn new() -> Self {
        let dir = std::env::var("TOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        Self::with_snapshot(dir.join(SNAPSHOT_FILE))
    }

    pub fn with_snapshot(path: PathBuf) -> Self {
        let state = Self::load_state_from(&path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(Arc::new(path)),
        }
    }

    /// Store that never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self { state: Arc::new(RwLock::new(State::default())), snapshot_path: None }
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    info!("loaded snapshot '{}'", path.display());
                    s
                }
                Err(e) => {
                    warn!("failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            },
            Err(e) => {
                info!("no snapshot at '{}': {e}. Starting empty.", path.display());
                State::default()
            }
        }
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_deref() else { return };
        let bytes = match self.state.read() {
            Ok(s) => serde_json::to_vec_pretty(&*s),
            Err(_) => return,
        };
        match bytes {
            Ok(bytes) => {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
            Err(e) => warn!("failed to encode snapshot: {e}"),
        }
    }
}

impl Default for InMemRepo {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl CategoryRepo for InMemRepo {
    async fn list_categories(&self, query: &CategoryQuery) -> RepoResult<Vec<Category>> {
        let s = self.read()?;
        Ok(s.categories.values().filter(|c| query.matches(c)).cloned().collect())
    }

    async fn get_category(&self, id: Id) -> RepoResult<Category> {
        self.read()?.categories.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
        let mut s = self.write()?;
        let id = s.next_id();
        let category = Category {
            id,
            name: new.name,
            icon: new.icon,
            description: new.description,
            is_active: new.is_active,
            created_at: Utc::now(),
        };
        s.categories.insert(id, category.clone());
        drop(s); // release lock before persisting
        self.persist();
        Ok(category)
    }

    async fn update_category(&self, id: Id, upd: UpdateCategory) -> RepoResult<Category> {
        let mut s = self.write()?;
        let c = s.categories.get_mut(&id).ok_or(RepoError::NotFound)?;
        if let Some(name) = upd.name { c.name = name; }
        if let Some(icon) = upd.icon { c.icon = icon; }
        if let Some(description) = upd.description { c.description = description; }
        if let Some(active) = upd.is_active { c.is_active = active; }
        let updated = c.clone();
        drop(s);
        self.persist();
        Ok(updated)
    }

    async fn delete_category(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.categories.remove(&id).is_none() {
            return Err(RepoError::NotFound);
        }
        let doomed: Vec<Id> = s.questions.values().filter(|q| q.category_id == id).map(|q| q.id).collect();
        for qid in doomed {
            s.drop_question(qid);
        }
        drop(s);
        self.persist();
        Ok(())
    }
}

#[async_trait]
impl QuestionRepo for InMemRepo {
    async fn list_questions(&self, query: &QuestionQuery) -> RepoResult<Vec<Question>> {
        let s = self.read()?;
        Ok(s.questions.values().filter(|q| query.matches(q)).cloned().collect())
    }

    async fn get_question(&self, id: Id) -> RepoResult<Question> {
        self.read()?.questions.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_question(&self, new: NewQuestion) -> RepoResult<Question> {
        let mut s = self.write()?;
        if !s.categories.contains_key(&new.category_id) { return Err(RepoError::NotFound); }
        let id = s.next_id();
        let question = Question {
            id,
            category_id: new.category_id,
            option_a: new.option_a,
            option_b: new.option_b,
            option_a_image: new.option_a_image,
            option_b_image: new.option_b_image,
            votes_a: 0,
            votes_b: 0,
            is_active: new.is_active,
            featured: new.featured,
            created_at: Utc::now(),
        };
        s.questions.insert(id, question.clone());
        drop(s);
        self.persist();
        Ok(question)
    }

    async fn update_question(&self, id: Id, upd: UpdateQuestion) -> RepoResult<Question> {
        let mut s = self.write()?;
        if let Some(cat) = upd.category_id {
            if !s.categories.contains_key(&cat) { return Err(RepoError::NotFound); }
        }
        let q = s.questions.get_mut(&id).ok_or(RepoError::NotFound)?;
        if let Some(cat) = upd.category_id { q.category_id = cat; }
        if let Some(a) = upd.option_a { q.option_a = a; }
        if let Some(b) = upd.option_b { q.option_b = b; }
        if let Some(img) = upd.option_a_image { q.option_a_image = Some(img).filter(|url| !url.is_empty()); }
        if let Some(img) = upd.option_b_image { q.option_b_image = Some(img).filter(|url| !url.is_empty()); }
        if let Some(active) = upd.is_active { q.is_active = active; }
        if let Some(featured) = upd.featured { q.featured = featured; }
        let updated = q.clone();
        drop(s);
        self.persist();
        Ok(updated)
    }

    async fn delete_question(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if !s.questions.contains_key(&id) { return Err(RepoError::NotFound); }
        s.drop_question(id);
        drop(s);
        self.persist();
        Ok(())
    }
}

#[async_trait]
impl VoteRepo for InMemRepo {
    async fn cast_vote(&self, question_id: Id, identity: &Identity, choice: VoteChoice, meta: VoteMeta) -> RepoResult<CastVote> {
        let mut s = self.write()?;
        if !s.questions.contains_key(&question_id) { return Err(RepoError::NotFound); }

        let existing = s
            .votes
            .values()
            .find(|v| v.question_id == question_id && v.identity() == *identity)
            .map(|v| (v.id, v.choice));

        let outcome = match existing {
            None => {
                let id = s.next_id();
                s.votes.insert(id, Vote {
                    id,
                    question_id,
                    user_id: identity.user_id().map(str::to_string),
                    session_key: identity.session_key().map(str::to_string),
                    choice,
                    voted_at: Utc::now(),
                    user_agent: meta.user_agent,
                    ip_address: meta.ip_address,
                });
                VoteOutcome::Created(choice)
            }
            Some((_, previous)) if previous == choice => VoteOutcome::Unchanged(choice),
            Some((vote_id, previous)) => {
                if let Some(v) = s.votes.get_mut(&vote_id) {
                    v.choice = choice;
                    v.voted_at = Utc::now();
                    v.user_agent = meta.user_agent;
                    v.ip_address = meta.ip_address;
                }
                VoteOutcome::Changed { from: previous, to: choice }
            }
        };

        let (da, db) = outcome.deltas();
        let q = s.questions.get_mut(&question_id).ok_or(RepoError::NotFound)?;
        q.votes_a += da;
        q.votes_b += db;
        let tally = q.tally();
        drop(s);
        if !matches!(outcome, VoteOutcome::Unchanged(_)) {
            self.persist();
        }
        Ok(CastVote { outcome, tally })
    }

    async fn identity_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<Vec<Vote>> {
        let s = self.read()?;
        Ok(s.votes
            .values()
            .filter(|v| v.identity() == *identity && s.category_of(v.question_id) == Some(category_id))
            .cloned()
            .collect())
    }

    async fn reset_votes(&self, identity: &Identity, category_id: Id) -> RepoResult<u64> {
        let mut s = self.write()?;
        let doomed: Vec<(Id, Id, VoteChoice)> = s
            .votes
            .values()
            .filter(|v| v.identity() == *identity && s.category_of(v.question_id) == Some(category_id))
            .map(|v| (v.id, v.question_id, v.choice))
            .collect();
        for (vote_id, question_id, choice) in &doomed {
            s.votes.remove(vote_id);
            if let Some(q) = s.questions.get_mut(question_id) {
                let (da, db) = VoteOutcome::Created(*choice).deltas();
                q.votes_a -= da;
                q.votes_b -= db;
            }
        }
        drop(s);
        if !doomed.is_empty() {
            self.persist();
        }
        Ok(doomed.len() as u64)
    }

    async fn list_votes(&self, query: &VoteQuery) -> RepoResult<Vec<Vote>> {
        let s = self.read()?;
        Ok(s.votes
            .values()
            .filter(|v| query.matches(v, s.questions.get(&v.question_id)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AnalyticsRepo for InMemRepo {
    async fn count_votes(&self, filter: VoteFilter) -> RepoResult<i64> {
        let s = self.read()?;
        Ok(s.votes.values().filter(|v| s.vote_matches(v, &filter)).count() as i64)
    }

    async fn count_active_voters(&self, since: DateTime<Utc>) -> RepoResult<i64> {
        let s = self.read()?;
        let mut users: Vec<&str> = s
            .votes
            .values()
            .filter(|v| v.voted_at >= since)
            .filter_map(|v| v.user_id.as_deref())
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users.len() as i64)
    }

    async fn votes_by_category(&self) -> RepoResult<Vec<CategoryVotes>> {
        let s = self.read()?;
        let mut counts: BTreeMap<Id, i64> = BTreeMap::new();
        for v in s.votes.values() {
            if let Some(cat) = s.category_of(v.question_id) {
                *counts.entry(cat).or_default() += 1;
            }
        }
        let mut rows: Vec<CategoryVotes> = counts
            .into_iter()
            .filter_map(|(cat, votes)| {
                s.categories.get(&cat).map(|c| CategoryVotes {
                    category_id: c.id,
                    name: c.name.clone(),
                    icon: c.icon.clone(),
                    votes,
                })
            })
            .collect();
        // stable sort keeps id order among equal counts
        rows.sort_by(|a, b| b.votes.cmp(&a.votes));
        Ok(rows)
    }

    async fn trending_questions(&self, since: DateTime<Utc>, limit: usize) -> RepoResult<Vec<TrendingQuestion>> {
        let s = self.read()?;
        let mut recent: HashMap<Id, i64> = HashMap::new();
        for v in s.votes.values().filter(|v| v.voted_at >= since) {
            *recent.entry(v.question_id).or_default() += 1;
        }
        let mut rows: Vec<TrendingQuestion> = s
            .questions
            .values()
            .filter(|q| q.is_active)
            .filter_map(|q| recent.get(&q.id).map(|n| TrendingQuestion { question: q.clone(), recent_votes: *n }))
            .collect();
        rows.sort_by(|a, b| b.recent_votes.cmp(&a.recent_votes));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn daily_vote_counts(&self, start: NaiveDate, end: NaiveDate, category_id: Option<Id>) -> RepoResult<Vec<DayCount>> {
        let s = self.read()?;
        let filter = VoteFilter { since: None, category_id };
        let mut days: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for v in s.votes.values().filter(|v| s.vote_matches(v, &filter)) {
            let day = v.voted_at.date_naive();
            if day >= start && day <= end {
                *days.entry(day).or_default() += 1;
            }
        }
        Ok(days.into_iter().map(|(day, votes)| DayCount { day, votes }).collect())
    }

    async fn hourly_vote_counts(&self, category_id: Option<Id>) -> RepoResult<Vec<HourCount>> {
        let s = self.read()?;
        let filter = VoteFilter { since: None, category_id };
        let mut hours: BTreeMap<i32, i64> = BTreeMap::new();
        for v in s.votes.values().filter(|v| s.vote_matches(v, &filter)) {
            *hours.entry(v.voted_at.hour() as i32).or_default() += 1;
        }
        Ok(hours.into_iter().map(|(hour, votes)| HourCount { hour, votes }).collect())
    }
}

#[async_trait]
impl PollRepo for InMemRepo {
    async fn list_polls(&self) -> RepoResult<Vec<Poll>> {
        let s = self.read()?;
        let mut v: Vec<Poll> = s.polls.values().cloned().collect();
        v.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));
        Ok(v)
    }

    async fn latest_polls(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<Poll>> {
        let s = self.read()?;
        let mut v: Vec<Poll> = s.polls.values().filter(|p| p.is_published(now)).cloned().collect();
        v.sort_by(|a, b| b.pub_date.cmp(&a.pub_date)); // latest first
        v.truncate(limit);
        Ok(v)
    }

    async fn get_poll(&self, id: Id) -> RepoResult<PollDetail> {
        let s = self.read()?;
        let poll = s.polls.get(&id).cloned().ok_or(RepoError::NotFound)?;
        let choices = s.poll_choices.values().filter(|c| c.poll_id == id).cloned().collect();
        Ok(PollDetail { poll, choices })
    }

    async fn create_poll(&self, new: NewPoll) -> RepoResult<PollDetail> {
        let mut s = self.write()?;
        let id = s.next_id();
        let poll = Poll {
            id,
            question_text: new.question_text,
            pub_date: new.pub_date.unwrap_or_else(Utc::now),
        };
        s.polls.insert(id, poll.clone());
        let mut choices = Vec::with_capacity(new.choices.len());
        for text in new.choices {
            let choice_id = s.next_id();
            let choice = PollChoice { id: choice_id, poll_id: id, choice_text: text, votes: 0 };
            s.poll_choices.insert(choice_id, choice.clone());
            choices.push(choice);
        }
        drop(s);
        self.persist();
        Ok(PollDetail { poll, choices })
    }

    async fn delete_poll(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.polls.remove(&id).is_none() { return Err(RepoError::NotFound); }
        s.poll_choices.retain(|_, c| c.poll_id != id);
        drop(s);
        self.persist();
        Ok(())
    }

    async fn vote_poll_choice(&self, poll_id: Id, choice_id: Id) -> RepoResult<PollChoice> {
        let mut s = self.write()?;
        let choice = s
            .poll_choices
            .get_mut(&choice_id)
            .filter(|c| c.poll_id == poll_id)
            .ok_or(RepoError::NotFound)?;
        choice.votes += 1;
        let updated = choice.clone();
        drop(s);
        self.persist();
        Ok(updated)
    }
}
