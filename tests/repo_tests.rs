#![cfg(feature = "inmem-store")]

use chrono::{Duration, Utc};
use tot::{
    identity::Identity,
    models::{NewCategory, NewPoll, NewQuestion, UpdateCategory, UpdateQuestion, VoteChoice, VoteMeta, VoteOutcome},
    repo::{inmem::InMemRepo, RepoError, VoteFilter},
};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use tot::repo::{AnalyticsRepo, CategoryQuery, CategoryRepo, PollRepo, QuestionQuery, QuestionRepo, VoteQuery, VoteRepo};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    InMemRepo::ephemeral()
}

fn new_category(name: &str) -> NewCategory {
    NewCategory { name: name.into(), icon: "🍕".into(), description: String::new(), is_active: true }
}

fn new_question(category_id: i64, a: &str, b: &str) -> NewQuestion {
    NewQuestion {
        category_id,
        option_a: a.into(),
        option_b: b.into(),
        option_a_image: None,
        option_b_image: None,
        is_active: true,
        featured: false,
    }
}

fn anon(token: &str) -> Identity {
    Identity::AnonymousSession(token.into())
}

#[tokio::test]
async fn category_crud() {
    let r = repo();

    // starts empty
    assert!(r.list_categories(&CategoryQuery::default()).await.unwrap().is_empty());

    let c = r.create_category(new_category("Food")).await.unwrap();
    assert_eq!(c.name, "Food");
    assert_eq!(c.label(), "🍕 Food");

    let updated = r
        .update_category(c.id, UpdateCategory { name: Some("Snacks".into()), is_active: Some(false), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(updated.name, "Snacks");
    assert!(!updated.is_active);
    assert!(r.list_categories(&CategoryQuery::active()).await.unwrap().is_empty());
    assert_eq!(r.list_categories(&CategoryQuery::default()).await.unwrap().len(), 1);

    assert!(matches!(r.get_category(9999).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn question_requires_existing_category() {
    let r = repo();
    let err = r.create_question(new_question(42, "Cats", "Dogs")).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound));
}

#[tokio::test]
async fn question_update_keeps_counters() {
    let r = repo();
    let c = r.create_category(new_category("Pets")).await.unwrap();
    let q = r.create_question(new_question(c.id, "Cats", "Dogs")).await.unwrap();
    r.cast_vote(q.id, &anon("s1"), VoteChoice::A, VoteMeta::default()).await.unwrap();

    let q = r
        .update_question(q.id, UpdateQuestion { option_b: Some("Wolves".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(q.title(), "Cats vs Wolves");
    assert_eq!((q.votes_a, q.votes_b), (1, 0));
}

#[tokio::test]
async fn delete_category_cascades() {
    let r = repo();
    let c = r.create_category(new_category("Travel")).await.unwrap();
    let q = r.create_question(new_question(c.id, "Beach", "Mountains")).await.unwrap();
    r.cast_vote(q.id, &anon("s1"), VoteChoice::B, VoteMeta::default()).await.unwrap();

    r.delete_category(c.id).await.unwrap();
    assert!(matches!(r.get_question(q.id).await, Err(RepoError::NotFound)));
    assert!(r.list_votes(&VoteQuery::default()).await.unwrap().is_empty());
    assert!(matches!(r.delete_category(c.id).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn vote_create_change_and_noop() {
    let r = repo();
    let c = r.create_category(new_category("Drinks")).await.unwrap();
    let q = r.create_question(new_question(c.id, "Coffee", "Tea")).await.unwrap();
    let me = anon("abc");

    let first = r.cast_vote(q.id, &me, VoteChoice::A, VoteMeta::default()).await.unwrap();
    assert_eq!(first.outcome, VoteOutcome::Created(VoteChoice::A));
    assert_eq!((first.tally.votes_a, first.tally.votes_b), (1, 0));
    let voted_at = r.list_votes(&VoteQuery::question(q.id)).await.unwrap()[0].voted_at;

    let same = r.cast_vote(q.id, &me, VoteChoice::A, VoteMeta::default()).await.unwrap();
    assert_eq!(same.outcome, VoteOutcome::Unchanged(VoteChoice::A));
    assert_eq!((same.tally.votes_a, same.tally.votes_b), (1, 0));
    assert_eq!(r.list_votes(&VoteQuery::question(q.id)).await.unwrap()[0].voted_at, voted_at);

    let switched = r.cast_vote(q.id, &me, VoteChoice::B, VoteMeta::default()).await.unwrap();
    assert_eq!(switched.outcome, VoteOutcome::Changed { from: VoteChoice::A, to: VoteChoice::B });
    assert_eq!((switched.tally.votes_a, switched.tally.votes_b), (0, 1));

    let votes = r.list_votes(&VoteQuery::question(q.id)).await.unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].choice, VoteChoice::B);
    assert_eq!(votes[0].session_key.as_deref(), Some("abc"));
    assert!(votes[0].user_id.is_none());
}

#[tokio::test]
async fn user_and_session_with_same_token_are_distinct() {
    let r = repo();
    let c = r.create_category(new_category("Music")).await.unwrap();
    let q = r.create_question(new_question(c.id, "Rock", "Jazz")).await.unwrap();

    r.cast_vote(q.id, &Identity::User("x".into()), VoteChoice::A, VoteMeta::default()).await.unwrap();
    let cast = r.cast_vote(q.id, &anon("x"), VoteChoice::A, VoteMeta::default()).await.unwrap();
    assert_eq!(cast.tally.votes_a, 2);
}

#[tokio::test]
async fn reset_removes_votes_and_decrements() {
    let r = repo();
    let food = r.create_category(new_category("Food")).await.unwrap();
    let other = r.create_category(new_category("Other")).await.unwrap();
    let q1 = r.create_question(new_question(food.id, "Pizza", "Burger")).await.unwrap();
    let q2 = r.create_question(new_question(food.id, "Sushi", "Tacos")).await.unwrap();
    let q3 = r.create_question(new_question(other.id, "Day", "Night")).await.unwrap();
    let me = anon("me");
    let you = anon("you");

    r.cast_vote(q1.id, &me, VoteChoice::A, VoteMeta::default()).await.unwrap();
    r.cast_vote(q2.id, &me, VoteChoice::B, VoteMeta::default()).await.unwrap();
    r.cast_vote(q3.id, &me, VoteChoice::A, VoteMeta::default()).await.unwrap();
    r.cast_vote(q1.id, &you, VoteChoice::A, VoteMeta::default()).await.unwrap();

    assert_eq!(r.reset_votes(&me, food.id).await.unwrap(), 2);
    assert!(r.identity_votes(&me, food.id).await.unwrap().is_empty());
    assert_eq!(r.identity_votes(&me, other.id).await.unwrap().len(), 1);

    let q1 = r.get_question(q1.id).await.unwrap();
    let q2 = r.get_question(q2.id).await.unwrap();
    assert_eq!((q1.votes_a, q1.votes_b), (1, 0));
    assert_eq!((q2.votes_a, q2.votes_b), (0, 0));

    // nothing left to remove
    assert_eq!(r.reset_votes(&me, food.id).await.unwrap(), 0);
}

#[tokio::test]
async fn analytics_counts() {
    let r = repo();
    let food = r.create_category(new_category("Food")).await.unwrap();
    let pets = r.create_category(new_category("Pets")).await.unwrap();
    let q1 = r.create_question(new_question(food.id, "Pizza", "Burger")).await.unwrap();
    let q2 = r.create_question(new_question(pets.id, "Cats", "Dogs")).await.unwrap();

    r.cast_vote(q1.id, &anon("a"), VoteChoice::A, VoteMeta::default()).await.unwrap();
    r.cast_vote(q1.id, &anon("b"), VoteChoice::B, VoteMeta::default()).await.unwrap();
    r.cast_vote(q2.id, &Identity::User("1:ann".into()), VoteChoice::A, VoteMeta::default()).await.unwrap();

    assert_eq!(r.count_votes(VoteFilter::default()).await.unwrap(), 3);
    assert_eq!(r.count_votes(VoteFilter { since: None, category_id: Some(food.id) }).await.unwrap(), 2);
    let future = Some(Utc::now() + Duration::hours(1));
    assert_eq!(r.count_votes(VoteFilter { since: future, category_id: None }).await.unwrap(), 0);

    // only registered users count as active
    assert_eq!(r.count_active_voters(Utc::now() - Duration::days(7)).await.unwrap(), 1);

    let by_cat = r.votes_by_category().await.unwrap();
    assert_eq!(by_cat[0].name, "Food");
    assert_eq!(by_cat[0].votes, 2);
    assert_eq!(by_cat[1].votes, 1);

    let trending = r.trending_questions(Utc::now() - Duration::days(1), 10).await.unwrap();
    assert_eq!(trending[0].question.id, q1.id);
    assert_eq!(trending[0].recent_votes, 2);

    let today = Utc::now().date_naive();
    let daily = r.daily_vote_counts(today - Duration::days(30), today, None).await.unwrap();
    assert_eq!(daily.iter().map(|d| d.votes).sum::<i64>(), 3);
    let hourly = r.hourly_vote_counts(Some(pets.id)).await.unwrap();
    assert_eq!(hourly.iter().map(|h| h.votes).sum::<i64>(), 1);
}

#[tokio::test]
async fn list_queries_filter_and_search() {
    let r = repo();
    let food = r.create_category(NewCategory { description: "Things to eat".into(), ..new_category("Food") }).await.unwrap();
    let tech = r
        .create_category(NewCategory { is_active: false, ..new_category("Tech") })
        .await
        .unwrap();
    let pizza = r.create_question(new_question(food.id, "Pizza", "Burger")).await.unwrap();
    let tacos = r.create_question(NewQuestion { featured: true, ..new_question(food.id, "Tacos", "Sushi") }).await.unwrap();
    let os = r.create_question(NewQuestion { is_active: false, ..new_question(tech.id, "Linux", "Windows") }).await.unwrap();

    let names = |cs: Vec<tot::models::Category>| cs.into_iter().map(|c| c.name).collect::<Vec<_>>();
    assert_eq!(names(r.list_categories(&CategoryQuery { search: Some("EAT".into()), ..Default::default() }).await.unwrap()), vec!["Food"]);
    assert_eq!(names(r.list_categories(&CategoryQuery { active: Some(false), ..Default::default() }).await.unwrap()), vec!["Tech"]);

    let ids = |qs: Vec<tot::models::Question>| qs.into_iter().map(|q| q.id).collect::<Vec<_>>();
    assert_eq!(ids(r.list_questions(&QuestionQuery { featured: Some(true), ..Default::default() }).await.unwrap()), vec![tacos.id]);
    assert_eq!(ids(r.list_questions(&QuestionQuery { active: Some(false), ..Default::default() }).await.unwrap()), vec![os.id]);
    assert_eq!(ids(r.list_questions(&QuestionQuery { search: Some("burg".into()), ..Default::default() }).await.unwrap()), vec![pizza.id]);
    // every term has to match somewhere
    assert!(r.list_questions(&QuestionQuery { search: Some("pizza linux".into()), ..Default::default() }).await.unwrap().is_empty());
    assert_eq!(r.list_questions(&QuestionQuery::active_in(food.id)).await.unwrap().len(), 2);

    r.cast_vote(pizza.id, &Identity::User("7:ann".into()), VoteChoice::A, VoteMeta::default()).await.unwrap();
    r.cast_vote(tacos.id, &anon("s1"), VoteChoice::B, VoteMeta::default()).await.unwrap();
    r.cast_vote(os.id, &anon("s1"), VoteChoice::B, VoteMeta::default()).await.unwrap();

    let vote_q = |v: Vec<tot::models::Vote>| v.into_iter().map(|v| v.question_id).collect::<Vec<_>>();
    assert_eq!(vote_q(r.list_votes(&VoteQuery { category_id: Some(tech.id), ..Default::default() }).await.unwrap()), vec![os.id]);
    assert_eq!(vote_q(r.list_votes(&VoteQuery { choice: Some(VoteChoice::A), ..Default::default() }).await.unwrap()), vec![pizza.id]);
    assert_eq!(vote_q(r.list_votes(&VoteQuery { search: Some("ann".into()), ..Default::default() }).await.unwrap()), vec![pizza.id]);
    assert_eq!(vote_q(r.list_votes(&VoteQuery { search: Some("sushi".into()), ..Default::default() }).await.unwrap()), vec![tacos.id]);
}

#[tokio::test]
async fn polls_flow() {
    let r = repo();
    let now = Utc::now();
    let live = r
        .create_poll(NewPoll { question_text: "What's new?".into(), pub_date: Some(now - Duration::hours(1)), choices: vec!["Not much".into(), "The sky".into()] })
        .await
        .unwrap();
    r.create_poll(NewPoll { question_text: "Future".into(), pub_date: Some(now + Duration::days(1)), choices: vec![] })
        .await
        .unwrap();

    let latest = r.latest_polls(now, 5).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, live.poll.id);

    // the full list includes scheduled polls, newest first
    let all = r.list_polls().await.unwrap();
    assert_eq!(all.iter().map(|p| p.question_text.as_str()).collect::<Vec<_>>(), vec!["Future", "What's new?"]);

    let choice = &live.choices[1];
    let voted = r.vote_poll_choice(live.poll.id, choice.id).await.unwrap();
    assert_eq!(voted.votes, 1);

    // a choice of another poll is rejected
    let other = r
        .create_poll(NewPoll { question_text: "Other".into(), pub_date: None, choices: vec!["x".into()] })
        .await
        .unwrap();
    assert!(matches!(r.vote_poll_choice(live.poll.id, other.choices[0].id).await, Err(RepoError::NotFound)));

    r.delete_poll(live.poll.id).await.unwrap();
    assert!(matches!(r.get_poll(live.poll.id).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn snapshot_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let r = InMemRepo::with_snapshot(path.clone());
    let c = r.create_category(new_category("Saved")).await.unwrap();

    let reloaded = InMemRepo::with_snapshot(path);
    assert_eq!(reloaded.get_category(c.id).await.unwrap().name, "Saved");
}
