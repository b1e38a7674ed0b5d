#![cfg(feature = "postgres-store")]

use sqlx::postgres::PgPoolOptions;
use tot::identity::Identity;
use tot::models::{NewCategory, NewQuestion, VoteChoice, VoteMeta, VoteOutcome};
use tot::repo::pg::PgRepo;
use tot::repo::{CategoryRepo, QuestionRepo, VoteQuery, VoteRepo};

async fn pg_repo() -> Option<PgRepo> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await
        .ok()?;
    sqlx::migrate!("./migrations").run(&pool).await.ok()?;
    Some(PgRepo::new(pool))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[serial_test::serial]
async fn concurrent_votes_keep_counters_consistent() {
    let Some(repo) = pg_repo().await else { eprintln!("skip: no DATABASE_URL"); return; };
    let cat = repo
        .create_category(NewCategory { name: unique("pg"), icon: "🎯".into(), description: String::new(), is_active: true })
        .await
        .unwrap();
    let q = repo
        .create_question(NewQuestion {
            category_id: cat.id,
            option_a: "A".into(),
            option_b: "B".into(),
            option_a_image: None,
            option_b_image: None,
            is_active: true,
            featured: false,
        })
        .await
        .unwrap();

    // the same session races itself; exactly one row must win
    let me = Identity::AnonymousSession(unique("sess"));
    let q_id = q.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        let me = me.clone();
        handles.push(tokio::spawn(async move { repo.cast_vote(q_id, &me, VoteChoice::A, VoteMeta::default()).await }));
    }
    let mut created = 0;
    for h in handles {
        if let VoteOutcome::Created(_) = h.await.unwrap().unwrap().outcome {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let switched = repo.cast_vote(q.id, &me, VoteChoice::B, VoteMeta::default()).await.unwrap();
    assert_eq!((switched.tally.votes_a, switched.tally.votes_b), (0, 1));

    assert_eq!(repo.reset_votes(&me, cat.id).await.unwrap(), 1);
    let q = repo.get_question(q.id).await.unwrap();
    assert_eq!((q.votes_a, q.votes_b), (0, 0));

    repo.delete_category(cat.id).await.unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn vote_racing_reset_never_reports_missing_question() {
    let Some(repo) = pg_repo().await else { eprintln!("skip: no DATABASE_URL"); return; };
    let cat = repo
        .create_category(NewCategory { name: unique("race"), icon: "🎯".into(), description: String::new(), is_active: true })
        .await
        .unwrap();
    let q = repo
        .create_question(NewQuestion {
            category_id: cat.id,
            option_a: "Left".into(),
            option_b: "Right".into(),
            option_a_image: None,
            option_b_image: None,
            is_active: true,
            featured: false,
        })
        .await
        .unwrap();
    let me = Identity::AnonymousSession(unique("sess"));
    repo.cast_vote(q.id, &me, VoteChoice::A, VoteMeta::default()).await.unwrap();

    let (cat_id, q_id) = (cat.id, q.id);
    let mut handles = Vec::new();
    for i in 0..16 {
        let repo = repo.clone();
        let me = me.clone();
        let choice = if i % 2 == 0 { VoteChoice::A } else { VoteChoice::B };
        handles.push(tokio::spawn(async move {
            let reset = repo.reset_votes(&me, cat_id).await.map(|_| ());
            let voted = repo.cast_vote(q_id, &me, choice, VoteMeta::default()).await.map(|_| ());
            (reset, voted)
        }));
    }
    for h in handles {
        let (reset, voted) = h.await.unwrap();
        reset.unwrap();
        voted.unwrap();
    }

    // counters still equal the rows left behind
    let rows = repo.list_votes(&VoteQuery::question(q.id)).await.unwrap();
    let q = repo.get_question(q.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(q.votes_a + q.votes_b, 1);

    repo.delete_category(cat.id).await.unwrap();
}
