//! S5 (outbox survives crash): replaying outbox records through the
//! repository's replay primitives must be safe to call repeatedly -
//! `replay_since`/`replay_range` only re-flag rows for redelivery, they
//! never duplicate or mutate the underlying business rows. Requires a
//! live Postgres with migrations applied.

use experiments_service::db::{ExperimentRepo, NewVariant};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use transactional_outbox::SqlxOutboxRepository;
use uuid::Uuid;

async fn test_pool() -> sqlx::PgPool {
    let url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/experiments_test".to_string());
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn replaying_the_same_window_twice_does_not_duplicate_outbox_rows() {
    let pool = test_pool().await;
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let experiment_repo = ExperimentRepo::with_outbox(pool.clone(), outbox_repo.clone());

    let (before_pending, _) = outbox_repo
        .pending_stats()
        .await
        .expect("pending_stats failed");

    experiment_repo
        .create(
            &format!("s5-{}", Uuid::new_v4()),
            "S5 outbox replay",
            "s5-seed",
            None,
            None,
            serde_json::json!({}),
            &[NewVariant {
                key: "only".into(),
                name: "Only".into(),
                allocation_pct: 100,
                is_control: true,
                config: serde_json::json!({}),
            }],
        )
        .await
        .expect("experiment creation failed");

    let (after_pending, _) = outbox_repo
        .pending_stats()
        .await
        .expect("pending_stats failed");
    assert_eq!(
        after_pending,
        before_pending + 1,
        "creating one experiment must publish exactly one outbox row"
    );

    let now = chrono::Utc::now();
    let since = now - chrono::Duration::minutes(5);

    let first_replay = outbox_repo
        .replay_since(since)
        .await
        .expect("first replay failed");
    let second_replay = outbox_repo
        .replay_since(since)
        .await
        .expect("second replay failed");

    assert_eq!(
        first_replay, second_replay,
        "replaying the same window twice must re-flag the same row count, not grow it"
    );

    let (final_pending, _) = outbox_repo
        .pending_stats()
        .await
        .expect("pending_stats failed");
    assert_eq!(
        final_pending, after_pending,
        "replay must not create or duplicate outbox rows, only mark them for redelivery"
    );
}
