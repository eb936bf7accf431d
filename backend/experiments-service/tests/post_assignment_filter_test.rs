//! S4 (post-assignment filter): only events at or after the assignment
//! timestamp count as valid, matching `Event::is_valid`. Exercised here
//! through the real ingestion path rather than the model unit directly,
//! since the denormalized `assignment_at` is populated by `EventIngestor`,
//! not by the caller. Requires a live Postgres with migrations applied.

use experiments_service::db::{AssignmentRepo, ExperimentRepo, EventRepo, NewVariant};
use experiments_service::models::{AssignmentSource, NewEvent};
use experiments_service::services::EventIngestor;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
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
async fn events_before_assignment_are_excluded_from_validity() {
    let pool = test_pool().await;
    let experiment_repo = ExperimentRepo::new(pool.clone());
    let assignment_repo = Arc::new(AssignmentRepo::new(pool.clone()));
    let event_repo = Arc::new(EventRepo::new(pool.clone()));

    let (experiment, variants) = experiment_repo
        .create(
            &format!("s4-{}", Uuid::new_v4()),
            "S4 post-assignment filter",
            "s4-seed",
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
    let variant = &variants[0];

    let assignment = assignment_repo
        .get_or_insert(
            experiment.id,
            "u-2",
            variant.id,
            experiment.version,
            AssignmentSource::Forced,
            serde_json::json!({}),
        )
        .await
        .expect("assignment failed");

    let ingestor = EventIngestor::new(event_repo.clone(), assignment_repo.clone());

    let before = ingestor
        .record(NewEvent {
            experiment_id: Some(experiment.id),
            user_id: "u-2".to_string(),
            event_type: "click".to_string(),
            ts: Some(assignment.assigned_at - chrono::Duration::seconds(10)),
            properties: None,
            session_id: None,
            request_id: None,
        })
        .await
        .expect("ingest failed");

    let after = ingestor
        .record(NewEvent {
            experiment_id: Some(experiment.id),
            user_id: "u-2".to_string(),
            event_type: "click".to_string(),
            ts: Some(assignment.assigned_at + chrono::Duration::seconds(10)),
            properties: None,
            session_id: None,
            request_id: None,
        })
        .await
        .expect("ingest failed");

    assert!(
        !before.is_valid(),
        "event recorded before the assignment must not count toward results"
    );
    assert!(
        after.is_valid(),
        "event recorded after the assignment must count toward results"
    );
}
