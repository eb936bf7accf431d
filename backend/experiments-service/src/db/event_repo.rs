use crate::db::aggregate_repo::{AggregateFold, AggregateRepo};
use crate::error::Result;
use crate::models::{Event, NewEvent};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use transactional_outbox::{publish_event, SqlxOutboxRepository};
use uuid::Uuid;

pub struct EventRepo {
    pool: PgPool,
    outbox_repo: Option<Arc<SqlxOutboxRepository>>,
    aggregate_repo: Option<Arc<AggregateRepo>>,
}

/// Resolution of an event against the matching assignment, looked up by the
/// caller before inserting. `None` means the user has no assignment yet -
/// the event is still stored, just never counted in valid-only aggregates.
pub struct AssignmentResolution {
    pub variant_id: Option<Uuid>,
    pub assignment_at: Option<DateTime<Utc>>,
}

impl EventRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            outbox_repo: None,
            aggregate_repo: None,
        }
    }

    pub fn with_outbox(pool: PgPool, outbox_repo: Arc<SqlxOutboxRepository>) -> Self {
        Self {
            pool,
            outbox_repo: Some(outbox_repo),
            aggregate_repo: None,
        }
    }

    /// Fold every valid event into `event_aggregates` as it's inserted (see
    /// component C6's Aggregates sub-component).
    pub fn with_aggregates(mut self, aggregate_repo: Arc<AggregateRepo>) -> Self {
        self.aggregate_repo = Some(aggregate_repo);
        self
    }

    pub async fn insert(&self, event: &NewEvent, resolution: AssignmentResolution) -> Result<Event> {
        let mut tx = self.pool.begin().await?;

        let ts = event.ts.unwrap_or_else(Utc::now);
        let properties = event.properties.clone().unwrap_or_else(|| json!({}));

        let row = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events
                (experiment_id, user_id, variant_id, event_type, ts, assignment_at,
                 properties, session_id, request_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, experiment_id, user_id, variant_id, event_type, ts,
                      assignment_at, properties, session_id, request_id
            "#,
        )
        .bind(event.experiment_id)
        .bind(&event.user_id)
        .bind(resolution.variant_id)
        .bind(&event.event_type)
        .bind(ts)
        .bind(resolution.assignment_at)
        .bind(&properties)
        .bind(&event.session_id)
        .bind(&event.request_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(outbox) = &self.outbox_repo {
            publish_event!(
                &mut tx,
                outbox.as_ref(),
                "event",
                row.id,
                "event.recorded",
                json!({
                    "event_id": row.id,
                    "experiment_id": row.experiment_id,
                    "user_id": row.user_id,
                    "variant_id": row.variant_id,
                    "event_type": row.event_type,
                    "ts": row.ts,
                    "assignment_at": row.assignment_at,
                    "properties": row.properties,
                })
            )?;
        }

        if let (Some(aggregate_repo), Some(experiment_id), Some(variant_id)) =
            (&self.aggregate_repo, row.experiment_id, row.variant_id)
        {
            if row.is_valid() {
                let value = row.properties.get("value").and_then(|v| v.as_f64());
                let session_duration_seconds = row
                    .properties
                    .get("session_duration_seconds")
                    .and_then(|v| v.as_f64());
                aggregate_repo
                    .record(
                        &mut tx,
                        AggregateFold {
                            experiment_id,
                            variant_id,
                            ts: row.ts,
                            event_type: &row.event_type,
                            user_id: &row.user_id,
                            session_id: row.session_id.as_deref(),
                            value,
                            session_duration_seconds,
                        },
                    )
                    .await?;
            }
        }

        tx.commit().await?;

        Ok(row)
    }
}
