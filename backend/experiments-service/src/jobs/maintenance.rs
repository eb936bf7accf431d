//! Component C9 (partial): periodic housekeeping that isn't on the hot
//! path for any request - trimming published outbox rows and aged-out
//! events/projections per the configured retention windows.
//!
//! Partition management (dropping whole monthly partitions of `events` and
//! `projected_events` once their retention window lapses) is left to the
//! operator's partition-maintenance tooling; this job only prunes rows
//! within the current partition scheme via plain `DELETE`s, which is safe
//! at the retention's multi-day granularity but not as cheap as a
//! partition drop at scale.

use crate::error::Result;
use sqlx::PgPool;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub outbox_retention_days: i64,
    pub events_retention_days: i64,
    pub interval: Duration,
}

impl MaintenanceConfig {
    pub fn from_env() -> Self {
        Self {
            outbox_retention_days: std::env::var("RETENTION_OUTBOX_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(14),
            events_retention_days: std::env::var("RETENTION_EVENTS_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(400),
            interval: Duration::from_secs(
                std::env::var("MAINTENANCE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }
}

pub struct MaintenanceJob {
    pool: PgPool,
    config: MaintenanceConfig,
}

impl MaintenanceJob {
    pub fn new(pool: PgPool, config: MaintenanceConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                tracing::error!("maintenance pass failed: {}", err);
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let outbox_deleted = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE published_at IS NOT NULL
              AND published_at < NOW() - ($1 || ' days')::interval
            "#,
        )
        .bind(self.config.outbox_retention_days.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let events_deleted = sqlx::query(
            r#"
            DELETE FROM events
            WHERE ts < NOW() - ($1 || ' days')::interval
            "#,
        )
        .bind(self.config.events_retention_days.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(
            outbox_deleted,
            events_deleted,
            "maintenance pass complete"
        );

        Ok(())
    }
}
