//! Incrementally maintained rollups backing the results engine's cold path
//! (SPEC component C6's "Aggregates" sub-component). A row is folded in for
//! every post-assignment-valid event, inside the same transaction as the
//! event insert - see `EventRepo::insert`.

use crate::error::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// One event's contribution to its hourly bucket.
pub struct AggregateFold<'a> {
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub ts: DateTime<Utc>,
    pub event_type: &'a str,
    pub user_id: &'a str,
    pub session_id: Option<&'a str>,
    pub value: Option<f64>,
    pub session_duration_seconds: Option<f64>,
}

/// Summed totals over a bucket range, with the denominators needed to
/// derive `avg_value`/`avg_session_duration` on read.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateTotals {
    pub total_events: i64,
    pub exposures: i64,
    pub conversions: i64,
    pub clicks: i64,
    pub unique_users: i64,
    pub unique_sessions: i64,
    pub total_value: f64,
    pub value_samples: i64,
    pub total_session_seconds: f64,
    pub session_duration_samples: i64,
}

impl AggregateTotals {
    pub fn avg_value(&self) -> Option<f64> {
        if self.value_samples > 0 {
            Some(self.total_value / self.value_samples as f64)
        } else {
            None
        }
    }

    pub fn avg_session_duration(&self) -> Option<f64> {
        if self.session_duration_samples > 0 {
            Some(self.total_session_seconds / self.session_duration_samples as f64)
        } else {
            None
        }
    }
}

/// One hourly bucket, as returned for a results `time_series`.
#[derive(Debug, Clone, Copy)]
pub struct AggregateBucket {
    pub event_date: NaiveDate,
    pub event_hour: i16,
    pub totals: AggregateTotals,
}

pub struct AggregateRepo {
    pool: PgPool,
}

impl AggregateRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fold one valid event into its hourly bucket, inside the caller's
    /// transaction. Must only be called for events that pass
    /// `Event::is_valid` - invalid (pre-assignment) events never reach the
    /// aggregate layer, per the "Aggregates...MUST filter is_valid=true"
    /// invariant.
    pub async fn record<'c>(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        fold: AggregateFold<'_>,
    ) -> Result<()> {
        let event_date = fold.ts.date_naive();
        let event_hour = fold.ts.hour() as i16;
        let is_exposure = fold.event_type == "exposure";
        let is_conversion = fold.event_type == "conversion";
        let is_click = fold.event_type == "click";
        let has_value = fold.value.is_some();
        let has_duration = fold.session_duration_seconds.is_some();

        sqlx::query(
            r#"
            INSERT INTO event_aggregates
                (experiment_id, variant_id, event_date, event_hour,
                 total_events, exposures, conversions, clicks,
                 total_value, value_samples,
                 total_session_seconds, session_duration_samples)
            VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (experiment_id, variant_id, event_date, event_hour) DO UPDATE SET
                total_events = event_aggregates.total_events + 1,
                exposures = event_aggregates.exposures + EXCLUDED.exposures,
                conversions = event_aggregates.conversions + EXCLUDED.conversions,
                clicks = event_aggregates.clicks + EXCLUDED.clicks,
                total_value = event_aggregates.total_value + EXCLUDED.total_value,
                value_samples = event_aggregates.value_samples + EXCLUDED.value_samples,
                total_session_seconds = event_aggregates.total_session_seconds + EXCLUDED.total_session_seconds,
                session_duration_samples = event_aggregates.session_duration_samples + EXCLUDED.session_duration_samples,
                updated_at = NOW()
            "#,
        )
        .bind(fold.experiment_id)
        .bind(fold.variant_id)
        .bind(event_date)
        .bind(event_hour)
        .bind(is_exposure as i64)
        .bind(is_conversion as i64)
        .bind(is_click as i64)
        .bind(fold.value.unwrap_or(0.0))
        .bind(has_value as i64)
        .bind(fold.session_duration_seconds.unwrap_or(0.0))
        .bind(has_duration as i64)
        .execute(&mut **tx)
        .await?;

        self.bump_if_new(
            tx,
            fold.experiment_id,
            fold.variant_id,
            event_date,
            event_hour,
            0,
            fold.user_id,
            "unique_users",
        )
        .await?;

        if let Some(session_id) = fold.session_id {
            self.bump_if_new(
                tx,
                fold.experiment_id,
                fold.variant_id,
                event_date,
                event_hour,
                1,
                session_id,
                "unique_sessions",
            )
            .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn bump_if_new<'c>(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        experiment_id: Uuid,
        variant_id: Uuid,
        event_date: NaiveDate,
        event_hour: i16,
        member_kind: i16,
        member_id: &str,
        column: &'static str,
    ) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO event_aggregate_members
                (experiment_id, variant_id, event_date, event_hour, member_kind, member_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(experiment_id)
        .bind(variant_id)
        .bind(event_date)
        .bind(event_hour)
        .bind(member_kind)
        .bind(member_id)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() > 0 {
            let sql = format!(
                "UPDATE event_aggregates SET {column} = {column} + 1 \
                 WHERE experiment_id = $1 AND variant_id = $2 AND event_date = $3 AND event_hour = $4"
            );
            sqlx::query(&sql)
                .bind(experiment_id)
                .bind(variant_id)
                .bind(event_date)
                .bind(event_hour)
                .execute(&mut **tx)
                .await?;
        }

        Ok(())
    }

    /// Summed totals for one variant over `[since, until)`, collapsing every
    /// hourly row in range - this is the "daily" read, derived rather than
    /// stored separately.
    pub async fn totals(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AggregateTotals> {
        let row: (
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<f64>,
            Option<i64>,
            Option<f64>,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(total_events), 0),
                COALESCE(SUM(exposures), 0),
                COALESCE(SUM(conversions), 0),
                COALESCE(SUM(clicks), 0),
                COALESCE(SUM(unique_users), 0),
                COALESCE(SUM(unique_sessions), 0),
                COALESCE(SUM(total_value), 0),
                COALESCE(SUM(value_samples), 0),
                COALESCE(SUM(total_session_seconds), 0),
                COALESCE(SUM(session_duration_samples), 0)
            FROM event_aggregates
            WHERE experiment_id = $1 AND variant_id = $2
              AND (event_date + (event_hour || ' hours')::interval) >= $3
              AND (event_date + (event_hour || ' hours')::interval) < $4
            "#,
        )
        .bind(experiment_id)
        .bind(variant_id)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;

        Ok(AggregateTotals {
            total_events: row.0.unwrap_or(0),
            exposures: row.1.unwrap_or(0),
            conversions: row.2.unwrap_or(0),
            clicks: row.3.unwrap_or(0),
            unique_users: row.4.unwrap_or(0),
            unique_sessions: row.5.unwrap_or(0),
            total_value: row.6.unwrap_or(0.0),
            value_samples: row.7.unwrap_or(0),
            total_session_seconds: row.8.unwrap_or(0.0),
            session_duration_samples: row.9.unwrap_or(0),
        })
    }

    /// Per-hour buckets for one variant over `[since, until)`, used for
    /// `granularity=hour` time series. Callers roll these up to daily
    /// buckets themselves when `granularity=day`.
    pub async fn hourly_series(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AggregateBucket>> {
        let rows: Vec<(
            NaiveDate,
            i16,
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
            f64,
            i64,
            f64,
            i64,
        )> = sqlx::query_as(
            r#"
            SELECT event_date, event_hour, total_events, exposures, conversions, clicks,
                   unique_users, unique_sessions, total_value, value_samples,
                   total_session_seconds, session_duration_samples
            FROM event_aggregates
            WHERE experiment_id = $1 AND variant_id = $2
              AND (event_date + (event_hour || ' hours')::interval) >= $3
              AND (event_date + (event_hour || ' hours')::interval) < $4
            ORDER BY event_date ASC, event_hour ASC
            "#,
        )
        .bind(experiment_id)
        .bind(variant_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AggregateBucket {
                event_date: r.0,
                event_hour: r.1,
                totals: AggregateTotals {
                    total_events: r.2,
                    exposures: r.3,
                    conversions: r.4,
                    clicks: r.5,
                    unique_users: r.6,
                    unique_sessions: r.7,
                    total_value: r.8,
                    value_samples: r.9,
                    total_session_seconds: r.10,
                    session_duration_samples: r.11,
                },
            })
            .collect())
    }
}
