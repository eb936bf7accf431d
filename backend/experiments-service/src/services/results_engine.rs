//! Component C7: the results query engine. Each variant's requested metrics
//! are routed to OLTP (recent, still-settling data) or the incrementally
//! maintained Postgres aggregates (component C6's "Aggregates" sub-component)
//! depending on the query's granularity and date window, summing the two
//! when a window straddles the hot/cold boundary. Confidence intervals use
//! the Wilson score interval rather than a normal approximation, which stays
//! well-behaved at small sample sizes and extreme proportions.
//!
//! A query's `filters`/`event_types` restrict the raw event rows considered,
//! which the pre-aggregated rollup can no longer reconstruct once folded -
//! such queries are always routed to OLTP for the full window, trading
//! query cost for correctness.

use crate::db::aggregate_repo::{AggregateRepo, AggregateTotals};
use crate::db::ExperimentRepo;
use crate::error::{ExperimentsError, Result};
use crate::models::{ExperimentStatus, Variant};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use experiments_cache::results::ResultsCache;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Two-sided 95% Wilson z-score.
const WILSON_Z_95: f64 = 1.959964;

/// Width of the "hot" window routed to OLTP instead of the aggregates table.
const HOT_WINDOW: ChronoDuration = ChronoDuration::hours(1);

/// Minimum sample size below which a confidence interval isn't reported -
/// Wilson intervals are mathematically defined at any n, but a CI over a
/// handful of events is more noise than signal.
pub const DEFAULT_MIN_SAMPLE: i64 = 100;

/// The metrics reported when a query doesn't name any explicitly.
const DEFAULT_METRICS: &[&str] = &["exposures", "conversions", "conversion_rate", "unique_users", "avg_value"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Realtime,
    Hour,
    Day,
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::Realtime
    }
}

/// A results query. Serialized verbatim into the cache key fingerprint and
/// echoed back in the response's `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub include_ci: Option<bool>,
    pub min_sample: Option<i64>,
    #[serde(default = "default_filters")]
    pub filters: serde_json::Value,
}

fn default_filters() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for ResultsQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            event_types: Vec::new(),
            granularity: Granularity::Realtime,
            metrics: Vec::new(),
            include_ci: None,
            min_sample: None,
            filters: default_filters(),
        }
    }
}

impl ResultsQuery {
    fn has_row_level_filter(&self) -> bool {
        !self.event_types.is_empty() || self.filters.as_object().is_some_and(|o| !o.is_empty())
    }

    fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn include_ci(&self) -> bool {
        self.include_ci.unwrap_or(true)
    }

    fn wants(&self, metric: &str) -> bool {
        if self.metrics.is_empty() {
            DEFAULT_METRICS.contains(&metric)
        } else {
            self.metrics.iter().any(|m| m == metric)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    pub sample_size: i64,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub lift_vs_control: Option<f64>,
}

impl MetricValue {
    fn new(value: f64, sample_size: i64) -> Self {
        Self {
            value,
            sample_size,
            ci_lower: None,
            ci_upper: None,
            lift_vs_control: None,
        }
    }

    fn with_ci(mut self, ci: Option<(f64, f64)>) -> Self {
        if let Some((lo, hi)) = ci {
            self.ci_lower = Some(lo);
            self.ci_upper = Some(hi);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: Uuid,
    pub variant_key: String,
    pub is_control: bool,
    pub metrics: BTreeMap<String, MetricValue>,
    pub time_series: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub status: ExperimentStatus,
    pub total_users: i64,
    pub duration_seconds: i64,
    pub winning_variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsMetadata {
    pub query: ResultsQuery,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: Uuid,
    pub experiment_version: i32,
    pub is_final: bool,
    pub summary: ResultsSummary,
    pub variants: Vec<VariantResult>,
    pub metadata: ResultsMetadata,
}

/// Wilson score interval for `k` successes out of `n` trials. Returns
/// `None` below `min_sample`, matching the "n < 100 -> no CI" rule.
pub fn wilson_interval(k: i64, n: i64, min_sample: i64) -> Option<(f64, f64)> {
    if n < min_sample || n == 0 {
        return None;
    }
    let n = n as f64;
    let p_hat = k as f64 / n;
    let z = WILSON_Z_95;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p_hat + z2 / (2.0 * n)) / denom;
    let margin = (z * ((p_hat * (1.0 - p_hat) / n) + z2 / (4.0 * n * n)).sqrt()) / denom;

    Some(((center - margin).max(0.0), (center + margin).min(1.0)))
}

/// Raw per-variant counts, combinable across disjoint time windows.
///
/// Summing `unique_users`/`unique_sessions` across a hot+cold split is an
/// approximation: a user active in both windows is counted twice. Accepted
/// for the same reason the spec accepts summing exposures/conversions
/// across the split - the windows are time-disjoint even if their member
/// sets aren't guaranteed to be.
#[derive(Debug, Clone, Copy, Default)]
struct VariantCounts {
    total_events: i64,
    exposures: i64,
    conversions: i64,
    clicks: i64,
    unique_users: i64,
    unique_sessions: i64,
    total_value: f64,
    value_samples: i64,
    total_session_seconds: f64,
    session_duration_samples: i64,
}

impl VariantCounts {
    fn merge(self, other: VariantCounts) -> VariantCounts {
        VariantCounts {
            total_events: self.total_events + other.total_events,
            exposures: self.exposures + other.exposures,
            conversions: self.conversions + other.conversions,
            clicks: self.clicks + other.clicks,
            unique_users: self.unique_users + other.unique_users,
            unique_sessions: self.unique_sessions + other.unique_sessions,
            total_value: self.total_value + other.total_value,
            value_samples: self.value_samples + other.value_samples,
            total_session_seconds: self.total_session_seconds + other.total_session_seconds,
            session_duration_samples: self.session_duration_samples + other.session_duration_samples,
        }
    }

    fn conversion_rate(&self) -> f64 {
        if self.exposures > 0 {
            self.conversions as f64 / self.exposures as f64
        } else {
            0.0
        }
    }

    fn avg_value(&self) -> Option<f64> {
        if self.value_samples > 0 {
            Some(self.total_value / self.value_samples as f64)
        } else {
            None
        }
    }

    fn avg_session_duration(&self) -> Option<f64> {
        if self.session_duration_samples > 0 {
            Some(self.total_session_seconds / self.session_duration_samples as f64)
        } else {
            None
        }
    }
}

impl From<AggregateTotals> for VariantCounts {
    fn from(t: AggregateTotals) -> Self {
        VariantCounts {
            total_events: t.total_events,
            exposures: t.exposures,
            conversions: t.conversions,
            clicks: t.clicks,
            unique_users: t.unique_users,
            unique_sessions: t.unique_sessions,
            total_value: t.total_value,
            value_samples: t.value_samples,
            total_session_seconds: t.total_session_seconds,
            session_duration_samples: t.session_duration_samples,
        }
    }
}

pub struct ResultsEngine {
    pool: PgPool,
    aggregate_repo: AggregateRepo,
    experiment_repo: Arc<ExperimentRepo>,
    cache: Option<Arc<ResultsCache>>,
    min_sample: i64,
}

impl ResultsEngine {
    pub fn new(pool: PgPool, experiment_repo: Arc<ExperimentRepo>) -> Self {
        Self {
            aggregate_repo: AggregateRepo::new(pool.clone()),
            pool,
            experiment_repo,
            cache: None,
            min_sample: DEFAULT_MIN_SAMPLE,
        }
    }

    pub fn with_cache(pool: PgPool, experiment_repo: Arc<ExperimentRepo>, cache: Arc<ResultsCache>) -> Self {
        Self {
            aggregate_repo: AggregateRepo::new(pool.clone()),
            pool,
            experiment_repo,
            cache: Some(cache),
            min_sample: DEFAULT_MIN_SAMPLE,
        }
    }

    /// Override the minimum sample size below which `confidence_interval`
    /// is withheld rather than reported misleadingly narrow.
    pub fn with_min_sample(mut self, min_sample: i64) -> Self {
        self.min_sample = min_sample;
        self
    }

    pub async fn results(&self, experiment_id: Uuid, query: ResultsQuery) -> Result<ExperimentResults> {
        if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
            if end < start {
                return Err(ExperimentsError::InvalidTimeRange(
                    "end_date must not be before start_date".to_string(),
                ));
            }
        }

        let experiment = self.experiment_repo.get_by_id(experiment_id).await?;
        let is_final = matches!(
            experiment.status,
            ExperimentStatus::Completed | ExperimentStatus::Archived
        );

        let fingerprint = query.fingerprint();
        let realtime = query.granularity == Granularity::Realtime;

        if let Some(cache) = &self.cache {
            match cache
                .get_query::<ExperimentResults>(experiment_id, experiment.version, &fingerprint)
                .await
            {
                Ok(Some(cached)) => return Ok(cached),
                Ok(None) => {}
                Err(err) => tracing::debug!(%experiment_id, "results cache read failed: {}", err),
            }
        }

        let variants = self.experiment_repo.list_variants(experiment_id).await?;
        let now = Utc::now();
        let min_sample = query.min_sample.unwrap_or(self.min_sample);
        let include_ci = query.include_ci();

        let mut variant_results = Vec::with_capacity(variants.len());
        for variant in &variants {
            let counts = self
                .counts_for_variant(experiment_id, variant.id, &query, now)
                .await?;
            let time_series = self.time_series_for_variant(experiment_id, variant.id, &query, now).await?;

            let mut metrics = BTreeMap::new();
            if query.wants("exposures") {
                metrics.insert("exposures".to_string(), MetricValue::new(counts.exposures as f64, counts.exposures));
            }
            if query.wants("conversions") {
                metrics.insert(
                    "conversions".to_string(),
                    MetricValue::new(counts.conversions as f64, counts.conversions),
                );
            }
            if query.wants("clicks") {
                metrics.insert("clicks".to_string(), MetricValue::new(counts.clicks as f64, counts.clicks));
            }
            if query.wants("total_events") {
                metrics.insert(
                    "total_events".to_string(),
                    MetricValue::new(counts.total_events as f64, counts.total_events),
                );
            }
            if query.wants("conversion_rate") {
                let ci = if include_ci {
                    wilson_interval(counts.conversions, counts.exposures, min_sample)
                } else {
                    None
                };
                metrics.insert(
                    "conversion_rate".to_string(),
                    MetricValue::new(counts.conversion_rate(), counts.exposures).with_ci(ci),
                );
            }
            if query.wants("unique_users") {
                metrics.insert(
                    "unique_users".to_string(),
                    MetricValue::new(counts.unique_users as f64, counts.unique_users),
                );
            }
            if query.wants("unique_sessions") {
                metrics.insert(
                    "unique_sessions".to_string(),
                    MetricValue::new(counts.unique_sessions as f64, counts.unique_sessions),
                );
            }
            if query.wants("avg_value") {
                metrics.insert(
                    "avg_value".to_string(),
                    MetricValue::new(counts.avg_value().unwrap_or(0.0), counts.value_samples),
                );
            }
            if query.wants("avg_session_duration") {
                metrics.insert(
                    "avg_session_duration".to_string(),
                    MetricValue::new(counts.avg_session_duration().unwrap_or(0.0), counts.session_duration_samples),
                );
            }

            variant_results.push(VariantResult {
                variant_id: variant.id,
                variant_key: variant.key.clone(),
                is_control: variant.is_control,
                metrics,
                time_series,
            });
        }

        apply_lift_vs_control(&mut variant_results, &variants);

        let total_users: i64 = variant_results
            .iter()
            .filter_map(|v| v.metrics.get("unique_users"))
            .map(|m| m.sample_size.max(m.value as i64))
            .sum();
        let winning_variant = select_winning_variant(&variant_results);

        let results = ExperimentResults {
            experiment_id,
            experiment_version: experiment.version,
            is_final,
            summary: ResultsSummary {
                status: experiment.status,
                total_users,
                duration_seconds: (now - experiment.created_at).num_seconds().max(0),
                winning_variant,
            },
            variants: variant_results,
            metadata: ResultsMetadata {
                query: query.clone(),
                generated_at: now,
            },
        };

        if let Some(cache) = &self.cache {
            if let Err(err) = cache
                .set_query(experiment_id, experiment.version, &fingerprint, &results, realtime)
                .await
            {
                tracing::debug!(%experiment_id, "results cache write failed: {}", err);
            }
        }

        Ok(results)
    }

    fn window(&self, query: &ResultsQuery, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = query.start_date.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        let end = query.end_date.unwrap_or(now);
        (start, end)
    }

    fn event_types_filter(query: &ResultsQuery) -> Option<Vec<String>> {
        if query.event_types.is_empty() {
            None
        } else {
            Some(query.event_types.clone())
        }
    }

    /// Route a variant's counts to OLTP, the Postgres aggregates, or both,
    /// depending on the query's granularity, date window, and whether it
    /// carries row-level filters the aggregates can't honor.
    async fn counts_for_variant(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        query: &ResultsQuery,
        now: DateTime<Utc>,
    ) -> Result<VariantCounts> {
        let (start, end) = self.window(query, now);
        let hot_cutoff = now - HOT_WINDOW;

        if query.has_row_level_filter() {
            return self.oltp_counts(experiment_id, variant_id, query, start, end).await;
        }

        let all_hot = query.granularity == Granularity::Realtime || start >= hot_cutoff;
        if all_hot {
            return self.oltp_counts(experiment_id, variant_id, query, start, end).await;
        }

        if end <= hot_cutoff {
            let totals = self.aggregate_repo.totals(experiment_id, variant_id, start, end).await?;
            return Ok(totals.into());
        }

        let cold = self.aggregate_repo.totals(experiment_id, variant_id, start, hot_cutoff).await?;
        let hot = self.oltp_counts(experiment_id, variant_id, query, hot_cutoff, end).await?;
        Ok(VariantCounts::from(cold).merge(hot))
    }

    async fn oltp_counts(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        query: &ResultsQuery,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<VariantCounts> {
        let event_types = Self::event_types_filter(query);
        let row: (i64, i64, i64, i64, i64, i64, f64, i64, f64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total_events,
                COUNT(*) FILTER (WHERE event_type = 'exposure') AS exposures,
                COUNT(*) FILTER (WHERE event_type = 'conversion') AS conversions,
                COUNT(*) FILTER (WHERE event_type = 'click') AS clicks,
                COUNT(DISTINCT user_id) AS unique_users,
                COUNT(DISTINCT session_id) FILTER (WHERE session_id IS NOT NULL) AS unique_sessions,
                COALESCE(SUM((properties->>'value')::double precision), 0) AS total_value,
                COUNT(*) FILTER (WHERE properties ? 'value') AS value_samples,
                COALESCE(SUM((properties->>'session_duration_seconds')::double precision), 0) AS total_session_seconds,
                COUNT(*) FILTER (WHERE properties ? 'session_duration_seconds') AS session_duration_samples
            FROM events
            WHERE experiment_id = $1 AND variant_id = $2
              AND assignment_at IS NOT NULL AND ts >= assignment_at
              AND ts >= $3 AND ts < $4
              AND ($5::text[] IS NULL OR event_type = ANY($5))
              AND properties @> $6
            "#,
        )
        .bind(experiment_id)
        .bind(variant_id)
        .bind(since)
        .bind(until)
        .bind(event_types)
        .bind(&query.filters)
        .fetch_one(&self.pool)
        .await?;

        Ok(VariantCounts {
            total_events: row.0,
            exposures: row.1,
            conversions: row.2,
            clicks: row.3,
            unique_users: row.4,
            unique_sessions: row.5,
            total_value: row.6,
            value_samples: row.7,
            total_session_seconds: row.8,
            session_duration_samples: row.9,
        })
    }

    async fn oltp_bucket_counts(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        query: &ResultsQuery,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        bucket_unit: &str,
    ) -> Result<Vec<(DateTime<Utc>, VariantCounts)>> {
        let event_types = Self::event_types_filter(query);
        let rows: Vec<(DateTime<Utc>, i64, i64, i64, i64, i64, i64, f64, i64, f64, i64)> = sqlx::query_as(
            r#"
            SELECT
                date_trunc($5, ts) AS bucket,
                COUNT(*) AS total_events,
                COUNT(*) FILTER (WHERE event_type = 'exposure') AS exposures,
                COUNT(*) FILTER (WHERE event_type = 'conversion') AS conversions,
                COUNT(*) FILTER (WHERE event_type = 'click') AS clicks,
                COUNT(DISTINCT user_id) AS unique_users,
                COUNT(DISTINCT session_id) FILTER (WHERE session_id IS NOT NULL) AS unique_sessions,
                COALESCE(SUM((properties->>'value')::double precision), 0) AS total_value,
                COUNT(*) FILTER (WHERE properties ? 'value') AS value_samples,
                COALESCE(SUM((properties->>'session_duration_seconds')::double precision), 0) AS total_session_seconds,
                COUNT(*) FILTER (WHERE properties ? 'session_duration_seconds') AS session_duration_samples
            FROM events
            WHERE experiment_id = $1 AND variant_id = $2
              AND assignment_at IS NOT NULL AND ts >= assignment_at
              AND ts >= $3 AND ts < $4
              AND ($6::text[] IS NULL OR event_type = ANY($6))
              AND properties @> $7
            GROUP BY bucket
            ORDER BY bucket ASC
            "#,
        )
        .bind(experiment_id)
        .bind(variant_id)
        .bind(since)
        .bind(until)
        .bind(bucket_unit)
        .bind(event_types)
        .bind(&query.filters)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.0,
                    VariantCounts {
                        total_events: r.1,
                        exposures: r.2,
                        conversions: r.3,
                        clicks: r.4,
                        unique_users: r.5,
                        unique_sessions: r.6,
                        total_value: r.7,
                        value_samples: r.8,
                        total_session_seconds: r.9,
                        session_duration_samples: r.10,
                    },
                )
            })
            .collect())
    }

    /// Build the per-bucket series for a variant. `Realtime` queries report
    /// no series - there's only one instant to report.
    async fn time_series_for_variant(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        query: &ResultsQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>> {
        if query.granularity == Granularity::Realtime {
            return Ok(Vec::new());
        }

        let (start, end) = self.window(query, now);
        let hot_cutoff = now - HOT_WINDOW;
        let bucket_unit = match query.granularity {
            Granularity::Day => "day",
            _ => "hour",
        };

        let mut buckets: BTreeMap<DateTime<Utc>, VariantCounts> = BTreeMap::new();

        let force_hot = query.has_row_level_filter();
        let cold_end = if force_hot { start } else { hot_cutoff.min(end) };
        if cold_end > start {
            let rows = self
                .aggregate_repo
                .hourly_series(experiment_id, variant_id, start, cold_end)
                .await?;
            for row in rows {
                let hour_start = Utc.from_utc_datetime(
                    &row
                        .event_date
                        .and_hms_opt(row.event_hour as u32, 0, 0)
                        .unwrap(),
                );
                let bucket_start = if bucket_unit == "day" {
                    Utc.from_utc_datetime(&row.event_date.and_hms_opt(0, 0, 0).unwrap())
                } else {
                    hour_start
                };
                let entry = buckets.entry(bucket_start).or_default();
                *entry = entry.merge(row.totals.into());
            }
        }

        let hot_start = if force_hot { start } else { cold_end.max(start) };
        if end > hot_start {
            let rows = self
                .oltp_bucket_counts(experiment_id, variant_id, query, hot_start, end, bucket_unit)
                .await?;
            for (bucket_start, counts) in rows {
                let entry = buckets.entry(bucket_start).or_default();
                *entry = entry.merge(counts);
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket_start, counts)| TimeSeriesPoint {
                bucket_start,
                metrics: metrics_map(&counts, query),
            })
            .collect())
    }
}

fn metrics_map(counts: &VariantCounts, query: &ResultsQuery) -> BTreeMap<String, f64> {
    let mut map = BTreeMap::new();
    if query.wants("exposures") {
        map.insert("exposures".to_string(), counts.exposures as f64);
    }
    if query.wants("conversions") {
        map.insert("conversions".to_string(), counts.conversions as f64);
    }
    if query.wants("clicks") {
        map.insert("clicks".to_string(), counts.clicks as f64);
    }
    if query.wants("total_events") {
        map.insert("total_events".to_string(), counts.total_events as f64);
    }
    if query.wants("conversion_rate") {
        map.insert("conversion_rate".to_string(), counts.conversion_rate());
    }
    if query.wants("unique_users") {
        map.insert("unique_users".to_string(), counts.unique_users as f64);
    }
    if query.wants("unique_sessions") {
        map.insert("unique_sessions".to_string(), counts.unique_sessions as f64);
    }
    if query.wants("avg_value") {
        map.insert("avg_value".to_string(), counts.avg_value().unwrap_or(0.0));
    }
    if query.wants("avg_session_duration") {
        map.insert(
            "avg_session_duration".to_string(),
            counts.avg_session_duration().unwrap_or(0.0),
        );
    }
    map
}

/// For every non-control variant, compute lift against the control for
/// every metric both sides reported.
fn apply_lift_vs_control(results: &mut [VariantResult], variants: &[Variant]) {
    let control_id = variants.iter().find(|v| v.is_control).map(|v| v.id);
    let Some(control_id) = control_id else { return };
    let control_metrics = results
        .iter()
        .find(|r| r.variant_id == control_id)
        .map(|r| r.metrics.clone());
    let Some(control_metrics) = control_metrics else { return };

    for result in results.iter_mut() {
        if result.variant_id == control_id {
            continue;
        }
        for (key, metric) in result.metrics.iter_mut() {
            if let Some(control_metric) = control_metrics.get(key) {
                if control_metric.value != 0.0 {
                    metric.lift_vs_control = Some((metric.value - control_metric.value) / control_metric.value);
                }
            }
        }
    }
}

/// The non-control variant with the largest positive lift on
/// `conversion_rate` whose confidence interval doesn't overlap the
/// control's, or `None` if no variant qualifies (including when CIs were
/// withheld entirely).
fn select_winning_variant(results: &[VariantResult]) -> Option<String> {
    let control = results.iter().find(|r| r.is_control)?;
    let control_metric = control.metrics.get("conversion_rate")?;
    let (control_lo, control_hi) = (control_metric.ci_lower?, control_metric.ci_upper?);

    results
        .iter()
        .filter(|r| !r.is_control)
        .filter_map(|r| {
            let metric = r.metrics.get("conversion_rate")?;
            let lift = metric.lift_vs_control?;
            if lift <= 0.0 {
                return None;
            }
            let (lo, hi) = (metric.ci_lower?, metric.ci_upper?);
            let non_overlapping = lo > control_hi || hi < control_lo;
            non_overlapping.then_some((r.variant_key.clone(), lift))
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(key, _)| key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn wilson_interval_k50_n100() {
        let (lo, hi) = wilson_interval(50, 100, 100).unwrap();
        assert!(approx(lo, 0.4038, 0.001), "lo={lo}");
        assert!(approx(hi, 0.5962, 0.001), "hi={hi}");
    }

    #[test]
    fn wilson_interval_k0_n100() {
        let (lo, hi) = wilson_interval(0, 100, 100).unwrap();
        assert!(approx(lo, 0.0, 0.001), "lo={lo}");
        assert!(approx(hi, 0.0370, 0.001), "hi={hi}");
    }

    #[test]
    fn wilson_interval_below_min_sample_is_none() {
        assert!(wilson_interval(10, 50, 100).is_none());
    }

    fn variant(id: Uuid, key: &str, is_control: bool) -> Variant {
        Variant {
            id,
            experiment_id: Uuid::new_v4(),
            key: key.to_string(),
            name: key.to_string(),
            allocation_pct: 50,
            is_control,
            config: serde_json::json!({}),
        }
    }

    fn result(variant_id: Uuid, key: &str, is_control: bool, exposures: i64, conversions: i64) -> VariantResult {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "conversion_rate".to_string(),
            MetricValue::new(conversions as f64 / exposures as f64, exposures),
        );
        VariantResult {
            variant_id,
            variant_key: key.to_string(),
            is_control,
            metrics,
            time_series: Vec::new(),
        }
    }

    #[test]
    fn lift_vs_control_is_relative() {
        let control_id = Uuid::new_v4();
        let treatment_id = Uuid::new_v4();
        let variants = vec![
            variant(control_id, "control", true),
            variant(treatment_id, "treatment", false),
        ];
        let mut results = vec![
            result(control_id, "control", true, 100, 10),
            result(treatment_id, "treatment", false, 100, 15),
        ];
        apply_lift_vs_control(&mut results, &variants);
        assert!(results[0].metrics["conversion_rate"].lift_vs_control.is_none());
        assert!(approx(
            results[1].metrics["conversion_rate"].lift_vs_control.unwrap(),
            0.5,
            0.001
        ));
    }

    #[test]
    fn winning_variant_requires_non_overlapping_ci() {
        let control_id = Uuid::new_v4();
        let treatment_id = Uuid::new_v4();
        let mut control = result(control_id, "control", true, 1000, 100);
        control.metrics.get_mut("conversion_rate").unwrap().ci_lower = Some(0.08);
        control.metrics.get_mut("conversion_rate").unwrap().ci_upper = Some(0.12);
        let mut treatment = result(treatment_id, "treatment", false, 1000, 200);
        treatment.metrics.get_mut("conversion_rate").unwrap().lift_vs_control = Some(1.0);
        treatment.metrics.get_mut("conversion_rate").unwrap().ci_lower = Some(0.18);
        treatment.metrics.get_mut("conversion_rate").unwrap().ci_upper = Some(0.22);

        let winner = select_winning_variant(&[control, treatment]);
        assert_eq!(winner, Some("treatment".to_string()));
    }

    #[test]
    fn winning_variant_is_none_when_cis_overlap() {
        let control_id = Uuid::new_v4();
        let treatment_id = Uuid::new_v4();
        let mut control = result(control_id, "control", true, 1000, 100);
        control.metrics.get_mut("conversion_rate").unwrap().ci_lower = Some(0.05);
        control.metrics.get_mut("conversion_rate").unwrap().ci_upper = Some(0.15);
        let mut treatment = result(treatment_id, "treatment", false, 1000, 110);
        treatment.metrics.get_mut("conversion_rate").unwrap().lift_vs_control = Some(0.1);
        treatment.metrics.get_mut("conversion_rate").unwrap().ci_lower = Some(0.09);
        treatment.metrics.get_mut("conversion_rate").unwrap().ci_upper = Some(0.13);

        let winner = select_winning_variant(&[control, treatment]);
        assert_eq!(winner, None);
    }

    #[test]
    fn query_fingerprint_differs_by_date_window() {
        let base = ResultsQuery::default();
        let mut other = ResultsQuery::default();
        other.start_date = Some(Utc::now());
        assert_ne!(base.fingerprint(), other.fingerprint());
    }
}
