use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use clickhouse::Client as ClickHouseClient;
use clickhouse::Row;
use prometheus::{IntCounter, IntGauge};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExperimentsError, Result};

/// Metrics for CDC consumer monitoring
#[derive(Clone)]
pub struct CdcConsumerMetrics {
    /// Total number of Kafka consumer errors
    pub consumer_errors_total: IntCounter,
    /// Current consecutive error count (resets on success)
    pub consecutive_errors: IntGauge,
    /// Total messages successfully processed
    pub messages_processed_total: IntCounter,
    /// Total messages that failed processing and were sent to the DLQ
    pub messages_failed_total: IntCounter,
    /// Consumer health status (1 = healthy, 0 = unhealthy)
    pub consumer_healthy: IntGauge,
    /// Current backoff duration in seconds
    pub backoff_seconds: IntGauge,
    /// Total rows flushed to ClickHouse
    pub rows_flushed_total: IntCounter,
    /// Total batches quarantined after exhausting bisection
    pub poison_batches_total: IntCounter,
}

impl CdcConsumerMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let consumer_errors_total = IntCounter::new(
            "cdc_consumer_errors_total",
            "Total number of Kafka consumer errors encountered",
        )
        .expect("valid metric for cdc_consumer_errors_total");

        let consecutive_errors = IntGauge::new(
            "cdc_consumer_consecutive_errors",
            "Current number of consecutive Kafka consumer errors",
        )
        .expect("valid metric for cdc_consumer_consecutive_errors");

        let messages_processed_total = IntCounter::new(
            "cdc_messages_processed_total",
            "Total number of CDC messages successfully processed",
        )
        .expect("valid metric for cdc_messages_processed_total");

        let messages_failed_total = IntCounter::new(
            "cdc_messages_failed_total",
            "Total number of CDC messages routed to the dead-letter sink",
        )
        .expect("valid metric for cdc_messages_failed_total");

        let consumer_healthy = IntGauge::new(
            "cdc_consumer_healthy",
            "CDC consumer health status (1 = healthy, 0 = unhealthy)",
        )
        .expect("valid metric for cdc_consumer_healthy");

        let backoff_seconds = IntGauge::new(
            "cdc_consumer_backoff_seconds",
            "Current backoff duration in seconds",
        )
        .expect("valid metric for cdc_consumer_backoff_seconds");

        let rows_flushed_total = IntCounter::new(
            "cdc_rows_flushed_total",
            "Total number of rows flushed to ClickHouse",
        )
        .expect("valid metric for cdc_rows_flushed_total");

        let poison_batches_total = IntCounter::new(
            "cdc_poison_batches_total",
            "Total number of batches that required bisection and quarantine",
        )
        .expect("valid metric for cdc_poison_batches_total");

        for metric in [
            Box::new(consumer_errors_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(consecutive_errors.clone()),
            Box::new(messages_processed_total.clone()),
            Box::new(messages_failed_total.clone()),
            Box::new(consumer_healthy.clone()),
            Box::new(backoff_seconds.clone()),
            Box::new(rows_flushed_total.clone()),
            Box::new(poison_batches_total.clone()),
        ] {
            let _ = registry.register(metric);
        }

        consumer_healthy.set(1);

        Self {
            consumer_errors_total,
            consecutive_errors,
            messages_processed_total,
            messages_failed_total,
            consumer_healthy,
            backoff_seconds,
            rows_flushed_total,
            poison_batches_total,
        }
    }
}

impl Default for CdcConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Error handling state for the CDC consumer
pub struct ConsumerErrorState {
    consecutive_count: AtomicU32,
    last_success_ms: AtomicU64,
}

impl ConsumerErrorState {
    pub fn new() -> Self {
        Self {
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            ),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms.store(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            Ordering::SeqCst,
        );
    }

    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Exponential backoff with jitter: `2^(errors-1)` seconds, capped, with
    /// up to 30% jitter so a correlated fleet of consumers doesn't retry in
    /// lockstep.
    pub fn calculate_backoff(&self) -> Duration {
        const MIN_BACKOFF_SECS: u64 = 1;
        const MAX_BACKOFF_SECS: u64 = 60;

        let errors = self.consecutive_errors();
        if errors == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }

        let base_secs = 2u64
            .saturating_pow(errors.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        let jitter_frac = (rand_jitter_fraction(errors) - 0.5) * 0.6; // +-30%
        let jittered = (base_secs as f64) * (1.0 + jitter_frac);
        Duration::from_secs_f64(jittered.max(MIN_BACKOFF_SECS as f64))
    }
}

/// Deterministic pseudo-jitter in `[0, 1)` so backoff doesn't depend on a
/// global RNG state that would need locking on the hot error path.
fn rand_jitter_fraction(seed: u32) -> f64 {
    let mixed = (seed.wrapping_mul(2_654_435_761)) ^ (seed.rotate_left(13));
    (mixed % 1000) as f64 / 1000.0
}

impl Default for ConsumerErrorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information for the CDC consumer
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub time_since_last_success: Duration,
    pub current_backoff: Duration,
}

/// One row of the `projected_events` ClickHouse table (see component C6).
///
/// Populated from the outbox's `event.recorded` payload, which already
/// carries the denormalized `variant_id`/`assignment_at` pair computed at
/// ingest time - the consumer never needs to join back to OLTP.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ProjectedEventRow {
    pub event_id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub event_date: u16, // days since epoch, ClickHouse Date
    pub event_hour: u8,
    pub ts: DateTime<Utc>,
    pub page: String,
    pub value: f64,
    pub score: f64,
    pub is_conversion: u8,
    pub is_click: u8,
    pub is_exposure: u8,
    pub is_valid: u8,
    pub properties: String,
}

/// One row of the `assignments_projected` dimension mirror, kept in sync
/// from `assignment.created` outbox events so results queries spanning the
/// cold window don't need to hit OLTP for variant membership.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct AssignmentProjectedRow {
    pub assignment_id: Uuid,
    pub experiment_id: Uuid,
    pub user_id: String,
    pub variant_id: Uuid,
    pub experiment_version: i32,
    pub assigned_at: DateTime<Utc>,
    pub source: String,
}

use super::models::{CdcMessage, CdcOperation};

/// CDC Consumer configuration
#[derive(Debug, Clone)]
pub struct CdcConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub dlq_topic: String,
    pub batch_max_rows: usize,
    pub flush_interval: Duration,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
}

impl CdcConsumerConfig {
    pub fn from_env() -> Self {
        Self {
            brokers: std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "kafka:9092".to_string()),
            // A single logical consumer group drains the whole outbox topic;
            // per-aggregate-type groups are the hazard this design retires.
            group_id: std::env::var("CDC_CONSUMER_GROUP")
                .unwrap_or_else(|_| "experiments-cdc-consumer-v1".to_string()),
            topics: std::env::var("CDC_TOPICS")
                .unwrap_or_else(|_| "experiments.outbox".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            dlq_topic: std::env::var("CDC_DLQ_TOPIC")
                .unwrap_or_else(|_| "experiments.outbox.dlq".to_string()),
            batch_max_rows: std::env::var("CDC_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            flush_interval: Duration::from_millis(
                std::env::var("CDC_FLUSH_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5000),
            ),
            clickhouse_url: std::env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://clickhouse:8123".to_string()),
            clickhouse_database: std::env::var("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "experiments".to_string()),
            clickhouse_user: std::env::var("CLICKHOUSE_USER")
                .unwrap_or_else(|_| "default".to_string()),
            clickhouse_password: std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
        }
    }
}

const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// A decoded outbox event, self-describing enough to project without
/// consulting OLTP. Extracted either from Kafka headers (the shape our own
/// `KafkaOutboxPublisher` emits) or, tolerantly, from a Debezium-style
/// envelope in the message body - so a future switch to log-tailing the
/// outbox table via Debezium needs no consumer change.
struct DecodedOutboxEvent {
    aggregate_type: String,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: Value,
}

/// CDC Consumer service: drains the single logical outbox topic and
/// maintains the columnar projections that back the results query engine.
pub struct CdcConsumer {
    consumer: StreamConsumer,
    dlq_producer: FutureProducer,
    ch_client: ClickHouseClient,
    config: CdcConsumerConfig,
    metrics: CdcConsumerMetrics,
    error_state: Arc<ConsumerErrorState>,
    event_buffer: Mutex<Vec<ProjectedEventRow>>,
    assignment_buffer: Mutex<Vec<AssignmentProjectedRow>>,
    last_flush: Mutex<std::time::Instant>,
}

impl CdcConsumer {
    fn batch_max_rows(&self) -> usize {
        self.config.batch_max_rows
    }
}

impl CdcConsumer {
    pub fn new(config: CdcConsumerConfig) -> Result<Self> {
        info!("Initializing CDC consumer with config: {:?}", config);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            // Offsets are committed by hand, only after a successful flush -
            // auto-commit would ack rows that never made it to ClickHouse.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                ExperimentsError::Kafka(e.to_string())
            })?;

        consumer
            .subscribe(&config.topics.iter().map(|s| s.as_str()).collect::<Vec<_>>())
            .map_err(|e| {
                error!("Failed to subscribe to topics: {}", e);
                ExperimentsError::Kafka(e.to_string())
            })?;

        info!("CDC consumer subscribed to topics: {:?}", config.topics);

        let dlq_producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| ExperimentsError::Kafka(e.to_string()))?;

        let ch_client = ClickHouseClient::default()
            .with_url(&config.clickhouse_url)
            .with_database(&config.clickhouse_database)
            .with_user(&config.clickhouse_user)
            .with_password(&config.clickhouse_password);

        let metrics = CdcConsumerMetrics::new();
        let error_state = Arc::new(ConsumerErrorState::new());

        Ok(Self {
            consumer,
            dlq_producer,
            ch_client,
            event_buffer: Mutex::new(Vec::new()),
            assignment_buffer: Mutex::new(Vec::new()),
            last_flush: Mutex::new(std::time::Instant::now()),
            config,
            metrics,
            error_state,
        })
    }

    pub fn is_healthy(&self) -> bool {
        let errors = self.error_state.consecutive_errors();
        let time_since_success = self.error_state.time_since_success();

        if errors >= UNHEALTHY_ERROR_THRESHOLD {
            return false;
        }
        if time_since_success > Duration::from_secs(300) && errors > 0 {
            return false;
        }
        true
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            healthy: self.is_healthy(),
            consecutive_errors: self.error_state.consecutive_errors(),
            time_since_last_success: self.error_state.time_since_success(),
            current_backoff: self.error_state.calculate_backoff(),
        }
    }

    /// Run the CDC consumer loop: poll, decode, buffer, and periodically
    /// flush. Offsets are committed only once a flush succeeds.
    pub async fn run(&self) -> Result<()> {
        info!("Starting CDC consumer loop");
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                recv_result = self.consumer.recv() => {
                    match recv_result {
                        Ok(msg) => {
                            self.error_state.record_success();
                            self.metrics.consecutive_errors.set(0);
                            self.metrics.consumer_healthy.set(1);
                            self.metrics.backoff_seconds.set(0);

                            if let Err(e) = self.handle_message(&msg).await {
                                warn!("message routed to DLQ: {}", e);
                            } else {
                                self.metrics.messages_processed_total.inc();
                            }

                            let buffered = {
                                let events = self.event_buffer.lock().await;
                                let assignments = self.assignment_buffer.lock().await;
                                events.len() + assignments.len()
                            };
                            if buffered >= self.batch_max_rows() {
                                self.flush(&msg).await?;
                            }
                        }
                        Err(e) => {
                            let consecutive = self.error_state.record_error();
                            self.metrics.consumer_errors_total.inc();
                            self.metrics.consecutive_errors.set(consecutive as i64);

                            let backoff = self.error_state.calculate_backoff();
                            self.metrics.backoff_seconds.set(backoff.as_secs() as i64);

                            let is_healthy = self.is_healthy();
                            self.metrics.consumer_healthy.set(if is_healthy { 1 } else { 0 });

                            if consecutive >= CRITICAL_ERROR_THRESHOLD {
                                error!(consecutive_errors = consecutive, backoff_secs = backoff.as_secs(), "CRITICAL: Kafka consumer experiencing persistent failures: {}", e);
                            } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
                                warn!(consecutive_errors = consecutive, backoff_secs = backoff.as_secs(), "Kafka consumer unhealthy: {}", e);
                            } else {
                                error!(consecutive_errors = consecutive, backoff_secs = backoff.as_secs(), "Kafka consumer error (will retry with backoff): {}", e);
                            }

                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_on_age().await?;
                }
            }
        }
    }

    async fn flush_on_age(&self) -> Result<()> {
        let buffered = {
            let events = self.event_buffer.lock().await;
            let assignments = self.assignment_buffer.lock().await;
            events.len() + assignments.len()
        };
        if buffered == 0 {
            return Ok(());
        }
        self.flush_buffers().await?;
        self.commit_offsets()?;
        Ok(())
    }

    async fn flush(&self, _trigger: &BorrowedMessage<'_>) -> Result<()> {
        self.flush_buffers().await?;
        self.commit_offsets()?;
        Ok(())
    }

    fn commit_offsets(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .or_else(|e| {
                // No offsets to commit is not an error condition.
                if e.to_string().contains("No offset stored") {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| ExperimentsError::Kafka(e.to_string()))
    }

    async fn flush_buffers(&self) -> Result<()> {
        let events = {
            let mut buf = self.event_buffer.lock().await;
            std::mem::take(&mut *buf)
        };
        let assignments = {
            let mut buf = self.assignment_buffer.lock().await;
            std::mem::take(&mut *buf)
        };

        if !events.is_empty() {
            self.insert_event_rows(events).await?;
        }
        if !assignments.is_empty() {
            self.insert_assignment_rows(assignments).await?;
        }

        *self.last_flush.lock().await = std::time::Instant::now();
        Ok(())
    }

    /// Insert event rows, bisecting and quarantining on failure so one
    /// malformed row never blocks the rest of a batch indefinitely.
    async fn insert_event_rows(&self, rows: Vec<ProjectedEventRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.try_insert_events(&rows).await {
            Ok(()) => {
                self.metrics.rows_flushed_total.inc_by(rows.len() as u64);
                Ok(())
            }
            Err(e) if rows.len() == 1 => {
                error!(event_id = %rows[0].event_id, "quarantining poison row after insert failure: {}", e);
                self.metrics.poison_batches_total.inc();
                self.metrics.messages_failed_total.inc();
                self.send_dlq_raw(&serde_json::to_vec(&rows[0]).unwrap_or_default())
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("batch insert failed ({}), bisecting to isolate poison rows", e);
                let mid = rows.len() / 2;
                let (left, right) = rows.split_at(mid);
                Box::pin(self.insert_event_rows(left.to_vec())).await?;
                Box::pin(self.insert_event_rows(right.to_vec())).await?;
                Ok(())
            }
        }
    }

    async fn try_insert_events(&self, rows: &[ProjectedEventRow]) -> Result<()> {
        let mut insert = self
            .ch_client
            .insert("projected_events")
            .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))?;
        for row in rows {
            insert
                .write(row)
                .await
                .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))?;
        }
        insert
            .end()
            .await
            .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))
    }

    async fn insert_assignment_rows(&self, rows: Vec<AssignmentProjectedRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.try_insert_assignments(&rows).await {
            Ok(()) => {
                self.metrics.rows_flushed_total.inc_by(rows.len() as u64);
                Ok(())
            }
            Err(e) if rows.len() == 1 => {
                error!(assignment_id = %rows[0].assignment_id, "quarantining poison row after insert failure: {}", e);
                self.metrics.poison_batches_total.inc();
                self.metrics.messages_failed_total.inc();
                self.send_dlq_raw(&serde_json::to_vec(&rows[0]).unwrap_or_default())
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("batch insert failed ({}), bisecting to isolate poison rows", e);
                let mid = rows.len() / 2;
                let (left, right) = rows.split_at(mid);
                Box::pin(self.insert_assignment_rows(left.to_vec())).await?;
                Box::pin(self.insert_assignment_rows(right.to_vec())).await?;
                Ok(())
            }
        }
    }

    async fn try_insert_assignments(&self, rows: &[AssignmentProjectedRow]) -> Result<()> {
        let mut insert = self
            .ch_client
            .insert("assignments_projected")
            .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))?;
        for row in rows {
            insert
                .write(row)
                .await
                .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))?;
        }
        insert
            .end()
            .await
            .map_err(|e| ExperimentsError::ClickHouse(e.to_string()))
    }

    /// Decode and buffer a single Kafka message. Malformed messages are
    /// routed straight to the DLQ without blocking the consumer loop.
    async fn handle_message(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let decoded = match Self::decode(msg) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(()), // op not in {c, r}: ignored by design
            Err(e) => {
                self.metrics.messages_failed_total.inc();
                self.send_dlq(msg).await;
                return Err(e);
            }
        };

        match decoded.aggregate_type.as_str() {
            "event" if decoded.event_type == "event.recorded" => {
                match Self::event_row_from_payload(&decoded) {
                    Ok(row) => self.event_buffer.lock().await.push(row),
                    Err(e) => {
                        self.metrics.messages_failed_total.inc();
                        self.send_dlq(msg).await;
                        return Err(e);
                    }
                }
            }
            "assignment" if decoded.event_type == "assignment.created" => {
                match Self::assignment_row_from_payload(&decoded) {
                    Ok(row) => self.assignment_buffer.lock().await.push(row),
                    Err(e) => {
                        self.metrics.messages_failed_total.inc();
                        self.send_dlq(msg).await;
                        return Err(e);
                    }
                }
            }
            other => {
                debug!(aggregate_type = other, "ignoring non-projected aggregate type");
            }
        }

        Ok(())
    }

    /// Decode a message either from the headers `KafkaOutboxPublisher`
    /// attaches, or - tolerantly - from a Debezium-style envelope in the
    /// body. Returns `Ok(None)` for operations outside `{c, r}`, which are
    /// intentionally not projected.
    fn decode(msg: &BorrowedMessage<'_>) -> Result<Option<DecodedOutboxEvent>> {
        if let Some(headers) = msg.headers() {
            let mut aggregate_type = None;
            let mut event_type = None;
            let mut created_at = None;
            for header in headers.iter() {
                let value = header.value.and_then(|v| std::str::from_utf8(v).ok());
                match header.key {
                    "aggregate_type" => aggregate_type = value,
                    "event_type" => event_type = value,
                    "created_at" => created_at = value,
                    _ => {}
                }
            }
            if let (Some(aggregate_type), Some(event_type)) = (aggregate_type, event_type) {
                let payload_bytes = msg
                    .payload()
                    .ok_or_else(|| ExperimentsError::Validation("message has no payload".to_string()))?;
                let payload: Value = serde_json::from_slice(payload_bytes)
                    .map_err(|e| ExperimentsError::Validation(format!("invalid JSON payload: {e}")))?;
                let occurred_at = created_at
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                return Ok(Some(DecodedOutboxEvent {
                    aggregate_type: aggregate_type.to_string(),
                    event_type: event_type.to_string(),
                    occurred_at,
                    payload,
                }));
            }
        }

        // Fall back to a Debezium-style envelope in the message body.
        let payload_bytes = msg
            .payload()
            .ok_or_else(|| ExperimentsError::Validation("message has no payload".to_string()))?;
        let cdc_msg: CdcMessage = serde_json::from_slice(payload_bytes)
            .map_err(|e| ExperimentsError::Validation(format!("invalid CDC envelope: {e}")))?;
        cdc_msg.validate()?;

        if !matches!(cdc_msg.operation(), CdcOperation::Insert | CdcOperation::Read) {
            return Ok(None);
        }

        let aggregate_type = cdc_msg.table().to_string();
        let data = cdc_msg
            .payload()
            .after
            .as_ref()
            .ok_or_else(|| ExperimentsError::Validation("CDC message missing 'after' field".to_string()))?;
        let event_type = data
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Some(DecodedOutboxEvent {
            aggregate_type,
            event_type,
            occurred_at: cdc_msg.timestamp(),
            payload: data.clone(),
        }))
    }

    fn event_row_from_payload(decoded: &DecodedOutboxEvent) -> Result<ProjectedEventRow> {
        let payload = &decoded.payload;
        let event_id: Uuid = Self::extract_field(payload, "event_id")?;
        let experiment_id: Uuid = Self::extract_field(payload, "experiment_id")?;
        let variant_id: Option<Uuid> = Self::extract_optional_field(payload, "variant_id");
        let user_id: String = Self::extract_field(payload, "user_id")?;
        let event_type: String = Self::extract_field(payload, "event_type")?;
        let ts_raw: String = Self::extract_field(payload, "ts")?;
        let ts = Self::parse_datetime_best_effort(&ts_raw)?;
        let assignment_at_raw: Option<String> = Self::extract_optional_field(payload, "assignment_at");
        let assignment_at = assignment_at_raw
            .as_deref()
            .map(Self::parse_datetime_best_effort)
            .transpose()?;

        let properties = payload.get("properties").cloned().unwrap_or_else(|| serde_json::json!({}));
        let page = properties
            .get("page")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let value = properties.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let score = properties.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let is_exposure = event_type == "exposure";
        let is_click = event_type == "click";
        let is_conversion = event_type == "conversion";
        let is_valid = matches!(assignment_at, Some(at) if ts >= at);

        let event_date = days_since_epoch(ts);
        let event_hour = ts.hour() as u8;

        let _ = decoded.occurred_at;

        Ok(ProjectedEventRow {
            event_id,
            experiment_id,
            variant_id: variant_id.unwrap_or(Uuid::nil()),
            user_id,
            event_type,
            event_date,
            event_hour,
            ts,
            page,
            value,
            score,
            is_conversion: is_conversion as u8,
            is_click: is_click as u8,
            is_exposure: is_exposure as u8,
            is_valid: is_valid as u8,
            properties: properties.to_string(),
        })
    }

    fn assignment_row_from_payload(decoded: &DecodedOutboxEvent) -> Result<AssignmentProjectedRow> {
        let payload = &decoded.payload;
        let assigned_at_raw: String = Self::extract_field(payload, "assigned_at")?;
        Ok(AssignmentProjectedRow {
            assignment_id: Self::extract_field(payload, "assignment_id")?,
            experiment_id: Self::extract_field(payload, "experiment_id")?,
            user_id: Self::extract_field(payload, "user_id")?,
            variant_id: Self::extract_field(payload, "variant_id")?,
            experiment_version: Self::extract_field(payload, "experiment_version")?,
            assigned_at: Self::parse_datetime_best_effort(&assigned_at_raw)?,
            source: Self::extract_field(payload, "source")?,
        })
    }

    async fn send_dlq(&self, msg: &BorrowedMessage<'_>) {
        if let Some(payload) = msg.payload() {
            self.send_dlq_raw(payload).await;
        }
    }

    async fn send_dlq_raw(&self, payload: &[u8]) {
        let record = FutureRecord::<(), _>::to(&self.config.dlq_topic).payload(payload);
        if let Err((e, _)) = self.dlq_producer.send(record, Duration::from_secs(10)).await {
            error!("failed to route message to DLQ topic {}: {}", self.config.dlq_topic, e);
        }
    }

    fn extract_field<T>(data: &Value, field: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        data.get(field)
            .ok_or_else(|| ExperimentsError::Validation(format!("Missing field: {field}")))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ExperimentsError::Validation(format!("Failed to parse field '{field}': {e}")))
            })
    }

    fn extract_optional_field<T>(data: &Value, field: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        data.get(field).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn parse_datetime_best_effort(s: &str) -> Result<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ") {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
        Err(ExperimentsError::Validation(format!(
            "Unsupported datetime format: {s}"
        )))
    }
}

fn days_since_epoch(ts: DateTime<Utc>) -> u16 {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date");
    (ts.date_naive() - epoch).num_days() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let state = ConsumerErrorState::new();
        for _ in 0..3 {
            state.record_error();
        }
        let backoff = state.calculate_backoff();
        assert!(backoff.as_secs_f64() >= 1.0);
        for _ in 0..20 {
            state.record_error();
        }
        assert!(state.calculate_backoff().as_secs() <= 60);
    }

    #[test]
    fn days_since_epoch_is_stable() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(days_since_epoch(ts), 20454);
    }
}
