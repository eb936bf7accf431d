//! Background outbox-to-Kafka publisher. Wraps the shared
//! `transactional-outbox` processor with the service's own connection
//! settings and metrics registration.

use crate::error::{ExperimentsError, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use transactional_outbox::{
    metrics::OutboxMetrics, KafkaOutboxPublisher, OutboxProcessor, SqlxOutboxRepository,
};

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub brokers: String,
    pub topic: String,
    pub batch_size: i32,
    pub poll_interval: Duration,
    pub max_retries: i32,
}

impl OutboxPublisherConfig {
    pub fn from_env() -> Self {
        Self {
            brokers: std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            topic: std::env::var("OUTBOX_TOPIC").unwrap_or_else(|_| "experiments.outbox".to_string()),
            batch_size: std::env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            poll_interval: Duration::from_millis(
                std::env::var("OUTBOX_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            max_retries: std::env::var("OUTBOX_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }
}

/// Build the processor that drains the outbox table into Kafka. The caller
/// is responsible for spawning `processor.start()` as a background task.
pub fn build_processor(
    pool: PgPool,
    config: OutboxPublisherConfig,
) -> Result<OutboxProcessor<SqlxOutboxRepository, KafkaOutboxPublisher>> {
    let repository = Arc::new(SqlxOutboxRepository::new(pool));

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .create()
        .map_err(|e| ExperimentsError::Kafka(e.to_string()))?;

    let publisher = Arc::new(KafkaOutboxPublisher::new(producer, config.topic));
    let metrics = OutboxMetrics::new("experiments-service");

    Ok(OutboxProcessor::new_with_metrics(
        repository,
        publisher,
        metrics,
        config.batch_size,
        config.poll_interval,
        config.max_retries,
    ))
}
