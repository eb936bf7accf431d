//! Configuration for the experiments service, loaded entirely from
//! environment variables.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub cors: CorsConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub kafka: KafkaConfig,
    pub assignment: AssignmentConfig,
    pub ingestor: IngestorConfig,
    pub cdc: CdcConfig,
    pub retention: RetentionConfig,
    pub results: ResultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Cache TTLs, per §10.3. Results TTLs are split realtime/other because an
/// active experiment's results change far faster than a completed one's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    pub assignment_ttl_secs: u64,
    pub results_ttl_realtime_secs: u64,
    pub results_ttl_other_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub outbox_topic: String,
}

/// Hash allocator bucket resolution. 10_000 gives 0.01pp allocation
/// granularity - more than enough for any realistic variant split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    pub bucket_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    pub batch_max_rows: usize,
    pub batch_max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub dlq_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub events_days: i64,
    pub outbox_days: i64,
    pub projected_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    pub default_min_sample: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                host: std::env::var("EXPERIMENTS_SERVICE_HOST")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8000),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "*".to_string()),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/experiments".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(20),
            },
            cache: CacheConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                assignment_ttl_secs: std::env::var("CACHE_ASSIGNMENT_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(7 * 24 * 3600),
                results_ttl_realtime_secs: std::env::var("CACHE_RESULTS_TTL_REALTIME_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
                results_ttl_other_secs: std::env::var("CACHE_RESULTS_TTL_OTHER_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            },
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                outbox_topic: std::env::var("OUTBOX_TOPIC")
                    .unwrap_or_else(|_| "experiments.outbox".to_string()),
            },
            assignment: AssignmentConfig {
                bucket_size: std::env::var("ASSIGNMENT_BUCKET_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
            },
            ingestor: IngestorConfig {
                batch_max_rows: std::env::var("INGESTOR_BATCH_MAX_ROWS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
                batch_max_bytes: std::env::var("INGESTOR_BATCH_MAX_BYTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5 * 1024 * 1024),
            },
            cdc: CdcConfig {
                batch_size: std::env::var("CDC_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
                flush_interval_ms: std::env::var("CDC_FLUSH_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5000),
                dlq_topic: std::env::var("CDC_DLQ_TOPIC")
                    .unwrap_or_else(|_| "experiments.cdc.dlq".to_string()),
            },
            retention: RetentionConfig {
                events_days: std::env::var("RETENTION_EVENTS_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(400),
                outbox_days: std::env::var("RETENTION_OUTBOX_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(14),
                projected_days: std::env::var("RETENTION_PROJECTED_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(400),
            },
            results: ResultsConfig {
                default_min_sample: std::env::var("RESULTS_DEFAULT_MIN_SAMPLE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(100),
            },
        })
    }
}
