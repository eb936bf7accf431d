use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use experiments_service::config::Config;
use experiments_service::db::{AggregateRepo, AssignmentRepo, EventRepo, ExperimentRepo};
use experiments_service::handlers::{self, BatchLimits};
use experiments_service::jobs::{self, MaintenanceConfig, MaintenanceJob, OutboxPublisherConfig};
use experiments_service::metrics::{serve_metrics, MetricsMiddleware};
use experiments_service::services::cdc::{CdcConsumer, CdcConsumerConfig};
use experiments_service::services::{AssignmentEngine, BulkService, EventIngestor, ResultsEngine};
use experiments_cache::assignment::AssignmentCache;
use experiments_cache::results::ResultsCache;
use experiments_cache::ExperimentsCache;
use redis_utils::RedisPool;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::SqlxOutboxRepository;
use uuid::Uuid;

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug,experiments_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    tracing::info!("Starting experiments-service, env={}", config.app.env);

    let mut cfg = DbPoolConfig::for_service("experiments-service");
    if cfg.database_url.is_empty() {
        cfg.database_url = config.database.url.clone();
    }
    if cfg.max_connections < config.database.max_connections {
        cfg.max_connections = config.database.max_connections;
    }
    cfg.log_config();

    let db_pool = create_pg_pool(cfg)
        .await
        .context("Failed to create database pool")?;
    tracing::info!("Database pool created successfully");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations completed successfully");

    let outbox_repo = Arc::new(SqlxOutboxRepository::new(db_pool.clone()));

    let redis_pool = RedisPool::connect(&config.cache.url, None)
        .await
        .context("Failed to connect to Redis")?;
    let experiments_cache = ExperimentsCache::new(redis_pool.manager());
    let assignment_cache = Arc::new(AssignmentCache::new(experiments_cache.clone()));
    let results_cache = Arc::new(ResultsCache::new(experiments_cache));

    let aggregate_repo = Arc::new(AggregateRepo::new(db_pool.clone()));
    let experiment_repo = Arc::new(ExperimentRepo::with_outbox(db_pool.clone(), outbox_repo.clone()));
    let assignment_repo = Arc::new(AssignmentRepo::with_outbox(db_pool.clone(), outbox_repo.clone()));
    let event_repo = Arc::new(
        EventRepo::with_outbox(db_pool.clone(), outbox_repo.clone()).with_aggregates(aggregate_repo.clone()),
    );

    let assignment_engine = Arc::new(
        AssignmentEngine::with_cache(
            experiment_repo.clone(),
            assignment_repo.clone(),
            assignment_cache.clone(),
        )
        .with_bucket_size(config.assignment.bucket_size),
    );
    let bulk_service = Arc::new(
        BulkService::with_cache(experiment_repo.clone(), assignment_repo.clone(), assignment_cache)
            .with_bucket_size(config.assignment.bucket_size),
    );
    let event_ingestor = Arc::new(EventIngestor::new(event_repo, assignment_repo));

    let results_engine = Arc::new(
        ResultsEngine::with_cache(db_pool.clone(), experiment_repo.clone(), results_cache)
            .with_min_sample(config.results.default_min_sample),
    );

    let outbox_enabled = std::env::var("OUTBOX_PUBLISHER_ENABLED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    if outbox_enabled {
        let outbox_config = OutboxPublisherConfig::from_env();
        tracing::info!(
            brokers = %outbox_config.brokers,
            batch_size = outbox_config.batch_size,
            "Starting outbox publisher"
        );
        match jobs::build_processor(db_pool.clone(), outbox_config) {
            Ok(processor) => {
                tokio::spawn(async move {
                    if let Err(e) = processor.start().await {
                        tracing::error!("outbox publisher failed: {:?}", e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("failed to build outbox publisher: {:?}", e);
                tracing::warn!("experiments-service will run without outbox publishing");
            }
        }
    } else {
        tracing::warn!("OUTBOX_PUBLISHER_ENABLED=false - skipping outbox publisher start");
    }

    let cdc_enabled = std::env::var("CDC_CONSUMER_ENABLED")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true);
    let cdc_consumer: Option<Arc<CdcConsumer>> = if cdc_enabled {
        let cdc_config = CdcConsumerConfig::from_env();
        tracing::info!(
            brokers = %cdc_config.brokers,
            topics = ?cdc_config.topics,
            "Starting CDC consumer"
        );
        match CdcConsumer::new(cdc_config) {
            Ok(consumer) => {
                let consumer = Arc::new(consumer);
                let spawned = consumer.clone();
                tokio::spawn(async move {
                    if let Err(e) = spawned.run().await {
                        tracing::error!("CDC consumer failed: {:?}", e);
                    }
                });
                Some(consumer)
            }
            Err(e) => {
                tracing::error!("failed to build CDC consumer: {:?}", e);
                tracing::warn!("experiments-service will run without the CDC consumer");
                None
            }
        }
    } else {
        tracing::info!("CDC_CONSUMER_ENABLED=false - skipping CDC consumer start");
        None
    };

    let maintenance_job = MaintenanceJob::new(db_pool.clone(), MaintenanceConfig::from_env());
    tokio::spawn(async move {
        if let Err(e) = maintenance_job.run().await {
            tracing::error!("maintenance job failed: {:?}", e);
        }
    });

    async fn outbox_stats(outbox_repo: web::Data<Arc<SqlxOutboxRepository>>) -> HttpResponse {
        match outbox_repo.pending_stats().await {
            Ok((pending, age_seconds)) => HttpResponse::Ok().json(serde_json::json!({
                "pending_count": pending,
                "oldest_pending_age_seconds": age_seconds,
            })),
            Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
        }
    }

    #[derive(serde::Deserialize)]
    struct ReplaySinceQuery {
        ts: String,
    }

    async fn outbox_replay_since(
        outbox_repo: web::Data<Arc<SqlxOutboxRepository>>,
        query: web::Query<ReplaySinceQuery>,
    ) -> HttpResponse {
        match DateTime::parse_from_rfc3339(&query.ts).map(|dt| dt.with_timezone(&Utc)) {
            Ok(ts) => match outbox_repo.replay_since(ts).await {
                Ok(count) => HttpResponse::Ok().json(serde_json::json!({
                    "replayed": count,
                    "since": query.ts,
                })),
                Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
            },
            Err(e) => HttpResponse::BadRequest().body(format!("invalid ts: {}", e)),
        }
    }

    #[derive(serde::Deserialize)]
    struct ReplayRangeQuery {
        from_id: Uuid,
        to_id: Uuid,
    }

    async fn outbox_replay_range(
        outbox_repo: web::Data<Arc<SqlxOutboxRepository>>,
        query: web::Query<ReplayRangeQuery>,
    ) -> HttpResponse {
        match outbox_repo.replay_range(query.from_id, query.to_id).await {
            Ok(count) => HttpResponse::Ok().json(serde_json::json!({
                "replayed": count,
                "from_id": query.from_id,
                "to_id": query.to_id,
            })),
            Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
        }
    }

    async fn health(cdc_consumer: web::Data<Option<Arc<CdcConsumer>>>) -> HttpResponse {
        match cdc_consumer.as_ref() {
            Some(consumer) if !consumer.is_healthy() => {
                let status = consumer.status();
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "cdc_consumer_healthy": status.healthy,
                    "consecutive_errors": status.consecutive_errors,
                }))
            }
            _ => HttpResponse::Ok().body("OK"),
        }
    }

    let batch_limits = BatchLimits {
        max_rows: config.ingestor.batch_max_rows,
        max_bytes: config.ingestor.batch_max_bytes,
    };

    let http_port = config.app.port;
    let http_host = config.app.host.clone();

    tracing::info!("Starting HTTP server on {}:{}", http_host, http_port);

    HttpServer::new(move || {
        let mut cors = Cors::default();
        for origin in config.cors.allowed_origins.split(',') {
            let origin = origin.trim();
            if origin == "*" {
                cors = cors.allow_any_origin();
            } else {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header().max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(MetricsMiddleware)
            .app_data(web::Data::new(experiment_repo.clone()))
            .app_data(web::Data::new(assignment_engine.clone()))
            .app_data(web::Data::new(bulk_service.clone()))
            .app_data(web::Data::new(event_ingestor.clone()))
            .app_data(web::Data::new(results_engine.clone()))
            .app_data(web::Data::new(outbox_repo.clone()))
            .app_data(web::Data::new(batch_limits))
            .app_data(web::Data::new(cdc_consumer.clone()))
            .route("/health", web::get().to(health))
            .route("/ready", web::get().to(|| async { "READY" }))
            .route("/metrics", web::get().to(serve_metrics))
            .route("/experiments", web::post().to(handlers::create_experiment))
            .route("/experiments/{id}", web::get().to(handlers::get_experiment))
            .route(
                "/experiments/by-key/{key}",
                web::get().to(handlers::get_experiment_by_key),
            )
            .route(
                "/experiments/{id}/activate",
                web::post().to(handlers::activate_experiment),
            )
            .route(
                "/experiments/{id}/pause",
                web::post().to(handlers::pause_experiment),
            )
            .route(
                "/experiments/{id}/complete",
                web::post().to(handlers::complete_experiment),
            )
            .route(
                "/experiments/{id}/archive",
                web::post().to(handlers::archive_experiment),
            )
            .route(
                "/experiments/{id}/variants/allocations",
                web::patch().to(handlers::update_variant_allocations),
            )
            .route(
                "/experiments/{id}/results",
                web::get().to(handlers::get_results),
            )
            .route(
                "/experiments/{experiment_id}/assignments/{user_id}",
                web::get().to(handlers::get_assignment),
            )
            .route(
                "/experiments/{experiment_id}/assignments/bulk",
                web::post().to(handlers::bulk_get_for_experiment),
            )
            .route(
                "/users/{user_id}/assignments/bulk",
                web::post().to(handlers::bulk_get_for_user),
            )
            .route("/events", web::post().to(handlers::record_event))
            .route("/events/batch", web::post().to(handlers::record_event_batch))
            .route("/admin/outbox/stats", web::get().to(outbox_stats))
            .route(
                "/admin/outbox/replay_since",
                web::post().to(outbox_replay_since),
            )
            .route(
                "/admin/outbox/replay_range",
                web::post().to(outbox_replay_range),
            )
    })
    .bind((http_host.as_str(), http_port))
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")
}
