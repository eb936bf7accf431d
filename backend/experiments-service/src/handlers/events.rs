//! Event ingestion endpoints: single record and grouped batch.

use crate::error::Result;
use crate::models::NewEvent;
use crate::services::EventIngestor;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Caps enforced on `POST /events/batch`, per `ingestor.batch_max_rows` /
/// `ingestor.batch_max_bytes`. One oversized request fails outright rather
/// than being silently truncated.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
}

pub async fn record_event(
    ingestor: web::Data<Arc<EventIngestor>>,
    req: web::Json<NewEvent>,
) -> Result<HttpResponse> {
    let event = ingestor.record(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "event_id": event.id })))
}

#[derive(Debug, Deserialize)]
pub struct RecordEventBatchRequest {
    pub events: Vec<NewEvent>,
}

#[derive(Debug, Serialize)]
struct BatchFailure {
    index: usize,
    reason: String,
}

#[derive(Debug, Serialize)]
struct RecordEventBatchResponse {
    successes: usize,
    failures: Vec<BatchFailure>,
}

pub async fn record_event_batch(
    ingestor: web::Data<Arc<EventIngestor>>,
    limits: web::Data<BatchLimits>,
    req: web::Json<RecordEventBatchRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();

    if req.events.len() > limits.max_rows {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!(
                "batch has {} events, exceeds ingestor.batch_max_rows={}",
                req.events.len(),
                limits.max_rows
            ),
        })));
    }
    let approx_bytes = serde_json::to_vec(&req.events).map(|v| v.len()).unwrap_or(0);
    if approx_bytes > limits.max_bytes {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!(
                "batch is {} bytes, exceeds ingestor.batch_max_bytes={}",
                approx_bytes, limits.max_bytes
            ),
        })));
    }

    let results = ingestor.record_batch(req.events).await;

    let mut successes = 0;
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(_) => successes += 1,
            Err(err) => failures.push(BatchFailure {
                index,
                reason: err.to_string(),
            }),
        }
    }

    Ok(HttpResponse::Ok().json(RecordEventBatchResponse {
        successes,
        failures,
    }))
}
