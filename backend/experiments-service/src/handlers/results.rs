//! Results endpoint: query-parameterized, hot/cold-routed, Wilson-scored
//! variant comparison.

use crate::error::{ExperimentsError, Result};
use crate::services::results_engine::{Granularity, ResultsQuery};
use crate::services::ResultsEngine;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ResultsQueryParams {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub event_types: Option<String>,
    pub granularity: Option<String>,
    pub metrics: Option<String>,
    pub include_ci: Option<bool>,
    pub min_sample: Option<i64>,
    pub filters: Option<String>,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn get_results(
    engine: web::Data<Arc<ResultsEngine>>,
    experiment_id: web::Path<Uuid>,
    params: web::Query<ResultsQueryParams>,
) -> Result<HttpResponse> {
    let params = params.into_inner();

    let granularity = match params.granularity.as_deref() {
        None | Some("realtime") => Granularity::Realtime,
        Some("hour") => Granularity::Hour,
        Some("day") => Granularity::Day,
        Some(other) => {
            return Err(ExperimentsError::Validation(format!(
                "unsupported granularity '{other}', expected realtime|hour|day"
            )))
        }
    };

    let filters = match params.filters.as_deref() {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ExperimentsError::Validation(format!("invalid filters JSON: {e}")))?,
        None => serde_json::json!({}),
    };

    let query = ResultsQuery {
        start_date: params.start_date,
        end_date: params.end_date,
        event_types: params.event_types.as_deref().map(split_csv).unwrap_or_default(),
        granularity,
        metrics: params.metrics.as_deref().map(split_csv).unwrap_or_default(),
        include_ci: params.include_ci,
        min_sample: params.min_sample,
        filters,
    };

    let results = engine.results(*experiment_id, query).await?;
    Ok(HttpResponse::Ok().json(results))
}
