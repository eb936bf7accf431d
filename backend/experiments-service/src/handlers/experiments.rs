//! Experiment lifecycle endpoints: create and transition status.

use crate::db::experiment_repo::{NewVariant, VariantAllocationUpdate};
use crate::db::ExperimentRepo;
use crate::error::Result;
use crate::models::ExperimentStatus;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct VariantInput {
    pub key: String,
    pub name: String,
    pub allocation_pct: i32,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub key: String,
    pub name: String,
    pub seed: Option<String>,
    pub variants: Vec<VariantInput>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub async fn create_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    req: web::Json<CreateExperimentRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();
    let seed = req.seed.unwrap_or_else(|| Uuid::new_v4().to_string());
    let variants: Vec<NewVariant> = req
        .variants
        .into_iter()
        .map(|v| NewVariant {
            key: v.key,
            name: v.name,
            allocation_pct: v.allocation_pct,
            is_control: v.is_control,
            config: v.config,
        })
        .collect();

    let (experiment, variants) = repo
        .create(
            &req.key,
            &req.name,
            &seed,
            req.starts_at,
            req.ends_at,
            req.config,
            &variants,
        )
        .await?;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "experiment": experiment,
        "variants": variants,
    })))
}

pub async fn get_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let experiment = repo.get_by_id(*experiment_id).await?;
    let variants = repo.list_variants(*experiment_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "experiment": experiment,
        "variants": variants,
    })))
}

pub async fn get_experiment_by_key(
    repo: web::Data<Arc<ExperimentRepo>>,
    key: web::Path<String>,
) -> Result<HttpResponse> {
    let experiment = repo.get_by_key(&key).await?;
    let variants = repo.list_variants(experiment.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "experiment": experiment,
        "variants": variants,
    })))
}

async fn transition(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
    new_status: ExperimentStatus,
) -> Result<HttpResponse> {
    let experiment = repo.transition_status(*experiment_id, new_status).await?;
    Ok(HttpResponse::Ok().json(experiment))
}

pub async fn activate_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    transition(repo, experiment_id, ExperimentStatus::Active).await
}

pub async fn pause_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    transition(repo, experiment_id, ExperimentStatus::Paused).await
}

pub async fn complete_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    transition(repo, experiment_id, ExperimentStatus::Completed).await
}

pub async fn archive_experiment(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    transition(repo, experiment_id, ExperimentStatus::Archived).await
}

#[derive(Debug, Deserialize)]
pub struct VariantAllocationInput {
    pub variant_id: Uuid,
    pub allocation_pct: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariantAllocationsRequest {
    pub variants: Vec<VariantAllocationInput>,
}

pub async fn update_variant_allocations(
    repo: web::Data<Arc<ExperimentRepo>>,
    experiment_id: web::Path<Uuid>,
    req: web::Json<UpdateVariantAllocationsRequest>,
) -> Result<HttpResponse> {
    let updates: Vec<VariantAllocationUpdate> = req
        .into_inner()
        .variants
        .into_iter()
        .map(|v| VariantAllocationUpdate {
            variant_id: v.variant_id,
            allocation_pct: v.allocation_pct,
        })
        .collect();

    let (experiment, variants) = repo
        .update_variant_allocations(*experiment_id, &updates)
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "experiment": experiment,
        "variants": variants,
    })))
}
