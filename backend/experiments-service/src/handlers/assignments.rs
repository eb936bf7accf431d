//! Assignment resolution endpoints: single, one-user-many-experiments, and
//! many-users-one-experiment bulk shapes.

use crate::error::Result;
use crate::services::{AssignmentEngine, BulkService};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct GetAssignmentQuery {
    #[serde(default)]
    pub enroll: bool,
}

pub async fn get_assignment(
    engine: web::Data<Arc<AssignmentEngine>>,
    path: web::Path<(Uuid, String)>,
    query: web::Query<GetAssignmentQuery>,
) -> Result<HttpResponse> {
    let (experiment_id, user_id) = path.into_inner();
    let assignment = engine
        .get_or_create(experiment_id, &user_id, query.enroll)
        .await?;
    Ok(HttpResponse::Ok().json(assignment))
}

#[derive(Debug, Deserialize)]
pub struct BulkGetForUserRequest {
    pub experiment_ids: Vec<Uuid>,
}

pub async fn bulk_get_for_user(
    engine: web::Data<Arc<AssignmentEngine>>,
    user_id: web::Path<String>,
    req: web::Json<BulkGetForUserRequest>,
) -> Result<HttpResponse> {
    let assignments = engine
        .get_bulk_for_user(&user_id, &req.experiment_ids)
        .await?;
    Ok(HttpResponse::Ok().json(assignments))
}

#[derive(Debug, Deserialize)]
pub struct BulkGetForExperimentRequest {
    pub user_ids: Vec<String>,
}

pub async fn bulk_get_for_experiment(
    bulk: web::Data<Arc<BulkService>>,
    experiment_id: web::Path<Uuid>,
    req: web::Json<BulkGetForExperimentRequest>,
) -> Result<HttpResponse> {
    let assignments = bulk
        .get_bulk_for_experiment(*experiment_id, &req.user_ids)
        .await?;
    Ok(HttpResponse::Ok().json(assignments))
}
