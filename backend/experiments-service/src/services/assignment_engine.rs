//! Component C3: resolves (and creates) the variant a user is bucketed into
//! for an experiment. Cache-aside in front of OLTP, OLTP unique constraint
//! in front of the hash allocator - no part of this path takes an
//! application-level lock.

use crate::db::{AssignmentRepo, ExperimentRepo};
use crate::error::{ExperimentsError, Result};
use crate::hashing::{self, VariantBucket};
use crate::models::{Assignment, AssignmentSource, Experiment, Variant};
use experiments_cache::assignment::{AssignmentCache, CachedAssignment};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentView {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub variant_id: Uuid,
    pub variant_key: String,
}

pub struct AssignmentEngine {
    experiment_repo: Arc<ExperimentRepo>,
    assignment_repo: Arc<AssignmentRepo>,
    cache: Option<Arc<AssignmentCache>>,
    bucket_size: u32,
}

impl AssignmentEngine {
    pub fn new(experiment_repo: Arc<ExperimentRepo>, assignment_repo: Arc<AssignmentRepo>) -> Self {
        Self {
            experiment_repo,
            assignment_repo,
            cache: None,
            bucket_size: hashing::DEFAULT_BUCKET_SIZE,
        }
    }

    pub fn with_cache(
        experiment_repo: Arc<ExperimentRepo>,
        assignment_repo: Arc<AssignmentRepo>,
        cache: Arc<AssignmentCache>,
    ) -> Self {
        Self {
            experiment_repo,
            assignment_repo,
            cache: Some(cache),
            bucket_size: hashing::DEFAULT_BUCKET_SIZE,
        }
    }

    /// Override the hash allocator's bucket space size (default 10,000).
    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Resolve the caller's variant for `experiment_id`, computing and
    /// persisting a new assignment if one doesn't exist yet. `enroll=true`
    /// additionally stamps the assignment's one-shot `enrolled_at` if it
    /// isn't set already - callers use this to mark the point a user
    /// actually saw the treatment, distinct from merely being bucketed.
    pub async fn get_or_create(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        enroll: bool,
    ) -> Result<AssignmentView> {
        if let Some(cache) = &self.cache {
            match cache.get_assignment(experiment_id, user_id).await {
                Ok(Some(cached)) => {
                    if enroll {
                        self.enroll_if_needed(experiment_id, user_id).await;
                    }
                    return Ok(AssignmentView {
                        experiment_id,
                        user_id: user_id.to_string(),
                        variant_id: cached.variant_id,
                        variant_key: cached.variant_key,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(%experiment_id, %user_id, "assignment cache read failed: {}", err);
                }
            }
        }

        let variants = self.experiment_repo.list_variants(experiment_id).await?;
        let variant_by_id: HashMap<Uuid, &Variant> = variants.iter().map(|v| (v.id, v)).collect();

        if let Some(existing) = self.assignment_repo.get(experiment_id, user_id).await? {
            if enroll {
                self.enroll_if_needed(experiment_id, user_id).await;
            }
            let view = self.view_from_assignment(&existing, &variant_by_id)?;
            self.populate_cache(&view).await;
            return Ok(view);
        }

        let experiment = self.experiment_repo.get_by_id(experiment_id).await?;
        if !experiment.is_eligible_at(chrono::Utc::now()) {
            if let Some(cache) = &self.cache {
                if let Err(err) = cache.set_not_eligible(experiment_id, user_id).await {
                    tracing::debug!(%experiment_id, %user_id, "negative cache write failed: {}", err);
                }
            }
            return Err(ExperimentsError::NotEligible(format!(
                "experiment {experiment_id} is not accepting new assignments"
            )));
        }

        let variant_id = self.pick_variant(&experiment, &variants, user_id)?;

        let assignment = self
            .assignment_repo
            .get_or_insert(
                experiment_id,
                user_id,
                variant_id,
                experiment.version,
                AssignmentSource::Hash,
                serde_json::json!({}),
            )
            .await?;

        if enroll {
            self.enroll_if_needed(experiment_id, user_id).await;
        }

        let view = self.view_from_assignment(&assignment, &variant_by_id)?;
        self.populate_cache(&view).await;
        Ok(view)
    }

    async fn enroll_if_needed(&self, experiment_id: Uuid, user_id: &str) {
        if let Err(err) = self.assignment_repo.enroll(experiment_id, user_id).await {
            tracing::warn!(%experiment_id, %user_id, "failed to record enrollment: {}", err);
        }
    }

    /// One-user-many-experiments bulk shape: resolve (or create) assignments
    /// for every experiment in `experiment_ids`. Experiments the user isn't
    /// eligible for are omitted from the result rather than erroring the
    /// whole batch.
    pub async fn get_bulk_for_user(
        &self,
        user_id: &str,
        experiment_ids: &[Uuid],
    ) -> Result<Vec<AssignmentView>> {
        let mut results = Vec::with_capacity(experiment_ids.len());
        let mut misses = Vec::new();

        if let Some(cache) = &self.cache {
            for &experiment_id in experiment_ids {
                match cache.get_assignment(experiment_id, user_id).await {
                    Ok(Some(cached)) => results.push(AssignmentView {
                        experiment_id,
                        user_id: user_id.to_string(),
                        variant_id: cached.variant_id,
                        variant_key: cached.variant_key,
                    }),
                    Ok(None) => misses.push(experiment_id),
                    Err(err) => {
                        tracing::debug!(%experiment_id, %user_id, "assignment cache read failed: {}", err);
                        misses.push(experiment_id);
                    }
                }
            }
        } else {
            misses.extend(experiment_ids.iter().copied());
        }

        let existing = self.assignment_repo.get_for_user(user_id, &misses).await?;
        let mut still_missing = Vec::new();
        for experiment_id in misses {
            if let Some(assignment) = existing.get(&experiment_id) {
                let variants = self.experiment_repo.list_variants(experiment_id).await?;
                let variant_by_id: HashMap<Uuid, &Variant> = variants.iter().map(|v| (v.id, v)).collect();
                let view = self.view_from_assignment(assignment, &variant_by_id)?;
                self.populate_cache(&view).await;
                results.push(view);
            } else {
                still_missing.push(experiment_id);
            }
        }

        for experiment_id in still_missing {
            match self.get_or_create(experiment_id, user_id, false).await {
                Ok(view) => results.push(view),
                Err(ExperimentsError::NotEligible(_)) | Err(ExperimentsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(results)
    }

    fn pick_variant(&self, experiment: &Experiment, variants: &[Variant], user_id: &str) -> Result<Uuid> {
        let buckets: Vec<VariantBucket> = variants
            .iter()
            .map(|v| VariantBucket {
                id: v.id,
                allocation_pct: v.allocation_pct,
            })
            .collect();
        hashing::assign_with_bucket_size(user_id, &experiment.seed, &buckets, self.bucket_size)
            .ok_or_else(|| ExperimentsError::Validation("experiment has no variants".to_string()))
    }

    fn view_from_assignment(
        &self,
        assignment: &Assignment,
        variant_by_id: &HashMap<Uuid, &Variant>,
    ) -> Result<AssignmentView> {
        let variant_key = variant_by_id
            .get(&assignment.variant_id)
            .map(|v| v.key.clone())
            .ok_or_else(|| {
                ExperimentsError::Internal(format!(
                    "assignment {} references unknown variant {}",
                    assignment.id, assignment.variant_id
                ))
            })?;
        Ok(AssignmentView {
            experiment_id: assignment.experiment_id,
            user_id: assignment.user_id.clone(),
            variant_id: assignment.variant_id,
            variant_key,
        })
    }

    async fn populate_cache(&self, view: &AssignmentView) {
        if let Some(cache) = &self.cache {
            let cached = CachedAssignment {
                variant_id: view.variant_id,
                variant_key: view.variant_key.clone(),
            };
            if let Err(err) = cache.set_assignment(view.experiment_id, &view.user_id, &cached).await {
                tracing::debug!(experiment_id = %view.experiment_id, user_id = %view.user_id, "assignment cache write failed: {}", err);
            }
        }
    }
}
