//! Component C8: the many-users-one-experiment bulk shape. The
//! one-user-many-experiments shape lives on `AssignmentEngine::get_bulk_for_user`
//! directly, since it reuses the same per-experiment variant lookup; this
//! module covers the complementary direction, where a single experiment's
//! variant set is held fixed across a batch of users.

use crate::db::{AssignmentRepo, ExperimentRepo};
use crate::error::Result;
use crate::hashing::{self, VariantBucket};
use crate::models::AssignmentSource;
use crate::services::assignment_engine::AssignmentView;
use experiments_cache::assignment::{AssignmentCache, CachedAssignment};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct BulkService {
    experiment_repo: Arc<ExperimentRepo>,
    assignment_repo: Arc<AssignmentRepo>,
    cache: Option<Arc<AssignmentCache>>,
    bucket_size: u32,
}

impl BulkService {
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

    /// Resolve (and create) assignments for every user in `user_ids` against
    /// one experiment. Cache reads are pipelined via `MGET`, the OLTP probe
    /// is a single `IN` query, and the upsert batches every still-missing
    /// user in one pass - no bulk path bypasses the unique-constraint
    /// idempotency guarantee.
    pub async fn get_bulk_for_experiment(
        &self,
        experiment_id: Uuid,
        user_ids: &[String],
    ) -> Result<Vec<AssignmentView>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let variants = self.experiment_repo.list_variants(experiment_id).await?;
        let variant_key_by_id: HashMap<Uuid, String> =
            variants.iter().map(|v| (v.id, v.key.clone())).collect();

        let mut results = Vec::with_capacity(user_ids.len());
        let mut misses = Vec::new();

        if let Some(cache) = &self.cache {
            match cache.batch_get_assignments(experiment_id, user_ids).await {
                Ok(cached) => {
                    for (user_id, slot) in user_ids.iter().zip(cached.into_iter()) {
                        match slot {
                            Some(c) => results.push(AssignmentView {
                                experiment_id,
                                user_id: user_id.clone(),
                                variant_id: c.variant_id,
                                variant_key: c.variant_key,
                            }),
                            None => misses.push(user_id.clone()),
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(%experiment_id, "batch assignment cache read failed: {}", err);
                    misses.extend(user_ids.iter().cloned());
                }
            }
        } else {
            misses.extend(user_ids.iter().cloned());
        }

        if misses.is_empty() {
            return Ok(results);
        }

        let existing = self.assignment_repo.get_for_experiment(experiment_id, &misses).await?;
        let mut still_missing = Vec::new();
        let mut newly_cached = Vec::new();
        for user_id in misses {
            if let Some(assignment) = existing.get(&user_id) {
                let variant_key = variant_key_by_id
                    .get(&assignment.variant_id)
                    .cloned()
                    .unwrap_or_default();
                let view = AssignmentView {
                    experiment_id,
                    user_id: user_id.clone(),
                    variant_id: assignment.variant_id,
                    variant_key: variant_key.clone(),
                };
                newly_cached.push((user_id, view.variant_id, variant_key));
                results.push(view);
            } else {
                still_missing.push(user_id);
            }
        }

        if !still_missing.is_empty() {
            let experiment = self.experiment_repo.get_by_id(experiment_id).await?;
            let buckets: Vec<VariantBucket> = variants
                .iter()
                .map(|v| VariantBucket {
                    id: v.id,
                    allocation_pct: v.allocation_pct,
                })
                .collect();

            let mut picks = Vec::with_capacity(still_missing.len());
            for user_id in &still_missing {
                if let Some(variant_id) =
                    hashing::assign_with_bucket_size(user_id, &experiment.seed, &buckets, self.bucket_size)
                {
                    picks.push((user_id.clone(), variant_id));
                }
            }

            let inserted = self
                .assignment_repo
                .insert_batch(experiment_id, experiment.version, &picks, AssignmentSource::Hash)
                .await?;

            for (user_id, variant_id) in picks {
                if let Some(assignment) = inserted.get(&user_id) {
                    let variant_key = variant_key_by_id
                        .get(&assignment.variant_id)
                        .cloned()
                        .unwrap_or_default();
                    newly_cached.push((user_id.clone(), assignment.variant_id, variant_key.clone()));
                    results.push(AssignmentView {
                        experiment_id,
                        user_id,
                        variant_id: assignment.variant_id,
                        variant_key,
                    });
                } else {
                    tracing::warn!(
                        %experiment_id, %user_id, %variant_id,
                        "bulk insert did not return a row for a computed pick; dropping it from the response"
                    );
                }
            }
        }

        if let Some(cache) = &self.cache {
            for (user_id, variant_id, variant_key) in newly_cached {
                let cached = CachedAssignment { variant_id, variant_key };
                if let Err(err) = cache.set_assignment(experiment_id, &user_id, &cached).await {
                    tracing::debug!(%experiment_id, %user_id, "assignment cache write failed: {}", err);
                }
            }
        }

        Ok(results)
    }
}
