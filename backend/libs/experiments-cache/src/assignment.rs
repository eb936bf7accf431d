//! Cache wrapper for sticky variant assignments

use crate::{CacheKey, CacheOperations, CacheResult, ExperimentsCache};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cached assignment: just enough to answer a read without re-hashing or
/// re-touching the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAssignment {
    pub variant_id: Uuid,
    pub variant_key: String,
}

/// Cache wrapper over sticky assignments.
#[derive(Clone)]
pub struct AssignmentCache {
    cache: ExperimentsCache,
}

impl AssignmentCache {
    pub fn new(cache: ExperimentsCache) -> Self {
        Self { cache }
    }

    pub async fn get_assignment(
        &self,
        experiment_id: Uuid,
        unit_id: &str,
    ) -> CacheResult<Option<CachedAssignment>> {
        let key = CacheKey::assignment(experiment_id, unit_id);
        self.cache.get(&key).await
    }

    pub async fn set_assignment(
        &self,
        experiment_id: Uuid,
        unit_id: &str,
        assignment: &CachedAssignment,
    ) -> CacheResult<()> {
        let key = CacheKey::assignment(experiment_id, unit_id);
        self.cache
            .set(&key, assignment, crate::ttl::ASSIGNMENT)
            .await
    }

    /// Mark a unit as known to have no eligible assignment (holdout, or
    /// ineligibility rule matched) so repeated lookups short-circuit.
    pub async fn set_not_eligible(&self, experiment_id: Uuid, unit_id: &str) -> CacheResult<()> {
        let key = CacheKey::assignment(experiment_id, unit_id);
        self.cache.set_negative(&key).await
    }

    /// Drop every cached assignment for an experiment. Used when an
    /// experiment's variant set or traffic split changes, since existing
    /// cache entries would otherwise keep serving assignments computed
    /// against the old configuration.
    pub async fn invalidate_experiment(&self, experiment_id: Uuid) -> CacheResult<usize> {
        let pattern = CacheKey::assignment_pattern(experiment_id);
        self.cache.scan_del(&pattern).await
    }

    /// Batch-read assignments for multiple units in one round trip via MGET.
    pub async fn batch_get_assignments(
        &self,
        experiment_id: Uuid,
        unit_ids: &[String],
    ) -> CacheResult<Vec<Option<CachedAssignment>>> {
        if unit_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = unit_ids
            .iter()
            .map(|id| CacheKey::assignment(experiment_id, id))
            .collect();

        let mut conn = self.cache.redis.lock().await;
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut *conn)
            .await
            .map_err(crate::CacheError::Redis)?;
        drop(conn);

        Ok(raw
            .into_iter()
            .map(|entry| match entry {
                Some(data) if !ExperimentsCache::is_negative_cache(&data) => {
                    serde_json::from_str(&data).ok()
                }
                _ => None,
            })
            .collect())
    }
}
