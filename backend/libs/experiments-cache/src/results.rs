//! Cache wrapper for aggregated experiment results

use crate::{CacheKey, CacheOperations, CacheResult, ExperimentsCache};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Cache wrapper over computed result snapshots.
///
/// Keyed on `(experiment_id, version)` so a config change invalidates
/// every prior snapshot implicitly, without an explicit delete.
#[derive(Clone)]
pub struct ResultsCache {
    cache: ExperimentsCache,
}

impl ResultsCache {
    pub fn new(cache: ExperimentsCache) -> Self {
        Self { cache }
    }

    pub async fn get<T: DeserializeOwned + Send>(
        &self,
        experiment_id: Uuid,
        version: i32,
    ) -> CacheResult<Option<T>> {
        let key = CacheKey::results(experiment_id, version);
        self.cache.get(&key).await
    }

    pub async fn set<T: Serialize + Send + Sync>(
        &self,
        experiment_id: Uuid,
        version: i32,
        value: &T,
        is_final: bool,
    ) -> CacheResult<()> {
        let key = CacheKey::results(experiment_id, version);
        let ttl = if is_final {
            crate::ttl::RESULTS_STABLE
        } else {
            crate::ttl::RESULTS_REALTIME
        };
        self.cache.set(&key, value, ttl).await
    }

    /// Same as [`Self::get`], keyed additionally on a query fingerprint so
    /// distinct date ranges/granularities never collide on one cache entry.
    pub async fn get_query<T: DeserializeOwned + Send>(
        &self,
        experiment_id: Uuid,
        version: i32,
        query_fingerprint: &str,
    ) -> CacheResult<Option<T>> {
        let key = CacheKey::results_query(experiment_id, version, query_fingerprint);
        self.cache.get(&key).await
    }

    /// Same as [`Self::set`], keyed additionally on a query fingerprint.
    /// `realtime` controls the TTL the same way `is_final` does for
    /// [`Self::set`] - a realtime query is re-served far sooner.
    pub async fn set_query<T: Serialize + Send + Sync>(
        &self,
        experiment_id: Uuid,
        version: i32,
        query_fingerprint: &str,
        value: &T,
        realtime: bool,
    ) -> CacheResult<()> {
        let key = CacheKey::results_query(experiment_id, version, query_fingerprint);
        let ttl = if realtime {
            crate::ttl::RESULTS_REALTIME
        } else {
            crate::ttl::RESULTS_STABLE
        };
        self.cache.set(&key, value, ttl).await
    }

    /// Drop every cached snapshot for an experiment, across versions.
    pub async fn invalidate_experiment(&self, experiment_id: Uuid) -> CacheResult<usize> {
        let pattern = CacheKey::results_pattern(experiment_id);
        self.cache.scan_del(&pattern).await
    }
}
