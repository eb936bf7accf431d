//! Cache key schema for the experiments service
//!
//! Key format: v{VERSION}:{entity}:{identifier}[:sub_key]

use uuid::Uuid;

/// Cache schema version - increment when changing key formats
pub const CACHE_VERSION: u32 = 1;

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    // ============= Assignment Keys =============

    /// Sticky assignment for a unit in an experiment.
    /// Format: v1:assignment:{experiment_id}:{unit_id}
    pub fn assignment(experiment_id: Uuid, unit_id: &str) -> String {
        format!("v{}:assignment:{}:{}", CACHE_VERSION, experiment_id, unit_id)
    }

    /// Pattern for all cached assignments of an experiment, used when an
    /// experiment's variant set changes and prior assignments must not be
    /// read back as valid.
    pub fn assignment_pattern(experiment_id: Uuid) -> String {
        format!("v{}:assignment:{}:*", CACHE_VERSION, experiment_id)
    }

    // ============= Results Keys =============

    /// Aggregated results for an experiment, keyed also on the experiment's
    /// version so a config change (new variant, reweighted traffic) can
    /// never be served against a stale aggregate.
    /// Format: v1:results:{experiment_id}:{version}
    pub fn results(experiment_id: Uuid, version: i32) -> String {
        format!("v{}:results:{}:{}", CACHE_VERSION, experiment_id, version)
    }

    /// Pattern for all cached result snapshots of an experiment, across
    /// versions.
    pub fn results_pattern(experiment_id: Uuid) -> String {
        format!("v{}:results:{}:*", CACHE_VERSION, experiment_id)
    }

    /// Results for one specific query shape against one experiment version.
    /// `query_fingerprint` is a caller-computed digest of the query dict, so
    /// two different date ranges/granularities never collide on the same
    /// key. Format: v1:results:{experiment_id}:{version}:{query_fingerprint}
    pub fn results_query(experiment_id: Uuid, version: i32, query_fingerprint: &str) -> String {
        format!(
            "v{}:results:{}:{}:{}",
            CACHE_VERSION, experiment_id, version, query_fingerprint
        )
    }

    // ============= Utility =============

    /// Extract entity type from key
    pub fn entity_type(key: &str) -> Option<&str> {
        // Format: v{N}:{entity}:...
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() >= 2 {
            Some(parts[1])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_key() {
        let exp_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = CacheKey::assignment(exp_id, "user-42");
        assert_eq!(
            key,
            "v1:assignment:550e8400-e29b-41d4-a716-446655440000:user-42"
        );
    }

    #[test]
    fn test_results_key() {
        let exp_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = CacheKey::results(exp_id, 3);
        assert_eq!(
            key,
            "v1:results:550e8400-e29b-41d4-a716-446655440000:3"
        );
    }

    #[test]
    fn test_entity_type() {
        assert_eq!(CacheKey::entity_type("v1:assignment:123:u1"), Some("assignment"));
        assert_eq!(CacheKey::entity_type("v1:results:123:1"), Some("results"));
        assert_eq!(CacheKey::entity_type("invalid"), None);
    }
}
