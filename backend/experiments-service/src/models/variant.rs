use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Variant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub key: String,
    pub name: String,
    pub allocation_pct: i32,
    pub is_control: bool,
    pub config: serde_json::Value,
}

/// Validate the invariants that must hold before an experiment can
/// transition to `active`: allocations sum to exactly 100, and at most one
/// variant is marked control.
pub fn validate_variant_set(variants: &[Variant]) -> Result<(), String> {
    if variants.is_empty() {
        return Err("experiment has no variants".to_string());
    }

    let sum: i32 = variants.iter().map(|v| v.allocation_pct).sum();
    if sum != 100 {
        return Err(format!(
            "variant allocations must sum to 100, got {sum}"
        ));
    }

    let control_count = variants.iter().filter(|v| v.is_control).count();
    if control_count > 1 {
        return Err(format!(
            "at most one variant may be marked is_control, got {control_count}"
        ));
    }

    let mut keys: Vec<&str> = variants.iter().map(|v| v.key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.len() != variants.len() {
        return Err("variant keys must be unique within an experiment".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(key: &str, pct: i32, control: bool) -> Variant {
        Variant {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            key: key.to_string(),
            name: key.to_string(),
            allocation_pct: pct,
            is_control: control,
            config: serde_json::json!({}),
        }
    }

    #[test]
    fn rejects_allocation_not_summing_to_100() {
        let variants = vec![variant("a", 50, true), variant("b", 40, false)];
        assert!(validate_variant_set(&variants).is_err());
    }

    #[test]
    fn rejects_multiple_controls() {
        let variants = vec![variant("a", 50, true), variant("b", 50, true)];
        assert!(validate_variant_set(&variants).is_err());
    }

    #[test]
    fn accepts_valid_set() {
        let variants = vec![variant("a", 50, true), variant("b", 50, false)];
        assert!(validate_variant_set(&variants).is_ok());
    }
}
