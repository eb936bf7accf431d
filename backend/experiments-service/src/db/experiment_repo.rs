use crate::error::{ExperimentsError, Result};
use crate::models::{validate_variant_set, Experiment, ExperimentStatus, Variant};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use transactional_outbox::{publish_event, SqlxOutboxRepository};
use uuid::Uuid;

pub struct NewVariant {
    pub key: String,
    pub name: String,
    pub allocation_pct: i32,
    pub is_control: bool,
    pub config: serde_json::Value,
}

/// One variant's new allocation, as part of a reweighting edit.
pub struct VariantAllocationUpdate {
    pub variant_id: Uuid,
    pub allocation_pct: i32,
}

pub struct ExperimentRepo {
    pool: PgPool,
    outbox_repo: Option<Arc<SqlxOutboxRepository>>,
}

impl ExperimentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            outbox_repo: None,
        }
    }

    pub fn with_outbox(pool: PgPool, outbox_repo: Arc<SqlxOutboxRepository>) -> Self {
        Self {
            pool,
            outbox_repo: Some(outbox_repo),
        }
    }

    pub async fn get_by_id(&self, experiment_id: Uuid) -> Result<Experiment> {
        sqlx::query_as::<_, Experiment>(
            r#"
            SELECT id, key, name, status, seed, version, starts_at, ends_at, config,
                   created_at, updated_at
            FROM experiments
            WHERE id = $1
            "#,
        )
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ExperimentsError::NotFound(format!("experiment {experiment_id} not found")))
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Experiment> {
        sqlx::query_as::<_, Experiment>(
            r#"
            SELECT id, key, name, status, seed, version, starts_at, ends_at, config,
                   created_at, updated_at
            FROM experiments
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ExperimentsError::NotFound(format!("experiment '{key}' not found")))
    }

    pub async fn list_variants(&self, experiment_id: Uuid) -> Result<Vec<Variant>> {
        let variants = sqlx::query_as::<_, Variant>(
            r#"
            SELECT id, experiment_id, key, name, allocation_pct, is_control, config
            FROM variants
            WHERE experiment_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(variants)
    }

    /// Create a draft experiment with its variant set. Seed is generated once
    /// and never changes for the lifetime of the experiment.
    pub async fn create(
        &self,
        key: &str,
        name: &str,
        seed: &str,
        starts_at: Option<chrono::DateTime<chrono::Utc>>,
        ends_at: Option<chrono::DateTime<chrono::Utc>>,
        config: serde_json::Value,
        variants: &[NewVariant],
    ) -> Result<(Experiment, Vec<Variant>)> {
        if variants.is_empty() {
            return Err(ExperimentsError::Validation(
                "experiment must define at least one variant".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            INSERT INTO experiments (key, name, status, seed, version, starts_at, ends_at, config)
            VALUES ($1, $2, 'draft', $3, 1, $4, $5, $6)
            RETURNING id, key, name, status, seed, version, starts_at, ends_at, config,
                      created_at, updated_at
            "#,
        )
        .bind(key)
        .bind(name)
        .bind(seed)
        .bind(starts_at)
        .bind(ends_at)
        .bind(config)
        .fetch_one(&mut *tx)
        .await?;

        let mut inserted = Vec::with_capacity(variants.len());
        for variant in variants {
            let row = sqlx::query_as::<_, Variant>(
                r#"
                INSERT INTO variants (experiment_id, key, name, allocation_pct, is_control, config)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, experiment_id, key, name, allocation_pct, is_control, config
                "#,
            )
            .bind(experiment.id)
            .bind(&variant.key)
            .bind(&variant.name)
            .bind(variant.allocation_pct)
            .bind(variant.is_control)
            .bind(&variant.config)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(row);
        }

        validate_variant_set(&inserted).map_err(ExperimentsError::Validation)?;

        if let Some(outbox) = &self.outbox_repo {
            publish_event!(
                &mut tx,
                outbox.as_ref(),
                "experiment",
                experiment.id,
                "experiment.created",
                json!({
                    "experiment_id": experiment.id,
                    "key": experiment.key,
                    "seed": experiment.seed,
                    "version": experiment.version,
                    "variants": inserted.iter().map(|v| json!({
                        "variant_id": v.id,
                        "key": v.key,
                        "allocation_pct": v.allocation_pct,
                        "is_control": v.is_control,
                    })).collect::<Vec<_>>(),
                })
            )?;
        }

        tx.commit().await?;

        Ok((experiment, inserted))
    }

    /// Transition an experiment's status, validating that variants are
    /// well-formed before allowing activation.
    pub async fn transition_status(
        &self,
        experiment_id: Uuid,
        new_status: ExperimentStatus,
    ) -> Result<Experiment> {
        if new_status == ExperimentStatus::Active {
            let variants = self.list_variants(experiment_id).await?;
            validate_variant_set(&variants).map_err(ExperimentsError::Validation)?;
        }

        let mut tx = self.pool.begin().await?;

        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            UPDATE experiments
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING id, key, name, status, seed, version, starts_at, ends_at, config,
                      created_at, updated_at
            "#,
        )
        .bind(new_status)
        .bind(experiment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ExperimentsError::NotFound(format!("experiment {experiment_id} not found")))?;

        if let Some(outbox) = &self.outbox_repo {
            publish_event!(
                &mut tx,
                outbox.as_ref(),
                "experiment",
                experiment.id,
                "experiment.status_changed",
                json!({
                    "experiment_id": experiment.id,
                    "status": new_status.as_str(),
                    "version": experiment.version,
                })
            )?;
        }

        tx.commit().await?;

        Ok(experiment)
    }

    /// Reweight an experiment's variant allocations, re-validating the set
    /// and bumping `version` so every cached assignment/result becomes
    /// stale. Published as `"experiment.allocation_changed"`.
    pub async fn update_variant_allocations(
        &self,
        experiment_id: Uuid,
        updates: &[VariantAllocationUpdate],
    ) -> Result<(Experiment, Vec<Variant>)> {
        if updates.is_empty() {
            return Err(ExperimentsError::Validation(
                "at least one allocation update is required".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        for update in updates {
            let outcome = sqlx::query(
                "UPDATE variants SET allocation_pct = $1 WHERE id = $2 AND experiment_id = $3",
            )
            .bind(update.allocation_pct)
            .bind(update.variant_id)
            .bind(experiment_id)
            .execute(&mut *tx)
            .await?;

            if outcome.rows_affected() == 0 {
                return Err(ExperimentsError::NotFound(format!(
                    "variant {} not found on experiment {experiment_id}",
                    update.variant_id
                )));
            }
        }

        let variants = sqlx::query_as::<_, Variant>(
            r#"
            SELECT id, experiment_id, key, name, allocation_pct, is_control, config
            FROM variants
            WHERE experiment_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&mut *tx)
        .await?;

        validate_variant_set(&variants).map_err(ExperimentsError::Validation)?;

        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            UPDATE experiments
            SET version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING id, key, name, status, seed, version, starts_at, ends_at, config,
                      created_at, updated_at
            "#,
        )
        .bind(experiment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ExperimentsError::NotFound(format!("experiment {experiment_id} not found")))?;

        if let Some(outbox) = &self.outbox_repo {
            publish_event!(
                &mut tx,
                outbox.as_ref(),
                "experiment",
                experiment.id,
                "experiment.allocation_changed",
                json!({
                    "experiment_id": experiment.id,
                    "version": experiment.version,
                    "variants": variants.iter().map(|v| json!({
                        "variant_id": v.id,
                        "key": v.key,
                        "allocation_pct": v.allocation_pct,
                    })).collect::<Vec<_>>(),
                })
            )?;
        }

        tx.commit().await?;

        Ok((experiment, variants))
    }
}
