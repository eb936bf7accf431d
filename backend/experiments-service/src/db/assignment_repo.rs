use crate::error::Result;
use crate::models::{Assignment, AssignmentSource};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use transactional_outbox::{publish_event, SqlxOutboxRepository};
use uuid::Uuid;

pub struct AssignmentRepo {
    pool: PgPool,
    outbox_repo: Option<Arc<SqlxOutboxRepository>>,
}

impl AssignmentRepo {
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

    pub async fn get(&self, experiment_id: Uuid, user_id: &str) -> Result<Option<Assignment>> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT id, experiment_id, user_id, variant_id, experiment_version,
                   assigned_at, enrolled_at, source, context
            FROM assignments
            WHERE experiment_id = $1 AND user_id = $2
            "#,
        )
        .bind(experiment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(assignment)
    }

    /// Fetch existing assignments for one user across many experiments.
    pub async fn get_for_user(
        &self,
        user_id: &str,
        experiment_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Assignment>> {
        if experiment_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT id, experiment_id, user_id, variant_id, experiment_version,
                   assigned_at, enrolled_at, source, context
            FROM assignments
            WHERE user_id = $1 AND experiment_id = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(experiment_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|a| (a.experiment_id, a)).collect())
    }

    /// Fetch existing assignments for many users within one experiment.
    pub async fn get_for_experiment(
        &self,
        experiment_id: Uuid,
        user_ids: &[String],
    ) -> Result<HashMap<String, Assignment>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT id, experiment_id, user_id, variant_id, experiment_version,
                   assigned_at, enrolled_at, source, context
            FROM assignments
            WHERE experiment_id = $1 AND user_id = ANY($2)
            "#,
        )
        .bind(experiment_id)
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|a| (a.user_id.clone(), a)).collect())
    }

    /// Insert an assignment, or return the one that already exists for this
    /// `(experiment_id, user_id)` pair. The unique constraint - not an
    /// application-level lock - is what makes this idempotent under
    /// concurrent callers racing the same user into the same experiment.
    pub async fn get_or_insert(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        variant_id: Uuid,
        experiment_version: i32,
        source: AssignmentSource,
        context: serde_json::Value,
    ) -> Result<Assignment> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, Assignment>(
            r#"
            INSERT INTO assignments
                (experiment_id, user_id, variant_id, experiment_version, assigned_at, source, context)
            VALUES ($1, $2, $3, $4, NOW(), $5, $6)
            ON CONFLICT (experiment_id, user_id) DO NOTHING
            RETURNING id, experiment_id, user_id, variant_id, experiment_version,
                      assigned_at, enrolled_at, source, context
            "#,
        )
        .bind(experiment_id)
        .bind(user_id)
        .bind(variant_id)
        .bind(experiment_version)
        .bind(source)
        .bind(&context)
        .fetch_optional(&mut *tx)
        .await?;

        let assignment = match inserted {
            Some(assignment) => {
                if let Some(outbox) = &self.outbox_repo {
                    publish_event!(
                        &mut tx,
                        outbox.as_ref(),
                        "assignment",
                        assignment.id,
                        "assignment.created",
                        json!({
                            "assignment_id": assignment.id,
                            "experiment_id": assignment.experiment_id,
                            "user_id": assignment.user_id,
                            "variant_id": assignment.variant_id,
                            "experiment_version": assignment.experiment_version,
                            "assigned_at": assignment.assigned_at,
                            "source": assignment.source,
                        })
                    )?;
                }
                tx.commit().await?;
                assignment
            }
            None => {
                tx.rollback().await?;
                self.get(experiment_id, user_id)
                    .await?
                    .expect("conflicting insert implies a row exists")
            }
        };

        Ok(assignment)
    }

    /// One-shot transition of an assignment from `assigned` to `enrolled`.
    /// A no-op (returns the row unchanged) if `enrolled_at` is already set -
    /// enrollment never regresses and is never overwritten.
    pub async fn enroll(&self, experiment_id: Uuid, user_id: &str) -> Result<Option<Assignment>> {
        let mut tx = self.pool.begin().await?;

        let enrolled = sqlx::query_as::<_, Assignment>(
            r#"
            UPDATE assignments
            SET enrolled_at = NOW()
            WHERE experiment_id = $1 AND user_id = $2 AND enrolled_at IS NULL
            RETURNING id, experiment_id, user_id, variant_id, experiment_version,
                      assigned_at, enrolled_at, source, context
            "#,
        )
        .bind(experiment_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(assignment) = &enrolled {
            if let Some(outbox) = &self.outbox_repo {
                publish_event!(
                    &mut tx,
                    outbox.as_ref(),
                    "assignment",
                    assignment.id,
                    "assignment.enrolled",
                    json!({
                        "assignment_id": assignment.id,
                        "experiment_id": assignment.experiment_id,
                        "user_id": assignment.user_id,
                        "variant_id": assignment.variant_id,
                        "enrolled_at": assignment.enrolled_at,
                    })
                )?;
            }
        }

        tx.commit().await?;

        match enrolled {
            Some(assignment) => Ok(Some(assignment)),
            None => self.get(experiment_id, user_id).await,
        }
    }

    /// Bulk variant of `get_or_insert`, used by the many-users-one-experiment
    /// shape. Rows that lose the unique-constraint race are simply re-read;
    /// no bulk path bypasses idempotency.
    pub async fn insert_batch(
        &self,
        experiment_id: Uuid,
        experiment_version: i32,
        picks: &[(String, Uuid)],
        source: AssignmentSource,
    ) -> Result<HashMap<String, Assignment>> {
        if picks.is_empty() {
            return Ok(HashMap::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut newly_inserted = Vec::new();

        for (user_id, variant_id) in picks {
            let row = sqlx::query_as::<_, Assignment>(
                r#"
                INSERT INTO assignments
                    (experiment_id, user_id, variant_id, experiment_version, assigned_at, source, context)
                VALUES ($1, $2, $3, $4, NOW(), $5, '{}'::jsonb)
                ON CONFLICT (experiment_id, user_id) DO NOTHING
                RETURNING id, experiment_id, user_id, variant_id, experiment_version,
                          assigned_at, enrolled_at, source, context
                "#,
            )
            .bind(experiment_id)
            .bind(user_id)
            .bind(variant_id)
            .bind(experiment_version)
            .bind(source)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(assignment) = row {
                if let Some(outbox) = &self.outbox_repo {
                    publish_event!(
                        &mut tx,
                        outbox.as_ref(),
                        "assignment",
                        assignment.id,
                        "assignment.created",
                        json!({
                            "assignment_id": assignment.id,
                            "experiment_id": assignment.experiment_id,
                            "user_id": assignment.user_id,
                            "variant_id": assignment.variant_id,
                            "experiment_version": assignment.experiment_version,
                            "assigned_at": assignment.assigned_at,
                            "source": assignment.source,
                        })
                    )?;
                }
                newly_inserted.push(assignment);
            }
        }

        tx.commit().await?;

        let user_ids: Vec<String> = picks.iter().map(|(u, _)| u.clone()).collect();
        let mut all = self.get_for_experiment(experiment_id, &user_ids).await?;
        for assignment in newly_inserted {
            all.insert(assignment.user_id.clone(), assignment);
        }
        Ok(all)
    }
}
