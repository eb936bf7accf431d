use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    Hash,
    Forced,
    Imported,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub user_id: String,
    pub variant_id: Uuid,
    /// Experiment `version` at the time of assignment, carried forward so
    /// a later re-weighting never retroactively relabels this row.
    pub experiment_version: i32,
    pub assigned_at: DateTime<Utc>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub source: AssignmentSource,
    pub context: serde_json::Value,
}
