use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub experiment_id: Option<Uuid>,
    pub user_id: String,
    pub variant_id: Option<Uuid>,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    /// Denormalized from the matching assignment at ingest time. `NULL`
    /// when no assignment existed yet - the event is still stored, just
    /// excluded from post-assignment-valid aggregates (see `is_valid`).
    pub assignment_at: Option<DateTime<Utc>>,
    pub properties: serde_json::Value,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl Event {
    /// Post-assignment validity: counts toward results only if an
    /// assignment existed at or before this event's timestamp.
    pub fn is_valid(&self) -> bool {
        match self.assignment_at {
            Some(assigned_at) => self.ts >= assigned_at,
            None => false,
        }
    }
}

/// Maximum length for `event_type`, per the ingest contract.
pub const EVENT_TYPE_MAX_LEN: usize = 64;

/// Maximum serialized size of `properties`, in bytes. Kept generous but
/// bounded so one caller can't balloon the outbox payload.
pub const PROPERTIES_MAX_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub experiment_id: Option<Uuid>,
    pub user_id: String,
    pub event_type: String,
    pub ts: Option<DateTime<Utc>>,
    pub properties: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl NewEvent {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("user_id is required".to_string());
        }
        if self.event_type.trim().is_empty() {
            return Err("event_type is required".to_string());
        }
        if self.event_type.len() > EVENT_TYPE_MAX_LEN {
            return Err(format!(
                "event_type exceeds {EVENT_TYPE_MAX_LEN} characters"
            ));
        }
        if let Some(props) = &self.properties {
            let size = serde_json::to_vec(props).map(|v| v.len()).unwrap_or(0);
            if size > PROPERTIES_MAX_BYTES {
                return Err(format!(
                    "properties exceeds {PROPERTIES_MAX_BYTES} byte budget"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(assignment_at: Option<DateTime<Utc>>, ts: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            experiment_id: Some(Uuid::new_v4()),
            user_id: "u-1".to_string(),
            variant_id: None,
            event_type: "exposure".to_string(),
            ts,
            assignment_at,
            properties: serde_json::json!({}),
            session_id: None,
            request_id: None,
        }
    }

    #[test]
    fn event_with_no_assignment_is_invalid() {
        let now = Utc::now();
        assert!(!base_event(None, now).is_valid());
    }

    #[test]
    fn event_before_assignment_is_invalid() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        assert!(!base_event(Some(now), earlier).is_valid());
    }

    #[test]
    fn event_at_or_after_assignment_is_valid() {
        let now = Utc::now();
        assert!(base_event(Some(now), now).is_valid());
        assert!(base_event(Some(now), now + chrono::Duration::seconds(1)).is_valid());
    }

    #[test]
    fn new_event_rejects_empty_user_id() {
        let event = NewEvent {
            experiment_id: None,
            user_id: "".to_string(),
            event_type: "click".to_string(),
            ts: None,
            properties: None,
            session_id: None,
            request_id: None,
        };
        assert!(event.validate().is_err());
    }

    #[test]
    fn new_event_rejects_oversized_event_type() {
        let event = NewEvent {
            experiment_id: None,
            user_id: "u-1".to_string(),
            event_type: "x".repeat(EVENT_TYPE_MAX_LEN + 1),
            ts: None,
            properties: None,
            session_id: None,
            request_id: None,
        };
        assert!(event.validate().is_err());
    }
}
