//! Work-item envelope and payload definitions.

#![allow(missing_docs)]

mod event;
mod organization;
mod project;
mod reindex;

use chrono::{DateTime, Utc};
use faultline_common::{AppError, AppResult, IdGenerator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use event::{EventNotificationWorkItem, SetLocationWorkItem, ThrottleBotsWorkItem};
pub use organization::{OrganizationMaintenanceWorkItem, RemoveOrganizationWorkItem};
pub use project::RemoveProjectWorkItem;
pub use reindex::ReindexWorkItem;

/// A payload that can travel in a [`WorkItemEnvelope`].
pub trait WorkItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminant written to the envelope's `type` field.
    const TYPE: &'static str;
}

/// Queue message body: a type discriminant plus the handler's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub work_item_type: String,
    pub data: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItemEnvelope {
    /// Wrap a payload under its own discriminant.
    pub fn new<T: WorkItem>(payload: &T) -> AppResult<Self> {
        Ok(Self {
            id: IdGenerator::new().generate(),
            work_item_type: T::TYPE.to_string(),
            data: serde_json::to_value(payload)?,
            enqueued_at: Utc::now(),
        })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: WorkItem>(&self) -> AppResult<T> {
        if self.work_item_type != T::TYPE {
            return Err(AppError::Decode(format!(
                "expected work item type {}, found {}",
                T::TYPE,
                self.work_item_type
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| AppError::Decode(format!("{} payload: {e}", T::TYPE)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = WorkItemEnvelope::new(&RemoveProjectWorkItem::new("proj1")).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "remove-project");
        assert_eq!(json["data"]["project_id"], "proj1");
        assert_eq!(json["data"]["reset"], false);
    }

    #[test]
    fn test_decode_checks_discriminant() {
        let envelope = WorkItemEnvelope::new(&RemoveProjectWorkItem::new("proj1")).unwrap();

        assert!(matches!(
            envelope.decode::<RemoveOrganizationWorkItem>(),
            Err(AppError::Decode(_))
        ));
        assert_eq!(
            envelope.decode::<RemoveProjectWorkItem>().unwrap().project_id,
            "proj1"
        );
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let envelope = WorkItemEnvelope {
            id: "1".to_string(),
            work_item_type: RemoveProjectWorkItem::TYPE.to_string(),
            data: serde_json::json!({ "reset": "yes" }),
            enqueued_at: Utc::now(),
        };
        assert!(matches!(
            envelope.decode::<RemoveProjectWorkItem>(),
            Err(AppError::Decode(_))
        ));
    }
}
