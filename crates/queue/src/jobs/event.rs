use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkItem;

/// Resolve and store the location of an event's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLocationWorkItem {
    pub event_id: String,
    pub ip_address: String,
}

impl WorkItem for SetLocationWorkItem {
    const TYPE: &'static str = "set-location";
}

/// Hide the events one client address sent inside a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleBotsWorkItem {
    pub organization_id: String,
    pub client_ip_address: String,
    pub utc_start: DateTime<Utc>,
    pub utc_end: DateTime<Utc>,
}

impl WorkItem for ThrottleBotsWorkItem {
    const TYPE: &'static str = "throttle-bots";
}

/// Mail the project's users about an event occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotificationWorkItem {
    pub event_id: String,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_regression: bool,
    #[serde(default)]
    pub total_occurrences: u64,
}

impl WorkItem for EventNotificationWorkItem {
    const TYPE: &'static str = "event-notification";
}
