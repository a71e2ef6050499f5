use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well known event type values.
pub mod event_types {
    pub const ERROR: &str = "error";
    pub const NOT_FOUND: &str = "404";
    pub const LOG: &str = "log";
    pub const USAGE: &str = "usage";
    pub const SESSION: &str = "session";
    pub const SESSION_END: &str = "sessionend";
    pub const SESSION_HEARTBEAT: &str = "heartbeat";
}

/// Resolved geographic location of an event's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub level1: Option<String>,
    pub locality: Option<String>,
}

/// A stored event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentEvent {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub stack_id: String,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub message: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub client_ip_address: Option<String>,
    pub location: Option<Location>,
    /// Hidden events are excluded from views; set by abuse throttling.
    #[serde(default)]
    pub is_hidden: bool,
    /// Known data keys (`@error`, `@simple_error`, `@stack`, `@level`) and
    /// client supplied extras.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl PersistentEvent {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            stack_id: String::new(),
            event_type: None,
            source: None,
            message: None,
            date: Utc::now(),
            tags: Vec::new(),
            client_ip_address: None,
            location: None,
            is_hidden: false,
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type.as_deref() == Some(event_type)
    }

    /// Whether the event is one of the session lifecycle types.
    #[must_use]
    pub fn is_session(&self) -> bool {
        self.is_type(event_types::SESSION)
            || self.is_type(event_types::SESSION_END)
            || self.is_type(event_types::SESSION_HEARTBEAT)
    }
}

/// A group of similar events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub title: String,
}
