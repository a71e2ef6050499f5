use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing plan identifiers.
pub mod plans {
    pub const FREE: &str = "FREE";
    pub const SMALL: &str = "SMALL";
    pub const MEDIUM: &str = "MEDIUM";
    pub const LARGE: &str = "LARGE";

    /// Retired plan ids and the plan that replaced them.
    pub const RETIRED: &[(&str, &str)] = &[
        ("EX_SMALL", SMALL),
        ("EX_MEDIUM", MEDIUM),
        ("EX_LARGE", LARGE),
        ("EX_SMALL_YEARLY", SMALL),
        ("EX_MEDIUM_YEARLY", MEDIUM),
        ("EX_LARGE_YEARLY", LARGE),
    ];

    /// The current plan replacing `plan_id`, if `plan_id` is retired.
    #[must_use]
    pub fn replacement_for(plan_id: &str) -> Option<&'static str> {
        RETIRED
            .iter()
            .find(|(retired, _)| *retired == plan_id)
            .map(|(_, current)| *current)
    }
}

/// A tenant owning projects, users and a billing subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub plan_id: String,
    /// External billing customer; present while a paid subscription exists.
    pub billing_customer_id: Option<String>,
    /// Monthly usage buckets.
    #[serde(default)]
    pub usage: Vec<UsageInfo>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            plan_id: plans::FREE.to_string(),
            billing_customer_id: None,
            usage: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Event usage for one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub date: DateTime<Utc>,
    pub total: u64,
    pub limit: u64,
}

/// A project receiving events, owned by one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// Soft-delete marker; soft-deleted projects are purged by a later sweep.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Project {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            name: name.into(),
            is_deleted: false,
        }
    }
}

/// A user belonging to one or more organizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email_address: String,
    pub full_name: String,
    pub organization_ids: Vec<String>,
    /// Whether event notification mail is wanted.
    #[serde(default = "default_true")]
    pub email_notifications_enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<String>, email_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email_address: email_address.into(),
            full_name: String::new(),
            organization_ids: Vec::new(),
            email_notifications_enabled: true,
        }
    }

    #[must_use]
    pub fn in_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_ids.push(organization_id.into());
        self
    }
}
