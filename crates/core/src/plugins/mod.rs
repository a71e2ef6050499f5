//! Priority ordered formatting plugins.
//!
//! A [`FormattingPipeline`] is built once at startup from an explicit
//! registration table. For every capability the pipeline walks the plugins in
//! ascending priority and returns the first result; later plugins are never
//! consulted. The pipeline always ends in a [`FallbackFormattingPlugin`] whose
//! capabilities cannot decline, so every request yields a value.
//!
//! A plugin capability that returns an error is logged and skipped: dispatch
//! continues with the next plugin.

mod formatters;

use std::collections::BTreeMap;
use std::sync::Arc;

use faultline_common::{Metrics, get_metrics};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::models::PersistentEvent;

pub use formatters::{
    DefaultFormattingPlugin, ErrorFormattingPlugin, LogFormattingPlugin,
    ManualStackingFormattingPlugin, NotFoundFormattingPlugin, SessionFormattingPlugin,
    SimpleErrorFormattingPlugin, UsageFormattingPlugin, default_pipeline,
};

/// Plugin result type.
pub type PluginResult<T> = Result<T, PluginError>;

/// Formatting plugin error.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Event {event_id} is missing {field}")]
    MissingField { event_id: String, field: &'static str },

    #[error("Event {event_id} has malformed {field}: {reason}")]
    Malformed {
        event_id: String,
        field: &'static str,
        reason: String,
    },

    #[error(
        "Fallback plugin priority {fallback} must be above every registered priority (highest: {highest})"
    )]
    FallbackNotLast { fallback: i32, highest: i32 },
}

/// Template key plus the values it is rendered with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryData {
    pub template_key: String,
    pub data: BTreeMap<String, Value>,
}

/// Content of a notification mail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMessage {
    pub subject: String,
    pub body: String,
    pub data: BTreeMap<String, Value>,
}

/// What a notification is about.
#[derive(Debug, Clone, Copy)]
pub struct NotificationContext<'a> {
    pub event: &'a PersistentEvent,
    pub project_name: &'a str,
    pub is_new: bool,
    pub is_regression: bool,
    pub total_occurrences: u64,
}

impl NotificationContext<'_> {
    /// Leading word of a notification subject.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        if self.is_new {
            "New"
        } else if self.is_regression {
            "Regression"
        } else {
            "Occurrence"
        }
    }
}

/// A formatter that may decline any event.
///
/// Implementations are stateless: every method is a pure function of its
/// arguments.
pub trait FormattingPlugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this plugin applies to the event at all. Checked before any
    /// capability is invoked.
    fn should_handle(&self, event: &PersistentEvent) -> bool;

    fn title(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(None)
    }

    fn summary(&self, _event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(None)
    }

    fn notification_message(
        &self,
        _context: &NotificationContext<'_>,
    ) -> PluginResult<Option<NotificationMessage>> {
        Ok(None)
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(None)
    }
}

/// The catch-all formatter closing every pipeline.
pub trait FallbackFormattingPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn title(&self, event: &PersistentEvent) -> String;

    fn summary(&self, event: &PersistentEvent) -> SummaryData;

    fn notification_message(&self, context: &NotificationContext<'_>) -> NotificationMessage;

    fn view_name(&self, event: &PersistentEvent) -> String;
}

#[derive(Clone)]
struct RegisteredPlugin {
    priority: i32,
    plugin: Arc<dyn FormattingPlugin>,
}

/// Registration table the pipeline is built from.
#[derive(Default)]
pub struct FormattingPluginRegistry {
    entries: Vec<RegisteredPlugin>,
}

impl FormattingPluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. Lower priorities are consulted first; equal priorities
    /// keep registration order.
    #[must_use]
    pub fn register(mut self, plugin: Arc<dyn FormattingPlugin>, priority: i32) -> Self {
        self.entries.push(RegisteredPlugin { priority, plugin });
        self
    }

    /// Sort once and close the table with the catch-all.
    pub fn build(
        mut self,
        fallback: Arc<dyn FallbackFormattingPlugin>,
        fallback_priority: i32,
    ) -> PluginResult<FormattingPipeline> {
        if let Some(highest) = self.entries.iter().map(|e| e.priority).max() {
            if highest >= fallback_priority {
                return Err(PluginError::FallbackNotLast {
                    fallback: fallback_priority,
                    highest,
                });
            }
        }

        self.entries.sort_by_key(|e| e.priority);

        Ok(FormattingPipeline {
            plugins: self.entries.into(),
            fallback,
            fallback_priority,
            metrics: Arc::clone(get_metrics()),
        })
    }
}

/// Immutable, ascending-priority list of formatting plugins.
#[derive(Clone)]
pub struct FormattingPipeline {
    plugins: Arc<[RegisteredPlugin]>,
    fallback: Arc<dyn FallbackFormattingPlugin>,
    fallback_priority: i32,
    metrics: Arc<Metrics>,
}

impl FormattingPipeline {
    /// `(priority, name)` of every plugin in consultation order, catch-all last.
    #[must_use]
    pub fn order(&self) -> Vec<(i32, &'static str)> {
        self.plugins
            .iter()
            .map(|e| (e.priority, e.plugin.name()))
            .chain(std::iter::once((self.fallback_priority, self.fallback.name())))
            .collect()
    }

    /// First plugin that handles `event` and returns a value for `capability`.
    fn first_match<T>(
        &self,
        event: &PersistentEvent,
        capability: &'static str,
        call: impl Fn(&dyn FormattingPlugin) -> PluginResult<Option<T>>,
    ) -> Option<T> {
        for entry in self.plugins.iter() {
            if !entry.plugin.should_handle(event) {
                continue;
            }
            match call(entry.plugin.as_ref()) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => {
                    Metrics::incr(&self.metrics.plugin_faults);
                    warn!(
                        plugin = entry.plugin.name(),
                        priority = entry.priority,
                        capability,
                        event_id = %event.id,
                        error = %e,
                        "Formatting plugin failed, trying next plugin"
                    );
                }
            }
        }
        None
    }

    #[must_use]
    pub fn title(&self, event: &PersistentEvent) -> String {
        self.first_match(event, "title", |p| p.title(event))
            .unwrap_or_else(|| self.fallback.title(event))
    }

    #[must_use]
    pub fn summary(&self, event: &PersistentEvent) -> SummaryData {
        self.first_match(event, "summary", |p| p.summary(event))
            .unwrap_or_else(|| self.fallback.summary(event))
    }

    #[must_use]
    pub fn notification_message(&self, context: &NotificationContext<'_>) -> NotificationMessage {
        self.first_match(context.event, "notification_message", |p| {
            p.notification_message(context)
        })
        .unwrap_or_else(|| self.fallback.notification_message(context))
    }

    #[must_use]
    pub fn view_name(&self, event: &PersistentEvent) -> String {
        self.first_match(event, "view_name", |p| p.view_name(event))
            .unwrap_or_else(|| self.fallback.view_name(event))
    }
}
