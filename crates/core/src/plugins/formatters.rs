//! Formatting plugins shipped with faultline.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::{
    FallbackFormattingPlugin, FormattingPipeline, FormattingPlugin, FormattingPluginRegistry,
    NotificationContext, NotificationMessage, PluginError, PluginResult, SummaryData,
};
use crate::models::{PersistentEvent, event_types};

const MANUAL_STACK_KEY: &str = "@stack";
const SIMPLE_ERROR_KEY: &str = "@simple_error";
const ERROR_KEY: &str = "@error";
const LEVEL_KEY: &str = "@level";

/// Titles longer than this are cut in notification subjects.
const SUBJECT_TITLE_LIMIT: usize = 120;

/// Pipeline with every shipped plugin at its standard priority.
pub fn default_pipeline() -> PluginResult<FormattingPipeline> {
    FormattingPluginRegistry::new()
        .register(Arc::new(ManualStackingFormattingPlugin), 5)
        .register(Arc::new(SimpleErrorFormattingPlugin), 10)
        .register(Arc::new(ErrorFormattingPlugin), 20)
        .register(Arc::new(NotFoundFormattingPlugin), 30)
        .register(Arc::new(UsageFormattingPlugin), 40)
        .register(Arc::new(SessionFormattingPlugin), 50)
        .register(Arc::new(LogFormattingPlugin), 60)
        .build(Arc::new(DefaultFormattingPlugin), 99)
}

fn data_object<'a>(
    event: &'a PersistentEvent,
    key: &'static str,
) -> PluginResult<Option<&'a Map<String, Value>>> {
    match event.data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(PluginError::Malformed {
            event_id: event.id.clone(),
            field: key,
            reason: format!("expected an object, found {other}"),
        }),
    }
}

fn string_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(limit).collect();
    cut.push_str("...");
    cut
}

/// Shared notification layout: `[project] Kind label: title`.
fn notification(
    context: &NotificationContext<'_>,
    label: &str,
    title: &str,
    mut data: BTreeMap<String, Value>,
) -> NotificationMessage {
    let subject = format!(
        "[{}] {} {}: {}",
        context.project_name,
        context.kind(),
        label,
        truncate(title, SUBJECT_TITLE_LIMIT)
    );

    let mut body = format!("{title}\n\nProject: {}\n", context.project_name);
    if let Some(source) = non_empty(context.event.source.as_deref()) {
        body.push_str(&format!("Source: {source}\n"));
    }
    body.push_str(&format!(
        "Occurrences: {}\nDate: {}\n",
        context.total_occurrences,
        context.event.date.to_rfc3339()
    ));

    data.insert("title".to_string(), json!(title));
    data.insert("project_name".to_string(), json!(context.project_name));
    data.insert("is_new".to_string(), json!(context.is_new));
    data.insert("is_regression".to_string(), json!(context.is_regression));
    data.insert(
        "total_occurrences".to_string(),
        json!(context.total_occurrences),
    );

    NotificationMessage {
        subject,
        body,
        data,
    }
}

fn summary(template_key: &str, pairs: &[(&str, Option<&str>)]) -> SummaryData {
    let data = pairs
        .iter()
        .filter_map(|(k, v)| v.map(|v| ((*k).to_string(), json!(v))))
        .collect();
    SummaryData {
        template_key: template_key.to_string(),
        data,
    }
}

/// Events grouped under a title chosen by the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualStackingFormattingPlugin;

impl ManualStackingFormattingPlugin {
    fn manual_title(event: &PersistentEvent) -> PluginResult<Option<&str>> {
        Ok(data_object(event, MANUAL_STACK_KEY)?.and_then(|m| string_field(m, "title")))
    }
}

impl FormattingPlugin for ManualStackingFormattingPlugin {
    fn name(&self) -> &'static str {
        "manual-stacking"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.data.contains_key(MANUAL_STACK_KEY)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Self::manual_title(event)?.map(String::from))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(Self::manual_title(event)?.map(|title| {
            summary(
                "event-manual-stack-summary",
                &[("title", Some(title)), ("source", event.source.as_deref())],
            )
        }))
    }
}

/// Errors reported without full exception detail.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleErrorFormattingPlugin;

impl FormattingPlugin for SimpleErrorFormattingPlugin {
    fn name(&self) -> &'static str {
        "simple-error"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_type(event_types::ERROR) && event.data.contains_key(SIMPLE_ERROR_KEY)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        let Some(error) = data_object(event, SIMPLE_ERROR_KEY)? else {
            return Ok(None);
        };
        Ok(string_field(error, "message")
            .or_else(|| non_empty(event.message.as_deref()))
            .map(String::from))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        let Some(error) = data_object(event, SIMPLE_ERROR_KEY)? else {
            return Ok(None);
        };
        Ok(Some(summary(
            "event-simple-summary",
            &[
                ("message", string_field(error, "message")),
                ("type", string_field(error, "type")),
            ],
        )))
    }

    fn notification_message(
        &self,
        context: &NotificationContext<'_>,
    ) -> PluginResult<Option<NotificationMessage>> {
        let Some(error) = data_object(context.event, SIMPLE_ERROR_KEY)? else {
            return Ok(None);
        };
        let title = string_field(error, "message").unwrap_or("(no message)");
        let mut data = BTreeMap::new();
        if let Some(kind) = string_field(error, "type") {
            data.insert("type".to_string(), json!(kind));
        }
        Ok(Some(notification(context, "error", title, data)))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("simple-error".to_string()))
    }
}

/// Full exceptions with a type and optional stack trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorFormattingPlugin;

impl ErrorFormattingPlugin {
    /// The innermost error carries the root cause.
    fn innermost(error: &Map<String, Value>) -> &Map<String, Value> {
        let mut current = error;
        while let Some(Value::Object(inner)) = current.get("inner") {
            current = inner;
        }
        current
    }

    /// Method name of the first stack frame, `Type.method` when the type is known.
    fn method(error: &Map<String, Value>) -> Option<String> {
        let frame = error.get("stack_trace")?.as_array()?.first()?.as_object()?;
        let name = string_field(frame, "name")?;
        Some(match string_field(frame, "declaring_type") {
            Some(declaring) => format!("{declaring}.{name}"),
            None => name.to_string(),
        })
    }

    fn error<'a>(event: &'a PersistentEvent) -> PluginResult<&'a Map<String, Value>> {
        data_object(event, ERROR_KEY)?.ok_or_else(|| PluginError::MissingField {
            event_id: event.id.clone(),
            field: ERROR_KEY,
        })
    }
}

impl FormattingPlugin for ErrorFormattingPlugin {
    fn name(&self) -> &'static str {
        "error"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_type(event_types::ERROR) && event.data.contains_key(ERROR_KEY)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        let error = Self::error(event)?;
        Ok(string_field(error, "message")
            .or_else(|| string_field(error, "type"))
            .map(String::from))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        let error = Self::error(event)?;
        let root = Self::innermost(error);
        let method = Self::method(root);
        Ok(Some(summary(
            "event-error-summary",
            &[
                ("message", string_field(error, "message")),
                ("type", string_field(root, "type")),
                ("method", method.as_deref()),
            ],
        )))
    }

    fn notification_message(
        &self,
        context: &NotificationContext<'_>,
    ) -> PluginResult<Option<NotificationMessage>> {
        let error = Self::error(context.event)?;
        let root = Self::innermost(error);
        let title = string_field(error, "message")
            .or_else(|| string_field(error, "type"))
            .unwrap_or("(no message)");

        let mut data = BTreeMap::new();
        if let Some(kind) = string_field(root, "type") {
            data.insert("type".to_string(), json!(kind));
        }
        if let Some(method) = Self::method(root) {
            data.insert("method".to_string(), json!(method));
        }
        Ok(Some(notification(context, "error", title, data)))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("error".to_string()))
    }
}

/// Requests for missing resources; the source is the requested path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundFormattingPlugin;

impl FormattingPlugin for NotFoundFormattingPlugin {
    fn name(&self) -> &'static str {
        "not-found"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_type(event_types::NOT_FOUND)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some(format!(
            "404: {}",
            non_empty(event.source.as_deref()).unwrap_or("(unknown)")
        )))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(Some(summary(
            "event-notfound-summary",
            &[("source", event.source.as_deref())],
        )))
    }

    fn notification_message(
        &self,
        context: &NotificationContext<'_>,
    ) -> PluginResult<Option<NotificationMessage>> {
        let source = non_empty(context.event.source.as_deref()).unwrap_or("(unknown)");
        Ok(Some(notification(context, "404", source, BTreeMap::new())))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("not-found".to_string()))
    }
}

/// Feature usage events; the source is the feature name.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageFormattingPlugin;

impl FormattingPlugin for UsageFormattingPlugin {
    fn name(&self) -> &'static str {
        "usage"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_type(event_types::USAGE)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(non_empty(event.source.as_deref()).map(|source| format!("Feature: {source}")))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(Some(summary(
            "event-feature-summary",
            &[("source", event.source.as_deref())],
        )))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("usage".to_string()))
    }
}

/// Session start, end and heartbeat events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionFormattingPlugin;

impl FormattingPlugin for SessionFormattingPlugin {
    fn name(&self) -> &'static str {
        "session"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_session()
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        let label = if event.is_type(event_types::SESSION_END) {
            "Session ended"
        } else if event.is_type(event_types::SESSION_HEARTBEAT) {
            "Session heartbeat"
        } else {
            "Session started"
        };
        Ok(Some(label.to_string()))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(Some(summary(
            "event-session-summary",
            &[
                ("type", event.event_type.as_deref()),
                ("session_id", event.source.as_deref()),
            ],
        )))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("session".to_string()))
    }
}

/// Log messages, optionally carrying a level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFormattingPlugin;

impl LogFormattingPlugin {
    fn level(event: &PersistentEvent) -> Option<&str> {
        event.data.get(LEVEL_KEY).and_then(Value::as_str)
    }
}

impl FormattingPlugin for LogFormattingPlugin {
    fn name(&self) -> &'static str {
        "log"
    }

    fn should_handle(&self, event: &PersistentEvent) -> bool {
        event.is_type(event_types::LOG)
    }

    fn title(&self, event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(non_empty(event.message.as_deref())
            .or_else(|| non_empty(event.source.as_deref()))
            .map(String::from))
    }

    fn summary(&self, event: &PersistentEvent) -> PluginResult<Option<SummaryData>> {
        Ok(Some(summary(
            "event-log-summary",
            &[
                ("message", event.message.as_deref()),
                ("source", event.source.as_deref()),
                ("level", Self::level(event)),
            ],
        )))
    }

    fn notification_message(
        &self,
        context: &NotificationContext<'_>,
    ) -> PluginResult<Option<NotificationMessage>> {
        let Some(title) = non_empty(context.event.message.as_deref())
            .or_else(|| non_empty(context.event.source.as_deref()))
        else {
            return Ok(None);
        };
        let mut data = BTreeMap::new();
        if let Some(level) = Self::level(context.event) {
            data.insert("level".to_string(), json!(level));
        }
        Ok(Some(notification(context, "log message", title, data)))
    }

    fn view_name(&self, _event: &PersistentEvent) -> PluginResult<Option<String>> {
        Ok(Some("log".to_string()))
    }
}

/// Catch-all formatter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFormattingPlugin;

impl DefaultFormattingPlugin {
    fn best_title(event: &PersistentEvent) -> &str {
        non_empty(event.message.as_deref())
            .or_else(|| non_empty(event.source.as_deref()))
            .unwrap_or("(none)")
    }
}

impl FallbackFormattingPlugin for DefaultFormattingPlugin {
    fn name(&self) -> &'static str {
        "default"
    }

    fn title(&self, event: &PersistentEvent) -> String {
        Self::best_title(event).to_string()
    }

    fn summary(&self, event: &PersistentEvent) -> SummaryData {
        summary(
            "event-summary",
            &[
                ("message", event.message.as_deref()),
                ("source", event.source.as_deref()),
                ("type", event.event_type.as_deref()),
            ],
        )
    }

    fn notification_message(&self, context: &NotificationContext<'_>) -> NotificationMessage {
        let label = context.event.event_type.as_deref().unwrap_or("event");
        notification(
            context,
            label,
            Self::best_title(context.event),
            BTreeMap::new(),
        )
    }

    fn view_name(&self, _event: &PersistentEvent) -> String {
        "event".to_string()
    }
}
