//! Core domain for faultline.
//!
//! - **Models**: organizations, projects, users, events and stacks
//! - **Services**: ports to the collaborators handlers mutate (repositories,
//!   search index, billing, mail, geo lookup)
//! - **Plugins**: the priority ordered formatting pipeline used for titles,
//!   summaries and notification content

pub mod models;
pub mod plugins;
pub mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use models::*;
pub use plugins::{
    FallbackFormattingPlugin, FormattingPipeline, FormattingPlugin, FormattingPluginRegistry,
    NotificationContext, NotificationMessage, PluginError, PluginResult, SummaryData,
    default_pipeline,
};
pub use services::*;
