//! Work-item handlers.

#![allow(missing_docs)]

mod bulk;
mod event_notification;
mod organization_maintenance;
mod reindex;
mod remove_organization;
mod remove_project;
mod set_location;
mod throttle_bots;

use std::sync::Arc;

use faultline_common::{AppResult, BulkSettings};
use faultline_core::{
    BillingGateway, EventRepository, FormattingPipeline, GeoLookup, MailSender,
    OrganizationRepository, ProjectRepository, SearchIndexClient, StackRepository,
    TokenRepository, UserRepository, WebHookRepository,
};

use crate::cache::CacheClient;
use crate::dispatcher::HandlerRegistry;

pub use bulk::{PageStep, for_each_page, purge_project_data};
pub use event_notification::EventNotificationHandler;
pub use organization_maintenance::OrganizationMaintenanceHandler;
pub use reindex::ReindexHandler;
pub use remove_organization::RemoveOrganizationHandler;
pub use remove_project::RemoveProjectHandler;
pub use set_location::SetLocationHandler;
pub use throttle_bots::ThrottleBotsHandler;

/// Repository ports handlers read and mutate.
#[derive(Clone)]
pub struct Stores {
    pub organizations: Arc<dyn OrganizationRepository>,
    pub projects: Arc<dyn ProjectRepository>,
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<dyn TokenRepository>,
    pub web_hooks: Arc<dyn WebHookRepository>,
    pub events: Arc<dyn EventRepository>,
    pub stacks: Arc<dyn StackRepository>,
}

impl Stores {
    /// Every port served by one backend.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: OrganizationRepository
            + ProjectRepository
            + UserRepository
            + TokenRepository
            + WebHookRepository
            + EventRepository
            + StackRepository
            + 'static,
    {
        Self {
            organizations: store.clone(),
            projects: store.clone(),
            users: store.clone(),
            tokens: store.clone(),
            web_hooks: store.clone(),
            events: store.clone(),
            stacks: store,
        }
    }
}

/// Everything the shipped handlers need.
#[derive(Clone)]
pub struct HandlerDependencies {
    pub stores: Stores,
    pub search: Arc<dyn SearchIndexClient>,
    pub billing: Arc<dyn BillingGateway>,
    pub geo: Arc<dyn GeoLookup>,
    pub mail: Arc<dyn MailSender>,
    pub cache: Arc<dyn CacheClient>,
    pub formatting: FormattingPipeline,
    pub bulk: BulkSettings,
}

/// Registry with every shipped handler.
pub fn default_registry(deps: &HandlerDependencies) -> AppResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(RemoveOrganizationHandler::new(
        deps.stores.clone(),
        deps.billing.clone(),
        deps.bulk,
    ))?;
    registry.register(RemoveProjectHandler::new(deps.stores.clone(), deps.bulk))?;
    registry.register(OrganizationMaintenanceHandler::new(
        deps.stores.organizations.clone(),
        deps.bulk,
    ))?;
    registry.register(ReindexHandler::new(deps.search.clone(), deps.bulk))?;
    registry.register(SetLocationHandler::new(
        deps.stores.events.clone(),
        deps.geo.clone(),
    ))?;
    registry.register(ThrottleBotsHandler::new(
        deps.stores.events.clone(),
        deps.bulk,
    ))?;
    registry.register(EventNotificationHandler::new(
        deps.stores.clone(),
        deps.mail.clone(),
        deps.cache.clone(),
        deps.formatting.clone(),
    ))?;
    Ok(registry)
}
