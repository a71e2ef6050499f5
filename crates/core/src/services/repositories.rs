//! Repository ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_common::AppResult;

use crate::models::{Organization, Page, PageRequest, PersistentEvent, Project, Stack, User};

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Organization>>;

    /// Page through every organization ordered by id.
    async fn get_all(&self, page: PageRequest) -> AppResult<Page<Organization>>;

    /// Persist a batch in one write.
    async fn save_all(&self, organizations: &[Organization]) -> AppResult<()>;

    /// Remove an organization. Removing a missing id is not an error.
    async fn remove(&self, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Project>>;

    async fn get_by_organization_id(&self, organization_id: &str) -> AppResult<Vec<Project>>;

    async fn save(&self, project: &Project) -> AppResult<()>;

    async fn remove(&self, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_organization_id(&self, organization_id: &str) -> AppResult<Vec<User>>;

    async fn save(&self, user: &User) -> AppResult<()>;

    async fn remove(&self, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn remove_all_by_organization_id(&self, organization_id: &str) -> AppResult<u64>;

    async fn remove_all_by_project_id(&self, project_id: &str) -> AppResult<u64>;
}

#[async_trait]
pub trait WebHookRepository: Send + Sync {
    async fn remove_all_by_organization_id(&self, organization_id: &str) -> AppResult<u64>;

    async fn remove_all_by_project_id(&self, project_id: &str) -> AppResult<u64>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<PersistentEvent>>;

    async fn save(&self, event: &PersistentEvent) -> AppResult<()>;

    async fn count_by_project_id(&self, project_id: &str) -> AppResult<u64>;

    /// Up to `limit` event ids of a project.
    async fn get_ids_by_project_id(&self, project_id: &str, limit: usize)
    -> AppResult<Vec<String>>;

    async fn remove(&self, ids: &[String]) -> AppResult<u64>;

    /// Up to `limit` visible events of an organization sent from one client
    /// address inside `[start, end]`.
    async fn get_visible_by_client_ip(
        &self,
        organization_id: &str,
        client_ip_address: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<PersistentEvent>>;

    async fn hide(&self, ids: &[String]) -> AppResult<u64>;
}

#[async_trait]
pub trait StackRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Stack>>;

    async fn count_by_project_id(&self, project_id: &str) -> AppResult<u64>;

    async fn get_ids_by_project_id(&self, project_id: &str, limit: usize)
    -> AppResult<Vec<String>>;

    async fn remove(&self, ids: &[String]) -> AppResult<u64>;
}
