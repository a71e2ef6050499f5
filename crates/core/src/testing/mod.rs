//! In-memory collaborators for tests.
//!
//! Enabled inside this crate's tests and, for other crates, through the
//! `test-utils` feature. Every store counts the calls handlers make so tests
//! can assert on pagination and fallback behavior.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_common::{AppError, AppResult};

use crate::models::{
    Location, Organization, Page, PageRequest, PersistentEvent, Project, Stack, User,
};
use crate::services::{
    BillingGateway, BulkItemFailure, BulkResponse, EventRepository, GeoLookup, MailMessage,
    MailSender, OrganizationRepository, ProjectRepository, ScrollPage, ScrollQuery,
    SearchDocument, SearchIndexClient, StackRepository, TokenRepository, UserRepository,
    WebHookRepository,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StoreState {
    organizations: BTreeMap<String, Organization>,
    projects: BTreeMap<String, Project>,
    users: BTreeMap<String, User>,
    events: BTreeMap<String, PersistentEvent>,
    stacks: BTreeMap<String, Stack>,
    /// `(organization_id, project_id)` per token.
    tokens: Vec<(String, String)>,
    /// `(organization_id, project_id)` per web hook.
    web_hooks: Vec<(String, String)>,
}

/// Every repository port backed by one set of maps.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    pub organization_page_fetches: AtomicUsize,
    pub organization_saves: AtomicUsize,
    pub event_id_fetches: AtomicUsize,
    pub stack_id_fetches: AtomicUsize,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, organization: Organization) {
        guard(&self.state)
            .organizations
            .insert(organization.id.clone(), organization);
    }

    pub fn insert_project(&self, project: Project) {
        guard(&self.state)
            .projects
            .insert(project.id.clone(), project);
    }

    pub fn insert_user(&self, user: User) {
        guard(&self.state).users.insert(user.id.clone(), user);
    }

    pub fn insert_event(&self, event: PersistentEvent) {
        guard(&self.state).events.insert(event.id.clone(), event);
    }

    pub fn insert_stack(&self, stack: Stack) {
        guard(&self.state).stacks.insert(stack.id.clone(), stack);
    }

    pub fn insert_token(&self, organization_id: &str, project_id: &str) {
        guard(&self.state)
            .tokens
            .push((organization_id.to_string(), project_id.to_string()));
    }

    pub fn insert_web_hook(&self, organization_id: &str, project_id: &str) {
        guard(&self.state)
            .web_hooks
            .push((organization_id.to_string(), project_id.to_string()));
    }

    #[must_use]
    pub fn organization(&self, id: &str) -> Option<Organization> {
        guard(&self.state).organizations.get(id).cloned()
    }

    #[must_use]
    pub fn project(&self, id: &str) -> Option<Project> {
        guard(&self.state).projects.get(id).cloned()
    }

    #[must_use]
    pub fn user(&self, id: &str) -> Option<User> {
        guard(&self.state).users.get(id).cloned()
    }

    #[must_use]
    pub fn event(&self, id: &str) -> Option<PersistentEvent> {
        guard(&self.state).events.get(id).cloned()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        guard(&self.state).events.len()
    }

    #[must_use]
    pub fn stack_count(&self) -> usize {
        guard(&self.state).stacks.len()
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        guard(&self.state).tokens.len()
    }

    #[must_use]
    pub fn web_hook_count(&self) -> usize {
        guard(&self.state).web_hooks.len()
    }
}

#[async_trait]
impl OrganizationRepository for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Organization>> {
        Ok(self.organization(id))
    }

    async fn get_all(&self, page: PageRequest) -> AppResult<Page<Organization>> {
        self.organization_page_fetches.fetch_add(1, Ordering::SeqCst);
        let state = guard(&self.state);
        let total = state.organizations.len() as u64;
        let items: Vec<Organization> = state
            .organizations
            .values()
            .skip(page.offset())
            .take(page.limit)
            .cloned()
            .collect();
        let has_more = (page.offset() + items.len()) < state.organizations.len();
        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    async fn save_all(&self, organizations: &[Organization]) -> AppResult<()> {
        self.organization_saves.fetch_add(1, Ordering::SeqCst);
        let mut state = guard(&self.state);
        for organization in organizations {
            state
                .organizations
                .insert(organization.id.clone(), organization.clone());
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> AppResult<()> {
        guard(&self.state).organizations.remove(id);
        Ok(())
    }
}

#[async_trait]
impl ProjectRepository for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Project>> {
        Ok(self.project(id))
    }

    async fn get_by_organization_id(&self, organization_id: &str) -> AppResult<Vec<Project>> {
        Ok(guard(&self.state)
            .projects
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn save(&self, project: &Project) -> AppResult<()> {
        self.insert_project(project.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> AppResult<()> {
        guard(&self.state).projects.remove(id);
        Ok(())
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn get_by_organization_id(&self, organization_id: &str) -> AppResult<Vec<User>> {
        Ok(guard(&self.state)
            .users
            .values()
            .filter(|u| u.organization_ids.iter().any(|id| id == organization_id))
            .cloned()
            .collect())
    }

    async fn save(&self, user: &User) -> AppResult<()> {
        self.insert_user(user.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> AppResult<()> {
        guard(&self.state).users.remove(id);
        Ok(())
    }
}

fn remove_where(entries: &mut Vec<(String, String)>, keep: impl Fn(&(String, String)) -> bool) -> u64 {
    let before = entries.len();
    entries.retain(keep);
    (before - entries.len()) as u64
}

#[async_trait]
impl TokenRepository for InMemoryStore {
    async fn remove_all_by_organization_id(&self, organization_id: &str) -> AppResult<u64> {
        Ok(remove_where(&mut guard(&self.state).tokens, |(org, _)| {
            org != organization_id
        }))
    }

    async fn remove_all_by_project_id(&self, project_id: &str) -> AppResult<u64> {
        Ok(remove_where(&mut guard(&self.state).tokens, |(_, project)| {
            project != project_id
        }))
    }
}

#[async_trait]
impl WebHookRepository for InMemoryStore {
    async fn remove_all_by_organization_id(&self, organization_id: &str) -> AppResult<u64> {
        Ok(remove_where(&mut guard(&self.state).web_hooks, |(org, _)| {
            org != organization_id
        }))
    }

    async fn remove_all_by_project_id(&self, project_id: &str) -> AppResult<u64> {
        Ok(remove_where(
            &mut guard(&self.state).web_hooks,
            |(_, project)| project != project_id,
        ))
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<PersistentEvent>> {
        Ok(self.event(id))
    }

    async fn save(&self, event: &PersistentEvent) -> AppResult<()> {
        self.insert_event(event.clone());
        Ok(())
    }

    async fn count_by_project_id(&self, project_id: &str) -> AppResult<u64> {
        Ok(guard(&self.state)
            .events
            .values()
            .filter(|e| e.project_id == project_id)
            .count() as u64)
    }

    async fn get_ids_by_project_id(
        &self,
        project_id: &str,
        limit: usize,
    ) -> AppResult<Vec<String>> {
        self.event_id_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(guard(&self.state)
            .events
            .values()
            .filter(|e| e.project_id == project_id)
            .take(limit)
            .map(|e| e.id.clone())
            .collect())
    }

    async fn remove(&self, ids: &[String]) -> AppResult<u64> {
        let mut state = guard(&self.state);
        Ok(ids
            .iter()
            .filter(|id| state.events.remove(id.as_str()).is_some())
            .count() as u64)
    }

    async fn get_visible_by_client_ip(
        &self,
        organization_id: &str,
        client_ip_address: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<PersistentEvent>> {
        Ok(guard(&self.state)
            .events
            .values()
            .filter(|e| {
                e.organization_id == organization_id
                    && !e.is_hidden
                    && e.client_ip_address.as_deref() == Some(client_ip_address)
                    && e.date >= start
                    && e.date <= end
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn hide(&self, ids: &[String]) -> AppResult<u64> {
        let mut state = guard(&self.state);
        let mut hidden = 0;
        for id in ids {
            if let Some(event) = state.events.get_mut(id) {
                if !event.is_hidden {
                    event.is_hidden = true;
                    hidden += 1;
                }
            }
        }
        Ok(hidden)
    }
}

#[async_trait]
impl StackRepository for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<Stack>> {
        Ok(guard(&self.state).stacks.get(id).cloned())
    }

    async fn count_by_project_id(&self, project_id: &str) -> AppResult<u64> {
        Ok(guard(&self.state)
            .stacks
            .values()
            .filter(|s| s.project_id == project_id)
            .count() as u64)
    }

    async fn get_ids_by_project_id(
        &self,
        project_id: &str,
        limit: usize,
    ) -> AppResult<Vec<String>> {
        self.stack_id_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(guard(&self.state)
            .stacks
            .values()
            .filter(|s| s.project_id == project_id)
            .take(limit)
            .map(|s| s.id.clone())
            .collect())
    }

    async fn remove(&self, ids: &[String]) -> AppResult<u64> {
        let mut state = guard(&self.state);
        Ok(ids
            .iter()
            .filter(|id| state.stacks.remove(id.as_str()).is_some())
            .count() as u64)
    }
}

#[derive(Default)]
struct IndexState {
    indices: BTreeMap<String, BTreeMap<String, SearchDocument>>,
    aliases: BTreeMap<String, String>,
}

/// Search index with configurable write failures.
#[derive(Default)]
pub struct InMemorySearchIndex {
    state: Mutex<IndexState>,
    /// Every bulk request is rejected wholesale while set.
    reject_bulk: Mutex<bool>,
    /// Ids the bulk endpoint rejects item by item.
    bulk_rejected_ids: Mutex<BTreeSet<String>>,
    /// Ids every write path rejects.
    poisoned_ids: Mutex<BTreeSet<String>>,
    /// Ids accepted by every write path but never stored.
    dropped_ids: Mutex<BTreeSet<String>>,
    /// Written by a concurrent writer while the next bulk request runs.
    concurrent_write: Mutex<Option<(String, SearchDocument)>>,
    pub bulk_calls: AtomicUsize,
    pub single_writes: AtomicUsize,
    pub deleted_indices: Mutex<Vec<String>>,
}

impl InMemorySearchIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index(&self, index: &str) {
        guard(&self.state)
            .indices
            .entry(index.to_string())
            .or_default();
    }

    pub fn insert(&self, index: &str, document: SearchDocument) {
        guard(&self.state)
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(document.id.clone(), document);
    }

    pub fn set_alias(&self, alias: &str, index: &str) {
        guard(&self.state)
            .aliases
            .insert(alias.to_string(), index.to_string());
    }

    pub fn reject_bulk(&self, reject: bool) {
        *guard(&self.reject_bulk) = reject;
    }

    pub fn reject_in_bulk(&self, id: &str) {
        guard(&self.bulk_rejected_ids).insert(id.to_string());
    }

    pub fn poison(&self, id: &str) {
        guard(&self.poisoned_ids).insert(id.to_string());
    }

    pub fn drop_writes_of(&self, id: &str) {
        guard(&self.dropped_ids).insert(id.to_string());
    }

    /// Land `document` in `index` during the next bulk request, as another
    /// writer would while a copy is running.
    pub fn write_during_next_bulk(&self, index: &str, document: SearchDocument) {
        *guard(&self.concurrent_write) = Some((index.to_string(), document));
    }

    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<SearchDocument> {
        guard(&self.state)
            .indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    #[must_use]
    pub fn alias(&self, alias: &str) -> Option<String> {
        guard(&self.state).aliases.get(alias).cloned()
    }

    fn store(&self, index: &str, document: &SearchDocument) {
        if guard(&self.dropped_ids).contains(&document.id) {
            return;
        }
        self.insert(index, document.clone());
    }

    fn matches(query: &ScrollQuery, document: &SearchDocument) -> bool {
        let Some(since) = query.modified_since else {
            return true;
        };
        document
            .source
            .get(&query.time_field)
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .is_some_and(|modified| modified.with_timezone(&Utc) >= since)
    }
}

#[async_trait]
impl SearchIndexClient for InMemorySearchIndex {
    async fn index_exists(&self, index: &str) -> AppResult<bool> {
        Ok(guard(&self.state).indices.contains_key(index))
    }

    async fn count(&self, index: &str) -> AppResult<u64> {
        guard(&self.state)
            .indices
            .get(index)
            .map(|docs| docs.len() as u64)
            .ok_or_else(|| AppError::Search(format!("no such index: {index}")))
    }

    async fn scroll(
        &self,
        index: &str,
        query: &ScrollQuery,
        cursor: Option<&str>,
        size: usize,
    ) -> AppResult<ScrollPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|e| AppError::Search(format!("bad scroll cursor {c}: {e}")))?,
            None => 0,
        };

        let state = guard(&self.state);
        let docs = state
            .indices
            .get(index)
            .ok_or_else(|| AppError::Search(format!("no such index: {index}")))?;
        let matching: Vec<&SearchDocument> =
            docs.values().filter(|d| Self::matches(query, d)).collect();

        let documents: Vec<SearchDocument> = matching
            .iter()
            .skip(offset)
            .take(size)
            .map(|d| (*d).clone())
            .collect();
        let next = offset + documents.len();
        let cursor = (next < matching.len()).then(|| next.to_string());

        Ok(ScrollPage { documents, cursor })
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: &[SearchDocument],
    ) -> AppResult<BulkResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let concurrent = guard(&self.concurrent_write).take();
        if let Some((target, document)) = concurrent {
            self.insert(&target, document);
        }
        if *guard(&self.reject_bulk) {
            return Err(AppError::Search("bulk request rejected".to_string()));
        }

        let rejected = guard(&self.bulk_rejected_ids).clone();
        let poisoned = guard(&self.poisoned_ids).clone();
        let mut failed = Vec::new();
        for document in documents {
            if rejected.contains(&document.id) || poisoned.contains(&document.id) {
                failed.push(BulkItemFailure {
                    id: document.id.clone(),
                    reason: "mapper_parsing_exception".to_string(),
                });
            } else {
                self.store(index, document);
            }
        }
        Ok(BulkResponse { failed })
    }

    async fn index_document(&self, index: &str, document: &SearchDocument) -> AppResult<()> {
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        if guard(&self.poisoned_ids).contains(&document.id) {
            return Err(AppError::Search(format!(
                "document {} rejected",
                document.id
            )));
        }
        self.store(index, document);
        Ok(())
    }

    async fn alias_target(&self, alias: &str) -> AppResult<Option<String>> {
        Ok(self.alias(alias))
    }

    async fn swap_alias(&self, alias: &str, from: Option<&str>, to: &str) -> AppResult<()> {
        let mut state = guard(&self.state);
        if !state.indices.contains_key(to) {
            return Err(AppError::Search(format!("no such index: {to}")));
        }
        let current = state.aliases.get(alias).map(String::as_str);
        if from.is_some() && current != from {
            return Err(AppError::Search(format!(
                "alias {alias} points at {current:?}, expected {from:?}"
            )));
        }
        state.aliases.insert(alias.to_string(), to.to_string());
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> AppResult<()> {
        guard(&self.state).indices.remove(index);
        guard(&self.deleted_indices).push(index.to_string());
        Ok(())
    }
}

/// Mail sender that keeps every message.
#[derive(Default)]
pub struct RecordingMailSender {
    sent: Mutex<Vec<MailMessage>>,
    fail: Mutex<bool>,
}

impl RecordingMailSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        *guard(&self.fail) = fail;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<MailMessage> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl MailSender for RecordingMailSender {
    async fn send(&self, message: &MailMessage) -> AppResult<()> {
        if *guard(&self.fail) {
            return Err(AppError::Mail("smtp unavailable".to_string()));
        }
        guard(&self.sent).push(message.clone());
        Ok(())
    }
}

/// Billing gateway recording cancelled customers.
#[derive(Default)]
pub struct InMemoryBillingGateway {
    cancelled: Mutex<Vec<String>>,
}

impl InMemoryBillingGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        guard(&self.cancelled).clone()
    }
}

#[async_trait]
impl BillingGateway for InMemoryBillingGateway {
    async fn cancel_subscriptions(&self, customer_id: &str) -> AppResult<()> {
        guard(&self.cancelled).push(customer_id.to_string());
        Ok(())
    }
}

/// Geo lookup answering from a fixed table.
#[derive(Default)]
pub struct StaticGeoLookup {
    table: HashMap<String, Location>,
    pub lookups: AtomicUsize,
}

impl StaticGeoLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, ip_address: &str, location: Location) -> Self {
        self.table.insert(ip_address.to_string(), location);
        self
    }
}

#[async_trait]
impl GeoLookup for StaticGeoLookup {
    async fn resolve(&self, ip_address: &str) -> AppResult<Option<Location>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.table.get(ip_address).cloned())
    }
}
