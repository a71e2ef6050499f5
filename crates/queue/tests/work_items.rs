//! End-to-end work item tests against in-memory collaborators.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use faultline_common::{BulkSettings, LockSettings, ThrottlingSettings, WorkerConfig};
use faultline_core::testing::{
    InMemoryBillingGateway, InMemorySearchIndex, InMemoryStore, RecordingMailSender,
    StaticGeoLookup,
};
use faultline_core::{
    Location, Organization, PersistentEvent, Project, SearchDocument, Stack, User,
    default_pipeline, event_types, plans,
};
use faultline_queue::{
    BusMessage, CacheLockProvider, Disposition, ExecutionServices, HandlerDependencies,
    InMemoryCacheClient, InMemoryMessageBus, InMemoryWorkItemQueue, LockProvider, MessageBus,
    OrganizationMaintenanceWorkItem, ReindexWorkItem, RemoveOrganizationWorkItem,
    RemoveProjectWorkItem, SetLocationWorkItem, Stores, ThrottleBotsWorkItem,
    ThrottlingLockProvider, WorkItem, WorkItemDispatcher, WorkItemEnvelope, WorkItemQueue,
    EventNotificationWorkItem, default_registry,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<InMemoryStore>,
    search: Arc<InMemorySearchIndex>,
    billing: Arc<InMemoryBillingGateway>,
    mail: Arc<RecordingMailSender>,
    bus: Arc<InMemoryMessageBus>,
    locks: Arc<CacheLockProvider>,
    dispatcher: Arc<WorkItemDispatcher>,
}

impl Harness {
    fn new() -> Self {
        Self::with_geo(StaticGeoLookup::new())
    }

    fn with_geo(geo: StaticGeoLookup) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let search = Arc::new(InMemorySearchIndex::new());
        let billing = Arc::new(InMemoryBillingGateway::new());
        let mail = Arc::new(RecordingMailSender::new());
        let cache = Arc::new(InMemoryCacheClient::new());
        let bus = Arc::new(InMemoryMessageBus::new());

        let lock_settings = LockSettings {
            ttl_secs: 60,
            acquire_timeout_secs: 0,
            poll_interval_ms: 10,
        };
        let locks = Arc::new(CacheLockProvider::new(
            cache.clone(),
            bus.clone(),
            &lock_settings,
        ));
        let throttle = Arc::new(ThrottlingLockProvider::new(
            cache.clone(),
            &ThrottlingSettings {
                max_hits_per_period: 1,
                period_secs: 15 * 60,
            },
        ));

        let deps = HandlerDependencies {
            stores: Stores::shared(store.clone()),
            search: search.clone(),
            billing: billing.clone(),
            geo: Arc::new(geo),
            mail: mail.clone(),
            cache,
            formatting: default_pipeline().unwrap(),
            bulk: BulkSettings {
                page_size: 2,
                page_delay_ms: 0,
            },
        };
        let services = ExecutionServices {
            locks: locks.clone(),
            throttle,
            bus: bus.clone(),
            lock_settings,
        };
        let worker = WorkerConfig {
            concurrency: 2,
            max_attempts: 3,
            shutdown_grace_secs: 5,
            ..WorkerConfig::default()
        };
        let dispatcher = Arc::new(WorkItemDispatcher::new(
            default_registry(&deps).unwrap(),
            services,
            &worker,
        ));

        Self {
            store,
            search,
            billing,
            mail,
            bus,
            locks,
            dispatcher,
        }
    }

    async fn run<T: WorkItem>(&self, payload: &T) -> Disposition {
        self.run_attempt(payload, 1).await
    }

    async fn run_attempt<T: WorkItem>(&self, payload: &T, attempt: u32) -> Disposition {
        let envelope = WorkItemEnvelope::new(payload).unwrap();
        self.dispatcher
            .process(&envelope, attempt, CancellationToken::new())
            .await
    }

    fn seed_project(&self, organization_id: &str, project_id: &str, events: usize, stacks: usize) {
        self.store
            .insert_project(Project::new(project_id, organization_id, "Web"));
        for i in 0..events {
            self.store.insert_event(PersistentEvent::new(
                format!("{project_id}-e{i}"),
                organization_id,
                project_id,
            ));
        }
        for i in 0..stacks {
            self.store.insert_stack(Stack {
                id: format!("{project_id}-s{i}"),
                organization_id: organization_id.to_string(),
                project_id: project_id.to_string(),
                title: "boom".to_string(),
            });
        }
        self.store.insert_token(organization_id, project_id);
        self.store.insert_web_hook(organization_id, project_id);
    }

    fn seed_index(&self, index: &str, count: usize) {
        self.search.create_index(index);
        for i in 0..count {
            self.search.insert(
                index,
                SearchDocument::new(
                    format!("d{i}"),
                    json!({ "updated_utc": Utc::now().to_rfc3339() }),
                ),
            );
        }
    }
}

/// The final progress report among the messages received so far.
fn last_status(rx: &mut broadcast::Receiver<BusMessage>) -> Option<(u8, String)> {
    let mut last = None;
    while let Ok(message) = rx.try_recv() {
        if let BusMessage::WorkItemStatus {
            progress,
            message: Some(message),
            ..
        } = message
        {
            last = Some((progress, message));
        }
    }
    last
}

fn seed_organization(harness: &Harness) {
    let mut organization = Organization::new("org1", "Acme");
    organization.billing_customer_id = Some("cus_1".to_string());
    harness.store.insert_organization(organization);
    harness
        .store
        .insert_organization(Organization::new("org2", "Other"));

    harness.seed_project("org1", "p1", 5, 2);
    harness.seed_project("org2", "p2", 1, 0);

    harness
        .store
        .insert_user(User::new("u1", "one@example.com").in_organization("org1"));
    harness.store.insert_user(
        User::new("u2", "two@example.com")
            .in_organization("org1")
            .in_organization("org2"),
    );
}

#[tokio::test]
async fn test_remove_organization_hard_delete() {
    let harness = Harness::new();
    seed_organization(&harness);

    let payload = RemoveOrganizationWorkItem::new("org1").hard_delete();
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert!(harness.store.organization("org1").is_none());
    assert!(harness.store.project("p1").is_none());
    assert!(harness.store.project("p2").is_some());
    assert_eq!(harness.store.event_count(), 1);
    assert_eq!(harness.store.stack_count(), 0);
    assert_eq!(harness.store.token_count(), 1);
    assert_eq!(harness.store.web_hook_count(), 1);
    assert!(harness.store.user("u1").is_none());
    assert_eq!(
        harness.store.user("u2").unwrap().organization_ids,
        vec!["org2".to_string()]
    );
    assert_eq!(harness.billing.cancelled(), vec!["cus_1".to_string()]);
}

#[tokio::test]
async fn test_remove_organization_twice_is_a_no_op() {
    let harness = Harness::new();
    seed_organization(&harness);

    let payload = RemoveOrganizationWorkItem::new("org1").hard_delete();
    for _ in 0..2 {
        let mut rx = harness.bus.subscribe();
        assert_eq!(harness.run(&payload).await, Disposition::Ack);
        assert_eq!(
            last_status(&mut rx),
            Some((100, "Organization deleted".to_string()))
        );
    }

    assert_eq!(harness.billing.cancelled().len(), 1);
    assert!(harness.store.organization("org2").is_some());
    assert_eq!(harness.store.event_count(), 1);
}

#[tokio::test]
async fn test_remove_organization_soft_deletes_projects() {
    let harness = Harness::new();
    seed_organization(&harness);

    let payload = RemoveOrganizationWorkItem::new("org1");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert!(harness.store.organization("org1").is_none());
    assert!(harness.store.project("p1").unwrap().is_deleted);
    assert_eq!(harness.store.event_count(), 6);
}

#[tokio::test]
async fn test_reset_project_keeps_the_project() {
    let harness = Harness::new();
    harness
        .store
        .insert_organization(Organization::new("org1", "Acme"));
    harness.seed_project("org1", "p1", 5, 3);

    assert_eq!(
        harness.run(&RemoveProjectWorkItem::reset("p1")).await,
        Disposition::Ack
    );
    assert!(harness.store.project("p1").is_some());
    assert_eq!(harness.store.event_count(), 0);
    assert_eq!(harness.store.stack_count(), 0);
    assert_eq!(harness.store.token_count(), 1);

    assert_eq!(
        harness.run(&RemoveProjectWorkItem::new("p1")).await,
        Disposition::Ack
    );
    assert!(harness.store.project("p1").is_none());
    assert_eq!(harness.store.token_count(), 0);
}

#[tokio::test]
async fn test_busy_lock_abandons() {
    let harness = Harness::new();
    harness
        .store
        .insert_organization(Organization::new("org1", "Acme"));
    harness.seed_project("org1", "p1", 2, 0);

    let held = harness
        .locks
        .acquire("remove-project:p1", Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap();

    let payload = RemoveProjectWorkItem::new("p1");
    assert!(matches!(
        harness.run(&payload).await,
        Disposition::Abandon { .. }
    ));
    assert_eq!(harness.store.event_count(), 2);

    harness.locks.release(&held).await.unwrap();
    assert_eq!(harness.run(&payload).await, Disposition::Ack);
    assert_eq!(harness.store.event_count(), 0);
}

#[tokio::test]
async fn test_reindex_copies_swaps_and_deletes() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 5);
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v1");

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v2"));
    for i in 0..5 {
        assert!(harness.search.document("events-v2", &format!("d{i}")).is_some());
    }
    assert_eq!(
        *harness.search.deleted_indices.lock().unwrap(),
        vec!["events-v1".to_string()]
    );
    assert_eq!(harness.search.single_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reindex_catch_up_copies_writes_made_during_first_pass() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 4);
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v1");

    // Sorts before every seeded id, so the first pass has already scrolled
    // past its position when it lands.
    let late = SearchDocument::new(
        "a-late",
        json!({ "updated_utc": (Utc::now() + ChronoDuration::seconds(1)).to_rfc3339() }),
    );
    harness.search.write_during_next_bulk("events-v1", late);

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v2"));
    assert!(harness.search.document("events-v2", "a-late").is_some());
    for i in 0..4 {
        assert!(harness.search.document("events-v2", &format!("d{i}")).is_some());
    }
}

#[tokio::test]
async fn test_reindex_falls_back_to_single_writes() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 5);
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v1");
    harness.search.reject_bulk(true);

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert!(harness.search.single_writes.load(Ordering::SeqCst) >= 5);
    assert!(harness.search.document("events-v2", "d4").is_some());
    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v2"));
}

#[tokio::test]
async fn test_reindex_item_rejection_is_retried_individually() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 5);
    harness.search.create_index("events-v2");
    harness.search.reject_in_bulk("d1");

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert!(harness.search.document("events-v2", "d1").is_some());
    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v2"));
}

#[tokio::test]
async fn test_reindex_failed_document_blocks_cutover() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 5);
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v1");
    harness.search.poison("d2");

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    match harness.run(&payload).await {
        Disposition::DeadLetter { reason } => assert!(reason.contains("d2")),
        other => panic!("expected dead letter, got {other:?}"),
    }

    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v1"));
    assert!(harness.search.deleted_indices.lock().unwrap().is_empty());
    assert!(harness.search.document("events-v2", "d3").is_some());
}

#[tokio::test]
async fn test_reindex_keeps_old_index_when_new_is_smaller() {
    let harness = Harness::new();
    harness.seed_index("events-v1", 5);
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v1");
    harness.search.drop_writes_of("d3");

    let mut rx = harness.bus.subscribe();
    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    assert_eq!(harness.search.alias("events").as_deref(), Some("events-v2"));
    assert!(harness.search.deleted_indices.lock().unwrap().is_empty());
    assert!(harness.search.document("events-v1", "d3").is_some());

    let (progress, message) = last_status(&mut rx).unwrap();
    assert_eq!(progress, 100);
    assert!(message.contains("old index kept"));
}

#[tokio::test]
async fn test_reindex_already_migrated() {
    let harness = Harness::new();
    harness.search.create_index("events-v2");
    harness.search.set_alias("events", "events-v2");

    let payload = ReindexWorkItem::new("events", "events-v1", "events-v2");
    assert_eq!(harness.run(&payload).await, Disposition::Ack);
    assert_eq!(harness.search.bulk_calls.load(Ordering::SeqCst), 0);
}

fn seed_notification(harness: &Harness) {
    harness
        .store
        .insert_organization(Organization::new("org1", "Acme"));
    harness.seed_project("org1", "p1", 0, 0);
    harness.store.insert_event(
        PersistentEvent::new("e1", "org1", "p1")
            .with_type(event_types::LOG)
            .with_message("disk almost full"),
    );
    harness
        .store
        .insert_user(User::new("u1", "one@example.com").in_organization("org1"));
    harness
        .store
        .insert_user(User::new("u2", "two@example.com").in_organization("org1"));
    let mut muted = User::new("u3", "three@example.com").in_organization("org1");
    muted.email_notifications_enabled = false;
    harness.store.insert_user(muted);
}

fn notification() -> EventNotificationWorkItem {
    EventNotificationWorkItem {
        event_id: "e1".to_string(),
        is_new: true,
        is_regression: false,
        total_occurrences: 1,
    }
}

#[tokio::test]
async fn test_notification_sent_once_per_recipient() {
    let harness = Harness::new();
    seed_notification(&harness);

    assert_eq!(harness.run(&notification()).await, Disposition::Ack);
    assert_eq!(harness.run(&notification()).await, Disposition::Ack);

    let sent = harness.mail.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.subject.contains("[Web]")));
    assert!(!sent.iter().any(|m| m.to == "three@example.com"));
}

#[tokio::test]
async fn test_notification_mail_failure_is_retried() {
    let harness = Harness::new();
    seed_notification(&harness);
    harness.mail.fail(true);

    assert!(matches!(
        harness.run_attempt(&notification(), 1).await,
        Disposition::Abandon { .. }
    ));
    assert!(matches!(
        harness.run_attempt(&notification(), 3).await,
        Disposition::DeadLetter { .. }
    ));

    harness.mail.fail(false);
    assert_eq!(harness.run_attempt(&notification(), 2).await, Disposition::Ack);
    assert_eq!(harness.mail.sent().len(), 2);
}

#[tokio::test]
async fn test_missing_event_is_acknowledged() {
    let harness = Harness::new();
    assert_eq!(harness.run(&notification()).await, Disposition::Ack);
    assert!(harness.mail.sent().is_empty());
}

#[tokio::test]
async fn test_unknown_and_malformed_work_items_are_dead_lettered() {
    let harness = Harness::new();

    let mut unknown = WorkItemEnvelope::new(&RemoveProjectWorkItem::new("p1")).unwrap();
    unknown.work_item_type = "reticulate-splines".to_string();
    assert!(matches!(
        harness
            .dispatcher
            .process(&unknown, 1, CancellationToken::new())
            .await,
        Disposition::DeadLetter { .. }
    ));

    let mut malformed = WorkItemEnvelope::new(&RemoveProjectWorkItem::new("p1")).unwrap();
    malformed.data = json!({ "project": 42 });
    assert!(matches!(
        harness
            .dispatcher
            .process(&malformed, 1, CancellationToken::new())
            .await,
        Disposition::DeadLetter { .. }
    ));
}

#[tokio::test]
async fn test_cancelled_before_start_is_abandoned() {
    let harness = Harness::new();
    harness
        .store
        .insert_organization(Organization::new("org1", "Acme"));
    harness.seed_project("org1", "p1", 2, 0);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let envelope = WorkItemEnvelope::new(&RemoveProjectWorkItem::new("p1")).unwrap();
    assert!(matches!(
        harness.dispatcher.process(&envelope, 1, cancel).await,
        Disposition::Abandon { .. }
    ));
    assert_eq!(harness.store.event_count(), 2);
}

#[tokio::test]
async fn test_throttle_bots_hides_events_once_per_window() {
    let harness = Harness::new();
    let now = Utc::now();
    for i in 0..3 {
        let mut event = PersistentEvent::new(format!("bot{i}"), "org1", "p1");
        event.client_ip_address = Some("203.0.113.9".to_string());
        harness.store.insert_event(event);
    }
    let mut human = PersistentEvent::new("human", "org1", "p1");
    human.client_ip_address = Some("198.51.100.1".to_string());
    harness.store.insert_event(human);

    let payload = ThrottleBotsWorkItem {
        organization_id: "org1".to_string(),
        client_ip_address: "203.0.113.9".to_string(),
        utc_start: now - ChronoDuration::hours(1),
        utc_end: now + ChronoDuration::hours(1),
    };
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    for i in 0..3 {
        assert!(harness.store.event(&format!("bot{i}")).unwrap().is_hidden);
    }
    assert!(!harness.store.event("human").unwrap().is_hidden);

    assert!(matches!(
        harness.run(&payload).await,
        Disposition::Abandon { .. }
    ));
}

#[tokio::test]
async fn test_set_location() {
    let location = Location {
        country: Some("US".to_string()),
        level1: Some("CA".to_string()),
        locality: Some("Mountain View".to_string()),
    };
    let harness = Harness::with_geo(StaticGeoLookup::new().with("8.8.8.8", location.clone()));
    harness
        .store
        .insert_event(PersistentEvent::new("e1", "org1", "p1"));
    harness
        .store
        .insert_event(PersistentEvent::new("e2", "org1", "p1"));

    let public = SetLocationWorkItem {
        event_id: "e1".to_string(),
        ip_address: "8.8.8.8".to_string(),
    };
    let private = SetLocationWorkItem {
        event_id: "e2".to_string(),
        ip_address: "10.0.0.1".to_string(),
    };
    assert_eq!(harness.run(&public).await, Disposition::Ack);
    assert_eq!(harness.run(&private).await, Disposition::Ack);

    assert_eq!(harness.store.event("e1").unwrap().location, Some(location));
    assert_eq!(harness.store.event("e2").unwrap().location, None);
}

#[tokio::test]
async fn test_organization_maintenance_upgrades_retired_plans() {
    let harness = Harness::new();
    for i in 0..5 {
        let mut organization = Organization::new(format!("org{i}"), "Org");
        if i % 2 == 0 {
            organization.plan_id = "EX_SMALL".to_string();
        }
        harness.store.insert_organization(organization);
    }

    let payload = OrganizationMaintenanceWorkItem {
        upgrade_plans: true,
        remove_old_usage_stats: false,
    };
    assert_eq!(harness.run(&payload).await, Disposition::Ack);

    for i in 0..5 {
        let plan = harness.store.organization(&format!("org{i}")).unwrap().plan_id;
        let expected = if i % 2 == 0 { plans::SMALL } else { plans::FREE };
        assert_eq!(plan, expected);
    }
    assert_eq!(
        harness.store.organization_page_fetches.load(Ordering::SeqCst),
        3
    );
}

#[tokio::test]
async fn test_run_loop_drains_queue_and_stops() {
    let harness = Harness::new();
    harness
        .store
        .insert_organization(Organization::new("org1", "Acme"));
    for project in ["p1", "p2", "p3"] {
        harness.seed_project("org1", project, 3, 1);
    }

    let queue = Arc::new(InMemoryWorkItemQueue::new());
    for project in ["p1", "p2", "p3"] {
        queue
            .enqueue(WorkItemEnvelope::new(&RemoveProjectWorkItem::new(project)).unwrap())
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(
        harness
            .dispatcher
            .clone()
            .run(queue.clone(), shutdown.clone()),
    );

    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.completed().await.len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(harness.store.event_count(), 0);
    assert_eq!(queue.pending_len().await, 0);
    assert_eq!(queue.in_flight_len().await, 0);
}
