//! Worker process wiring for faultline.
//!
//! [`run`] connects the Redis backed cache, bus and work item storage, builds
//! the dispatcher over the given collaborators and serves work items until
//! the shutdown token fires.

use std::sync::Arc;

use anyhow::Context;
use apalis::layers::retry::RetryPolicy;
use apalis::prelude::*;
use apalis_redis::RedisStorage;
use faultline_common::{Config, Metrics, get_metrics};
use faultline_core::{
    BillingGateway, GeoLookup, MailSender, NoOpMailSender, SearchIndexClient, SmtpMailSender,
    default_pipeline,
};
use faultline_queue::{
    CacheClient, CacheLockProvider, ExecutionServices, HandlerDependencies, RedisCacheClient,
    RedisPubSub, RedisWorkItemProducer, Stores, ThrottlingLockProvider, WorkItemDispatcher,
    WorkItemEnvelope, WorkerContext, default_registry, work_item_worker,
};
use fred::interfaces::ClientLike;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External collaborators the handlers mutate.
#[derive(Clone)]
pub struct Collaborators {
    /// Repository ports.
    pub stores: Stores,
    /// Search cluster.
    pub search: Arc<dyn SearchIndexClient>,
    /// Billing provider.
    pub billing: Arc<dyn BillingGateway>,
    /// Geo lookup service.
    pub geo: Arc<dyn GeoLookup>,
}

fn mail_sender(config: &Config) -> anyhow::Result<Arc<dyn MailSender>> {
    if config.mail.enabled {
        let sender = SmtpMailSender::new(&config.mail).context("Failed to configure SMTP")?;
        info!(host = %config.mail.smtp_host, port = config.mail.smtp_port, "SMTP mail enabled");
        Ok(Arc::new(sender))
    } else {
        info!("Mail disabled");
        Ok(Arc::new(NoOpMailSender))
    }
}

fn log_metrics(metrics: &Metrics) {
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize metrics"),
    }
}

/// Serve work items until `shutdown` is cancelled.
pub async fn run(
    config: Config,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // Connect to Redis and initialize work item storage
    info!("Connecting to Redis...");
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .context("Failed to create Redis client")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;
    let storage = RedisStorage::<WorkItemEnvelope>::new(redis_conn);
    info!("Connected to Redis work item storage");

    // fred client for locks, counters and notification markers
    let fred_config = fred::types::config::Config::from_url(&config.redis.url)
        .context("Failed to parse Redis URL")?;
    let fred_client = fred::clients::Client::new(fred_config, None, None, None);
    fred_client.connect();
    fred_client
        .wait_for_connect()
        .await
        .context("Failed to connect fred client to Redis")?;
    let cache: Arc<dyn CacheClient> = Arc::new(RedisCacheClient::new(
        Arc::new(fred_client),
        config.redis.prefix.clone(),
    ));

    let bus = Arc::new(
        RedisPubSub::new(&config.redis.url, config.redis.prefix.clone())
            .await
            .context("Failed to connect Redis Pub/Sub")?,
    );
    bus.start().await.context("Failed to subscribe to Redis Pub/Sub")?;

    let services = ExecutionServices {
        locks: Arc::new(CacheLockProvider::new(
            cache.clone(),
            bus.clone(),
            &config.locks,
        )),
        throttle: Arc::new(ThrottlingLockProvider::new(cache.clone(), &config.throttling)),
        bus: bus.clone(),
        lock_settings: config.locks,
    };

    let deps = HandlerDependencies {
        stores: collaborators.stores,
        search: collaborators.search,
        billing: collaborators.billing,
        geo: collaborators.geo,
        mail: mail_sender(&config)?,
        cache,
        formatting: default_pipeline().context("Invalid formatting plugin order")?,
        bulk: config.bulk,
    };
    let registry = default_registry(&deps)?;
    info!(types = ?registry.registered_types(), "Handlers registered");

    let dispatcher = Arc::new(WorkItemDispatcher::new(registry, services, &config.worker));
    let context = WorkerContext {
        dispatcher,
        shutdown: shutdown.clone(),
        redeliver: Arc::new(RedisWorkItemProducer::new(storage.clone())),
    };

    let worker = WorkerBuilder::new(config.worker.name.as_str())
        .concurrency(config.worker.concurrency.max(1))
        .retry(RetryPolicy::retries(config.worker.max_attempts as usize))
        .data(context)
        .backend(storage)
        .build_fn(work_item_worker);

    info!(
        name = %config.worker.name,
        concurrency = config.worker.concurrency,
        max_attempts = config.worker.max_attempts,
        "Starting work item worker"
    );

    let signal = shutdown.clone();
    Monitor::new()
        .register(worker)
        .shutdown_timeout(config.worker.shutdown_grace())
        .run_with_signal(async move {
            signal.cancelled().await;
            Ok(())
        })
        .await
        .context("Work item worker failed")?;

    bus.shutdown().await.context("Failed to shut down Redis Pub/Sub")?;
    log_metrics(get_metrics());
    info!("Worker shutdown complete");
    Ok(())
}
