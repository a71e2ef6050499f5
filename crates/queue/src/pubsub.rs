//! Pub/sub message bus.
//!
//! Carries lock release notifications between worker processes and publishes
//! work-item progress for observers. Messages received from Redis are fanned
//! out to a local broadcast channel that any number of tasks can subscribe to.

#![allow(missing_docs)]

use async_trait::async_trait;
use faultline_common::{AppError, AppResult};
use fred::clients::{Client, SubscriberClient};
use fred::error::Error as RedisError;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use fred::types::config::Config as RedisConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the local fan-out channel.
const LOCAL_CHANNEL_CAPACITY: usize = 1000;

/// Channel name suffixes, joined to the configured key prefix.
pub mod channels {
    /// Lock release notifications.
    pub const LOCKS: &str = "locks";
    /// Work-item progress and completion.
    pub const WORK_ITEMS: &str = "work-items";
}

/// Messages exchanged on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusMessage {
    /// A lock was released; waiters for `key` should retry now.
    LockReleased { key: String },
    /// Progress of a running work item.
    WorkItemStatus {
        work_item_id: String,
        work_item_type: String,
        progress: u8,
        message: Option<String>,
    },
    /// A work item finished and was acknowledged.
    WorkItemCompleted {
        work_item_id: String,
        work_item_type: String,
    },
    /// A work item failed and was abandoned or dead-lettered.
    WorkItemFailed {
        work_item_id: String,
        work_item_type: String,
        error_code: String,
        error: String,
    },
}

impl BusMessage {
    const fn channel(&self) -> &'static str {
        match self {
            Self::LockReleased { .. } => channels::LOCKS,
            _ => channels::WORK_ITEMS,
        }
    }
}

/// Publish/subscribe bus shared by every worker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> AppResult<()>;

    /// Receive every message published after this call.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// Redis Pub/Sub backed bus.
#[derive(Clone)]
pub struct RedisPubSub {
    publisher: Client,
    subscriber: SubscriberClient,
    prefix: String,
    /// Local broadcast channel for messages received from Redis.
    local_tx: broadcast::Sender<BusMessage>,
}

impl RedisPubSub {
    /// Connect a publisher and a subscriber client.
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, RedisError> {
        let config = RedisConfig::from_url(redis_url)?;

        let publisher = Client::new(config.clone(), None, None, None);
        publisher.init().await?;

        let subscriber = SubscriberClient::new(config, None, None, None);
        subscriber.init().await?;

        let (local_tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);

        info!("Redis Pub/Sub initialized");

        Ok(Self {
            publisher,
            subscriber,
            prefix: prefix.into(),
            local_tx,
        })
    }

    fn channel_name(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    /// Subscribe to the bus channels and start the fan-out loop.
    pub async fn start(&self) -> Result<(), RedisError> {
        self.subscriber
            .subscribe(self.channel_name(channels::LOCKS))
            .await?;
        self.subscriber
            .subscribe(self.channel_name(channels::WORK_ITEMS))
            .await?;

        info!(prefix = %self.prefix, "Subscribed to Redis Pub/Sub channels");

        let local_tx = self.local_tx.clone();
        let mut message_stream = self.subscriber.message_rx();

        tokio::spawn(async move {
            while let Ok(message) = message_stream.recv().await {
                let Some(payload) = message.value.as_string() else {
                    continue;
                };
                match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(message) => {
                        debug!(?message, "Received Pub/Sub message");
                        // No local subscribers is normal between lock waits.
                        let _ = local_tx.send(message);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to parse Pub/Sub message");
                    }
                }
            }
            info!("Pub/Sub message stream ended");
        });

        Ok(())
    }

    /// Get the number of local subscribers.
    #[must_use]
    pub fn local_subscriber_count(&self) -> usize {
        self.local_tx.receiver_count()
    }

    /// Shutdown the Pub/Sub manager.
    pub async fn shutdown(&self) -> Result<(), RedisError> {
        self.subscriber.quit().await?;
        self.publisher.quit().await?;
        info!("Redis Pub/Sub shutdown");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisPubSub {
    async fn publish(&self, message: &BusMessage) -> AppResult<()> {
        let payload = serde_json::to_string(message)?;
        let channel = self.channel_name(message.channel());
        let _: () = self
            .publisher
            .publish(channel.as_str(), payload)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        debug!(channel = %channel, ?message, "Published Pub/Sub message");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.local_tx.subscribe()
    }
}

/// Single-process bus.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl InMemoryMessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: &BusMessage) -> AppResult<()> {
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}
