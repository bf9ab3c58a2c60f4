//! Best-effort publish/subscribe across service instances.
//!
//! Every message received on a channel is delivered to all of the channel's
//! handlers concurrently. There is no acknowledgement, retry or dead-letter
//! handling: a failing handler only increments `total_failed`.

mod redis;

#[cfg(feature = "kafka")]
mod kafka;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use meetq_common::{Config, IdGenerator, PubSubBackendKind, get_metrics};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub use redis::RedisPubSub;

#[cfg(feature = "kafka")]
pub use kafka::KafkaPubSub;

use crate::error::QueueResult;
use crate::handler::{Handler, SharedHandler, fan_out};
use crate::lifecycle::{ShutdownListener, WorkerPool};
use crate::model::{PubSubMessage, Stats};

#[derive(Debug, Default)]
struct PubSubCounters {
    published: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Handler registry and counters shared by the backends.
pub(crate) struct PubSubCore {
    handlers: RwLock<HashMap<String, Vec<SharedHandler<PubSubMessage>>>>,
    counters: PubSubCounters,
    pub pool: WorkerPool,
    handler_timeout: Duration,
    id_gen: IdGenerator,
}

impl PubSubCore {
    pub(crate) fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            counters: PubSubCounters::default(),
            pool: WorkerPool::new("pubsub"),
            handler_timeout,
            id_gen: IdGenerator::new(),
        }
    }

    /// Add a handler. Returns `true` if it is the channel's first.
    pub(crate) async fn add_handler(&self, channel: &str, handler: SharedHandler<PubSubMessage>) -> bool {
        let mut handlers = self.handlers.write().await;
        let entry = handlers.entry(channel.to_string()).or_default();
        entry.push(handler);
        entry.len() == 1
    }

    /// Drop all handlers of `channel`. Returns whether any existed.
    pub(crate) async fn remove_channel(&self, channel: &str) -> bool {
        self.handlers.write().await.remove(channel).is_some()
    }

    pub(crate) async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub(crate) fn prepare(&self, message: &mut PubSubMessage) {
        if message.id.is_empty() {
            message.id = self.id_gen.generate();
        }
        if message.timestamp == 0 {
            message.timestamp = Utc::now().timestamp();
        }
    }

    pub(crate) fn record_published(&self, count: u64) {
        self.counters.published.fetch_add(count, Ordering::Relaxed);
        get_metrics().record_pubsub_published(count);
    }

    /// Decode a raw payload and fan it out to the channel's handlers.
    pub(crate) async fn deliver_raw(&self, channel: &str, raw: &[u8], shutdown: &ShutdownListener) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_pubsub_received();

        let message: PubSubMessage = match serde_json::from_slice(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel, error = %e, "Failed to parse pub/sub message");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let handlers = self
            .handlers
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(channel, "No handlers for pub/sub message");
            return;
        }

        let (tally, outcomes) = fan_out(handlers, &message, self.handler_timeout, shutdown).await;
        for error in outcomes.iter().filter_map(|outcome| outcome.error_text()) {
            warn!(channel, message_id = %message.id, error = %error, "Pub/sub handler failed");
        }
        self.counters.processed.fetch_add(tally.succeeded, Ordering::Relaxed);
        self.counters.failed.fetch_add(tally.failed, Ordering::Relaxed);
    }

    pub(crate) async fn counter_stats(&self) -> Stats {
        let c = &self.counters;
        let mut stats = Stats::new();
        stats.insert("total_published".into(), c.published.load(Ordering::Relaxed).into());
        stats.insert("total_received".into(), c.received.load(Ordering::Relaxed).into());
        stats.insert("total_processed".into(), c.processed.load(Ordering::Relaxed).into());
        stats.insert("total_failed".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("channel_count".into(), self.handlers.read().await.len().into());
        stats
    }
}

/// A pub/sub backend chosen at runtime.
pub enum PubSub {
    /// Redis channels.
    Redis(RedisPubSub),
    /// Kafka topics.
    #[cfg(feature = "kafka")]
    Kafka(KafkaPubSub),
}

impl PubSub {
    /// Build the backend selected by `config.pubsub.backend`.
    pub async fn from_config(config: &Config) -> QueueResult<Self> {
        let handler_timeout = Duration::from_secs(config.pubsub.handler_timeout_secs.max(1));
        match config.pubsub.backend {
            PubSubBackendKind::Redis => Ok(Self::Redis(
                RedisPubSub::connect(&config.redis.url, handler_timeout).await?,
            )),
            #[cfg(feature = "kafka")]
            PubSubBackendKind::Kafka => Ok(Self::Kafka(KafkaPubSub::new(&config.kafka, handler_timeout)?)),
            #[cfg(not(feature = "kafka"))]
            PubSubBackendKind::Kafka => Err(crate::error::QueueError::Config(
                "kafka backend requires the `kafka` feature".to_string(),
            )),
        }
    }

    /// Backend name.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
        }
    }

    /// Add a handler for `channel`.
    pub async fn subscribe<H>(&self, channel: &str, handler: H) -> QueueResult<()>
    where
        H: Handler<PubSubMessage> + 'static,
    {
        let handler: SharedHandler<PubSubMessage> = Arc::new(handler);
        match self {
            Self::Redis(p) => p.subscribe(channel, handler).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.subscribe(channel, handler).await,
        }
    }

    /// Remove every handler of `channel` and close its connection.
    pub async fn unsubscribe(&self, channel: &str) -> QueueResult<()> {
        match self {
            Self::Redis(p) => p.unsubscribe(channel).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.unsubscribe(channel).await,
        }
    }

    /// Publish one message.
    pub async fn publish(&self, channel: &str, message: PubSubMessage) -> QueueResult<()> {
        match self {
            Self::Redis(p) => p.publish(channel, message).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.publish(channel, message).await,
        }
    }

    /// Publish several messages to one channel.
    pub async fn publish_batch(&self, channel: &str, messages: Vec<PubSubMessage>) -> QueueResult<()> {
        match self {
            Self::Redis(p) => p.publish_batch(channel, messages).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.publish_batch(channel, messages).await,
        }
    }

    /// Open subscriptions for every channel with handlers.
    pub async fn start(&self) -> QueueResult<()> {
        match self {
            Self::Redis(p) => p.start().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.start().await,
        }
    }

    /// Close all subscriptions and wait for their loops to exit.
    pub async fn stop(&self) {
        match self {
            Self::Redis(p) => p.stop().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.stop().await,
        }
    }

    /// Channels with at least one handler.
    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.core().channels().await
    }

    /// Delivery counters.
    pub async fn stats(&self) -> Stats {
        let mut stats = self.core().counter_stats().await;
        stats.insert("backend".into(), self.backend().into());
        stats
    }

    /// Whether subscriptions are active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core().pool.is_running()
    }

    fn core(&self) -> &PubSubCore {
        match self {
            Self::Redis(p) => p.core(),
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.core(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::handler::HandlerError;
    use crate::model::Payload;

    #[tokio::test]
    async fn test_deliver_fans_out_and_counts() {
        let core = PubSubCore::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            core.add_handler(
                "meeting_events",
                Arc::new(move |_: PubSubMessage| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .await;
        }
        core.add_handler(
            "meeting_events",
            Arc::new(|_: PubSubMessage| async { Err::<(), HandlerError>("offline".into()) }),
        )
        .await;

        let mut message = PubSubMessage::new("meeting.created", Payload::new());
        core.prepare(&mut message);
        let raw = serde_json::to_vec(&message).unwrap();
        let pool = WorkerPool::new("test");
        pool.begin();

        core.deliver_raw("meeting_events", &raw, &pool.listener()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = core.counter_stats().await;
        assert_eq!(stats["total_received"], 1);
        assert_eq!(stats["total_processed"], 2);
        assert_eq!(stats["total_failed"], 1);
        assert_eq!(stats["channel_count"], 1);
    }

    #[tokio::test]
    async fn test_first_handler_flag_and_removal() {
        let core = PubSubCore::new(Duration::from_secs(1));
        let handler: SharedHandler<PubSubMessage> = Arc::new(|_: PubSubMessage| async { Ok::<(), HandlerError>(()) });

        assert!(core.add_handler("ai_events", Arc::clone(&handler)).await);
        assert!(!core.add_handler("ai_events", handler).await);
        assert_eq!(core.channels().await, vec!["ai_events".to_string()]);
        assert!(core.remove_channel("ai_events").await);
        assert!(!core.remove_channel("ai_events").await);
    }

    #[tokio::test]
    async fn test_undecodable_payload_counts_failure() {
        let core = PubSubCore::new(Duration::from_secs(1));
        let pool = WorkerPool::new("test");
        pool.begin();

        core.deliver_raw("user_events", b"not json", &pool.listener()).await;

        let stats = core.counter_stats().await;
        assert_eq!(stats["total_received"], 1);
        assert_eq!(stats["total_failed"], 1);
    }
}
