//! Durable priority message queues.
//!
//! Three interchangeable backends share one contract:
//!
//! - [`RedisMessageQueue`]: four Redis lists drained by blocking pops, a
//!   processing hash recovered by a visibility-timeout scanner, a DLQ list
//! - `KafkaMessageQueue`: one tasks topic consumed by a consumer group,
//!   offsets committed after the handler outcome is applied
//! - [`MemoryMessageQueue`]: bounded in-process lanes for tests and
//!   single-node deployments
//!
//! [`MessageQueue`] selects one of them from configuration.

mod memory;
mod redis;

#[cfg(feature = "kafka")]
mod kafka;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use meetq_common::{Config, IdGenerator, MessageQueueConfig, QueueBackendKind, Timer, get_metrics};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

pub use memory::MemoryMessageQueue;
pub use redis::{QueueKeys, RedisMessageQueue};

#[cfg(feature = "kafka")]
pub use kafka::KafkaMessageQueue;

use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, Outcome, SharedHandler, invoke};
use crate::lifecycle::{ShutdownListener, WorkerPool};
use crate::model::{Message, Priority, Stats};
use crate::retry::{RetryDecision, RetryPolicy};

/// Runtime settings shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Base name for keys and the DLQ.
    pub queue_name: String,
    /// Concurrent workers.
    pub workers: usize,
    /// Default time a message may stay in processing.
    pub visibility_timeout: Duration,
    /// Blocking pop timeout.
    pub poll_interval: Duration,
    /// Period of the abandoned-message scanner.
    pub scan_interval: Duration,
    /// Retry budget applied to messages published without one.
    pub default_max_retries: u32,
    /// Handler deadline applied to messages published without one.
    pub default_timeout: Duration,
    /// Retry backoff.
    pub retry: RetryPolicy,
    /// Whether exhausted messages are kept in the DLQ or dropped.
    pub dead_letter: bool,
    /// Total lane capacity of the in-memory backend.
    pub buffer_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&MessageQueueConfig::default())
    }
}

impl From<&MessageQueueConfig> for QueueOptions {
    fn from(config: &MessageQueueConfig) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            workers: config.workers.max(1),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            scan_interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            default_max_retries: config.max_retries,
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::from(config),
            dead_letter: config.enable_dead_letter_queue,
            buffer_size: config.buffer_size,
        }
    }
}

impl QueueOptions {
    /// Name of the dead-letter destination.
    #[must_use]
    pub fn dead_letter_name(&self) -> String {
        format!("{}:dlq", self.queue_name)
    }
}

/// Pending messages per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QueueLengths {
    pub critical: u64,
    pub high: u64,
    pub normal: u64,
    pub low: u64,
}

impl QueueLengths {
    /// Sum over all priorities.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.critical + self.high + self.normal + self.low
    }

    pub(crate) fn set(&mut self, priority: Priority, length: u64) {
        match priority {
            Priority::Critical => self.critical = length,
            Priority::High => self.high = length,
            Priority::Normal => self.normal = length,
            Priority::Low => self.low = length,
        }
    }

    pub(crate) fn to_json(self) -> serde_json::Value {
        json!({
            "critical": self.critical,
            "high": self.high,
            "normal": self.normal,
            "low": self.low,
        })
    }
}

/// What a worker must do with a message after its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    Done,
    Retry(Duration),
    DeadLetter(String),
    /// Shutdown interrupted the handler; the message was not settled.
    Interrupted,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub published: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_letter: AtomicU64,
}

/// Handler registry, counters and retry logic common to all backends.
pub(crate) struct QueueCore {
    pub options: QueueOptions,
    handlers: RwLock<HashMap<String, SharedHandler<Message>>>,
    pub counters: QueueCounters,
    pub pool: WorkerPool,
    id_gen: IdGenerator,
}

impl QueueCore {
    pub(crate) fn new(options: QueueOptions) -> Self {
        Self {
            options,
            handlers: RwLock::new(HashMap::new()),
            counters: QueueCounters::default(),
            pool: WorkerPool::new("message_queue"),
            id_gen: IdGenerator::new(),
        }
    }

    pub(crate) async fn register_handler(&self, message_type: String, handler: SharedHandler<Message>) {
        debug!(queue = %self.options.queue_name, message_type = %message_type, "Registered message handler");
        self.handlers.write().await.insert(message_type, handler);
    }

    /// Fill publish-time defaults.
    pub(crate) fn prepare(&self, message: &mut Message) {
        if message.id.is_empty() {
            message.id = self.id_gen.generate();
        }
        if message.timestamp == 0 {
            message.timestamp = Utc::now().timestamp();
        }
        if message.timeout == 0 {
            message.timeout = self.options.default_timeout.as_secs();
        }
        if message.visibility_timeout == 0 {
            message.visibility_timeout = self.options.visibility_timeout.as_secs();
        }
        if message.max_retries == 0 {
            message.max_retries = self.options.default_max_retries;
        }
        if message.dead_letter_queue.is_empty() {
            message.dead_letter_queue = self.options.dead_letter_name();
        }
    }

    pub(crate) fn record_published(&self, count: u64) {
        self.counters.published.fetch_add(count, Ordering::Relaxed);
        get_metrics().record_published(count);
    }

    /// Run the registered handler and decide the message's fate.
    pub(crate) async fn process(&self, message: &mut Message, shutdown: &ShutdownListener) -> Disposition {
        let handler = self.handlers.read().await.get(&message.message_type).cloned();
        let Some(handler) = handler else {
            warn!(
                message_id = %message.id,
                message_type = %message.message_type,
                "No handler registered, dead-lettering"
            );
            return Disposition::DeadLetter(
                QueueError::NoHandler(message.message_type.clone()).to_string(),
            );
        };

        let timeout = if message.timeout == 0 {
            self.options.default_timeout
        } else {
            message.timeout_duration()
        };

        let timer = Timer::start();
        let outcome = invoke(handler, message.clone(), timeout, shutdown.cancelled()).await;
        if outcome == Outcome::Cancelled {
            return Disposition::Interrupted;
        }
        get_metrics().record_handled(timer.elapsed(), outcome.is_success());

        match outcome.error_text() {
            None => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %message.id, elapsed = ?timer.elapsed(), "Message processed");
                Disposition::Done
            }
            Some(error) => self.after_failure(message, error),
        }
    }

    /// Count a failed attempt and apply the retry policy.
    pub(crate) fn after_failure(&self, message: &mut Message, error: String) -> Disposition {
        self.record_failed();
        self.plan_failure(message, error)
    }

    /// Apply the retry policy to a failed message without touching counters.
    pub(crate) fn plan_failure(&self, message: &mut Message, error: String) -> Disposition {
        warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
            error = %error,
            "Message processing failed"
        );

        match self
            .options
            .retry
            .next_attempt(&mut message.retry_count, message.max_retries)
        {
            RetryDecision::Retry(delay) => Disposition::Retry(delay),
            RetryDecision::Exhausted => Disposition::DeadLetter(error),
        }
    }

    pub(crate) fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message that is back on its lane.
    pub(crate) fn record_retried(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_retried();
    }

    /// Count a message written to the dead-letter destination.
    pub(crate) fn record_dead_lettered(&self) {
        self.counters.dead_letter.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_dead_lettered();
    }

    /// Annotate an exhausted message. Returns `false` when dead-lettering is disabled.
    pub(crate) fn dead_letter(&self, message: &mut Message, error: String) -> bool {
        if !self.options.dead_letter {
            error!(
                message_id = %message.id,
                error = %error,
                "Dropping exhausted message, dead-letter queue disabled"
            );
            return false;
        }
        message.mark_dead_lettered(error);
        true
    }

    pub(crate) fn counter_stats(&self) -> Stats {
        let c = &self.counters;
        let mut stats = Stats::new();
        stats.insert("total_published".into(), c.published.load(Ordering::Relaxed).into());
        stats.insert("total_processed".into(), c.processed.load(Ordering::Relaxed).into());
        stats.insert("total_failed".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("total_retried".into(), c.retried.load(Ordering::Relaxed).into());
        stats.insert("total_dead_letter".into(), c.dead_letter.load(Ordering::Relaxed).into());
        stats.insert("workers".into(), self.options.workers.into());
        stats
    }
}

/// Sleep for a retry delay unless shutdown comes first.
pub(crate) async fn wait_retry(delay: Duration, shutdown: &ShutdownListener) {
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = shutdown.cancelled() => {}
    }
}

/// Run `attempt` until it succeeds, backing off with `policy` between
/// failures. Returns `false` when shutdown interrupts the backoff.
pub(crate) async fn retry_until_ok<F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownListener,
    operation: &str,
    mut attempt: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<()>>,
{
    let mut failures = 0;
    loop {
        match attempt().await {
            Ok(()) => return true,
            Err(e) => {
                failures += 1;
                error!(operation, attempt = failures, error = %e, "Operation failed, retrying");
                wait_retry(policy.delay_for_attempt(failures), shutdown).await;
                if shutdown.is_shutdown() {
                    return false;
                }
            }
        }
    }
}

/// A message queue backend chosen at runtime.
pub enum MessageQueue {
    /// Redis lists.
    Redis(RedisMessageQueue),
    /// Kafka topic.
    #[cfg(feature = "kafka")]
    Kafka(KafkaMessageQueue),
    /// In-process lanes.
    Memory(MemoryMessageQueue),
}

impl MessageQueue {
    /// Build the backend selected by `config.message_queue.backend`.
    pub async fn from_config(config: &Config) -> QueueResult<Self> {
        let options = QueueOptions::from(&config.message_queue);
        match config.message_queue.backend {
            QueueBackendKind::Redis => {
                Ok(Self::Redis(RedisMessageQueue::connect(&config.redis.url, options).await?))
            }
            #[cfg(feature = "kafka")]
            QueueBackendKind::Kafka => Ok(Self::Kafka(KafkaMessageQueue::new(&config.kafka, options)?)),
            #[cfg(not(feature = "kafka"))]
            QueueBackendKind::Kafka => Err(QueueError::Config(
                "kafka backend requires the `kafka` feature".to_string(),
            )),
            QueueBackendKind::Memory => Ok(Self::Memory(MemoryMessageQueue::new(options))),
        }
    }

    /// Backend name.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
            Self::Memory(_) => "memory",
        }
    }

    /// Register the handler for `message_type`, replacing any previous one.
    pub async fn register_handler<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: Handler<Message> + 'static,
    {
        self.core()
            .register_handler(message_type.into(), std::sync::Arc::new(handler))
            .await;
    }

    /// Enqueue a message and return its id.
    pub async fn publish(&self, message: Message) -> QueueResult<String> {
        match self {
            Self::Redis(q) => q.publish(message).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.publish(message).await,
            Self::Memory(q) => q.publish(message).await,
        }
    }

    /// Enqueue several messages and return their ids.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        match self {
            Self::Redis(q) => q.publish_batch(messages).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.publish_batch(messages).await,
            Self::Memory(q) => q.publish_batch(messages).await,
        }
    }

    /// Start workers. A second call is a no-op.
    pub async fn start(&self) -> QueueResult<()> {
        match self {
            Self::Redis(q) => q.start().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.start().await,
            Self::Memory(q) => q.start().await,
        }
    }

    /// Stop workers and wait for them to exit.
    pub async fn stop(&self) {
        match self {
            Self::Redis(q) => q.stop().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.stop().await,
            Self::Memory(q) => q.stop().await,
        }
    }

    /// Whether workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core().pool.is_running()
    }

    /// Counters plus backend-specific gauges.
    pub async fn stats(&self) -> Stats {
        let mut stats = match self {
            Self::Redis(q) => q.stats().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.stats(),
            Self::Memory(q) => q.stats().await,
        };
        stats.insert("backend".into(), self.backend().into());
        stats
    }

    /// The Redis backend, if selected.
    #[must_use]
    pub const fn as_redis(&self) -> Option<&RedisMessageQueue> {
        match self {
            Self::Redis(q) => Some(q),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// The in-memory backend, if selected.
    #[must_use]
    pub const fn as_memory(&self) -> Option<&MemoryMessageQueue> {
        match self {
            Self::Memory(q) => Some(q),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// The Kafka backend, if selected.
    #[cfg(feature = "kafka")]
    #[must_use]
    pub const fn as_kafka(&self) -> Option<&KafkaMessageQueue> {
        match self {
            Self::Kafka(q) => Some(q),
            _ => None,
        }
    }

    fn core(&self) -> &QueueCore {
        match self {
            Self::Redis(q) => q.core(),
            #[cfg(feature = "kafka")]
            Self::Kafka(q) => q.core(),
            Self::Memory(q) => q.core(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::model::Payload;

    fn core() -> QueueCore {
        QueueCore::new(QueueOptions {
            queue_name: "tasks".to_string(),
            default_max_retries: 3,
            ..Default::default()
        })
    }

    #[test]
    fn test_prepare_fills_defaults() {
        let core = core();
        let mut message = Message::new("media.transcode", Payload::new());
        core.prepare(&mut message);

        assert_eq!(message.id.len(), 26);
        assert!(message.timestamp > 0);
        assert_eq!(message.timeout, 30);
        assert_eq!(message.visibility_timeout, 30);
        assert_eq!(message.max_retries, 3);
        assert_eq!(message.dead_letter_queue, "tasks:dlq");
    }

    #[test]
    fn test_prepare_keeps_explicit_values() {
        let core = core();
        let mut message = Message::new("x", Payload::new())
            .with_max_retries(1)
            .with_timeout(Duration::from_secs(5));
        message.id = "fixed".to_string();
        core.prepare(&mut message);

        assert_eq!(message.id, "fixed");
        assert_eq!(message.max_retries, 1);
        assert_eq!(message.timeout, 5);
    }

    #[tokio::test]
    async fn test_missing_handler_dead_letters() {
        let core = core();
        let pool = WorkerPool::new("test");
        pool.begin();
        let mut message = Message::new("unknown.type", Payload::new());

        let disposition = core.process(&mut message, &pool.listener()).await;
        assert_eq!(
            disposition,
            Disposition::DeadLetter("no handler registered for message type: unknown.type".into())
        );
    }

    #[tokio::test]
    async fn test_failure_then_exhaustion() {
        let core = core();
        core.register_handler(
            "flaky".to_string(),
            std::sync::Arc::new(|_: Message| async { Err::<(), HandlerError>("boom".into()) }),
        )
        .await;
        let pool = WorkerPool::new("test");
        pool.begin();
        let mut message = Message::new("flaky", Payload::new()).with_max_retries(2);
        core.prepare(&mut message);

        let first = core.process(&mut message, &pool.listener()).await;
        assert_eq!(first, Disposition::Retry(Duration::from_secs(1)));
        let second = core.process(&mut message, &pool.listener()).await;
        assert_eq!(second, Disposition::DeadLetter("boom".into()));
        assert_eq!(message.retry_count, 2);

        let stats = core.counter_stats();
        assert_eq!(stats["total_failed"], 2);
        // Retries are counted by the backend once the message is requeued.
        assert_eq!(stats["total_retried"], 0);
    }

    #[test]
    fn test_dead_letter_disabled_drops() {
        let core = QueueCore::new(QueueOptions {
            dead_letter: false,
            ..Default::default()
        });
        let mut message = Message::new("x", Payload::new());
        assert!(!core.dead_letter(&mut message, "boom".into()));
        assert!(message.last_error.is_none());
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retry_until_ok_keeps_trying() {
        let pool = WorkerPool::new("test");
        pool.begin();
        let calls = AtomicU64::new(0);

        let sent = retry_until_ok(&fast_retry(), &pool.listener(), "send", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err::<(), _>(QueueError::Config("broker unavailable".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(sent);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_until_ok_stops_on_shutdown() {
        let pool = WorkerPool::new("test");
        pool.begin();
        let listener = pool.listener();
        pool.shutdown().await;

        let sent = retry_until_ok(&fast_retry(), &listener, "send", || async {
            Err::<(), _>(QueueError::Config("broker unavailable".into()))
        })
        .await;
        assert!(!sent);
    }

    #[test]
    fn test_queue_lengths_total() {
        let mut lengths = QueueLengths::default();
        lengths.set(Priority::Critical, 2);
        lengths.set(Priority::Low, 5);
        assert_eq!(lengths.total(), 7);
        assert_eq!(lengths.to_json()["low"], 5);
    }
}
