//! Redis-backed priority queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use fred::clients::Client;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, ListInterface, LuaInterface};
use fred::types::config::Config as RedisConfig;
use tracing::{debug, error, info, warn};

use super::{Disposition, QueueCore, QueueLengths, QueueOptions, retry_until_ok, wait_retry};
use crate::error::{QueueError, QueueResult};
use crate::lifecycle::ShutdownListener;
use crate::model::{Message, Priority, Stats};

/// Atomically remove a processing record and append a payload to a list.
/// Returns 1 when the record existed, 0 when another worker or scanner
/// already claimed it.
const SETTLE_SCRIPT: &str = r"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
";

/// Redis key layout for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    lanes: [String; 4],
    processing: String,
    dead_letter: String,
}

impl QueueKeys {
    /// Keys for `queue_name`.
    #[must_use]
    pub fn new(queue_name: &str) -> Self {
        Self {
            lanes: Priority::DRAIN_ORDER.map(|p| format!("{queue_name}:{}", p.as_str())),
            processing: format!("{queue_name}:processing"),
            dead_letter: format!("{queue_name}:dlq"),
        }
    }

    /// List holding messages of `priority`.
    #[must_use]
    pub fn lane(&self, priority: Priority) -> &str {
        &self.lanes[priority.drain_index()]
    }

    /// Lists in blocking-pop order.
    #[must_use]
    pub fn lanes(&self) -> Vec<String> {
        self.lanes.to_vec()
    }

    /// Hash of in-flight messages keyed by id.
    #[must_use]
    pub fn processing(&self) -> &str {
        &self.processing
    }

    /// Dead-letter list.
    #[must_use]
    pub fn dead_letter(&self) -> &str {
        &self.dead_letter
    }
}

struct Inner {
    core: QueueCore,
    client: Client,
    keys: QueueKeys,
}

/// Priority queue over four Redis lists.
///
/// Each worker owns a dedicated connection for its blocking pop; the
/// shared client serves publishes, bookkeeping and admin commands.
#[derive(Clone)]
pub struct RedisMessageQueue {
    inner: Arc<Inner>,
}

impl RedisMessageQueue {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: &str, options: QueueOptions) -> QueueResult<Self> {
        let config = RedisConfig::from_url(redis_url)?;
        let client = Client::new(config, None, None, None);
        client.init().await?;

        let keys = QueueKeys::new(&options.queue_name);
        info!(queue = %options.queue_name, "Redis message queue connected");

        Ok(Self {
            inner: Arc::new(Inner {
                core: QueueCore::new(options),
                client,
                keys,
            }),
        })
    }

    pub(super) fn core(&self) -> &QueueCore {
        &self.inner.core
    }

    /// Key layout in use.
    #[must_use]
    pub fn keys(&self) -> &QueueKeys {
        &self.inner.keys
    }

    /// Apply defaults, serialize and push to the list for the message's priority.
    pub async fn publish(&self, mut message: Message) -> QueueResult<String> {
        self.inner.core.prepare(&mut message);
        let payload = serde_json::to_string(&message)?;

        let _: () = self
            .inner
            .client
            .rpush(self.inner.keys.lane(message.priority), payload)
            .await?;
        self.inner.core.record_published(1);

        debug!(message_id = %message.id, priority = %message.priority, "Message published");
        Ok(message.id)
    }

    /// Publish in a single pipeline. Nothing is sent if any message fails to serialize.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        let mut encoded = Vec::with_capacity(messages.len());
        for mut message in messages {
            self.inner.core.prepare(&mut message);
            let payload = serde_json::to_string(&message)?;
            encoded.push((message.id, message.priority, payload));
        }
        if encoded.is_empty() {
            return Ok(Vec::new());
        }

        let pipeline = self.inner.client.pipeline();
        for (_, priority, payload) in &encoded {
            let _: () = pipeline
                .rpush(self.inner.keys.lane(*priority), payload.as_str())
                .await?;
        }
        let _: () = pipeline.all().await?;

        self.inner.core.record_published(encoded.len() as u64);
        Ok(encoded.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Open worker connections and start workers plus the scanner.
    pub async fn start(&self) -> QueueResult<()> {
        let core = &self.inner.core;
        if !core.pool.begin() {
            return Ok(());
        }

        let mut connections: Vec<Client> = Vec::with_capacity(core.options.workers);
        for _ in 0..core.options.workers {
            let connection = self.inner.client.clone_new();
            if let Err(e) = connection.init().await {
                for opened in &connections {
                    let _ = opened.quit().await;
                }
                core.pool.shutdown().await;
                return Err(e.into());
            }
            connections.push(connection);
        }

        for (worker_id, connection) in connections.into_iter().enumerate() {
            let queue = self.clone();
            let shutdown = core.pool.listener();
            core.pool
                .spawn(async move { queue.run_worker(worker_id, connection, shutdown).await })
                .await;
        }

        let queue = self.clone();
        let shutdown = core.pool.listener();
        core.pool.spawn(async move { queue.run_scanner(shutdown).await }).await;

        info!(
            queue = %core.options.queue_name,
            workers = core.options.workers,
            "Redis message queue started"
        );
        Ok(())
    }

    /// Stop workers and the scanner, waiting for them to exit.
    pub async fn stop(&self) {
        if self.inner.core.pool.shutdown().await {
            info!(queue = %self.inner.core.options.queue_name, "Redis message queue stopped");
        }
    }

    async fn run_worker(self, worker_id: usize, connection: Client, shutdown: ShutdownListener) {
        let lanes = self.inner.keys.lanes();
        let poll_secs = self.inner.core.options.poll_interval.as_secs_f64();
        debug!(worker_id, "Redis queue worker started");

        while !shutdown.is_shutdown() {
            let popped: Option<(String, String)> =
                match connection.blpop(lanes.clone(), poll_secs).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        error!(worker_id, error = %e, "Blocking pop failed");
                        wait_retry(std::time::Duration::from_secs(1), &shutdown).await;
                        continue;
                    }
                };
            let Some((lane, raw)) = popped else {
                continue;
            };

            if shutdown.is_shutdown() {
                // Popped during shutdown: return it to the head of its list.
                if let Err(e) = connection.lpush::<(), _, _>(lane.as_str(), raw).await {
                    error!(worker_id, error = %e, "Failed to return message on shutdown");
                }
                break;
            }

            self.handle_raw(&connection, raw, &shutdown).await;
        }

        let _ = connection.quit().await;
        debug!(worker_id, "Redis queue worker stopped");
    }

    async fn handle_raw(&self, connection: &Client, raw: String, shutdown: &ShutdownListener) {
        let mut message: Message = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Undecodable message, moving to dead-letter queue");
                if self.inner.core.options.dead_letter {
                    if let Err(e) = connection
                        .rpush::<(), _, _>(self.inner.keys.dead_letter(), raw)
                        .await
                    {
                        error!(error = %e, "Failed to dead-letter undecodable message");
                    }
                }
                return;
            }
        };

        message.processing_start_time = Some(Utc::now().timestamp());
        let tracked = match serde_json::to_string(&message) {
            Ok(record) => match connection
                .hset::<(), _, _>(self.inner.keys.processing(), (message.id.as_str(), record))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Failed to write processing record");
                    false
                }
            },
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to encode processing record");
                false
            }
        };

        let disposition = self.inner.core.process(&mut message, shutdown).await;
        self.settle(connection, message, disposition, tracked, shutdown).await;
    }

    /// Apply a handler outcome. `tracked` says whether a processing record
    /// was written for the message before the handler ran.
    async fn settle(
        &self,
        connection: &Client,
        mut message: Message,
        disposition: Disposition,
        tracked: bool,
        shutdown: &ShutdownListener,
    ) {
        let keys = &self.inner.keys;
        match disposition {
            Disposition::Interrupted => {
                if tracked {
                    info!(message_id = %message.id, "Handler interrupted by shutdown, left for recovery");
                } else {
                    message.processing_start_time = None;
                    self.push_to(connection, &message, keys.lane(message.priority), tracked, shutdown)
                        .await;
                }
            }
            Disposition::Done => self.forget(connection, &message).await,
            Disposition::Retry(delay) => {
                wait_retry(delay, shutdown).await;
                message.processing_start_time = None;
                if self
                    .push_to(connection, &message, keys.lane(message.priority), tracked, shutdown)
                    .await
                {
                    self.inner.core.record_retried();
                }
            }
            Disposition::DeadLetter(error) => {
                if self.inner.core.dead_letter(&mut message, error) {
                    if self
                        .push_to(connection, &message, keys.dead_letter(), tracked, shutdown)
                        .await
                    {
                        self.inner.core.record_dead_lettered();
                    }
                } else {
                    self.forget(connection, &message).await;
                }
            }
        }
    }

    async fn forget(&self, connection: &Client, message: &Message) {
        if let Err(e) = connection
            .hdel::<(), _, _>(self.inner.keys.processing(), message.id.as_str())
            .await
        {
            error!(message_id = %message.id, error = %e, "Failed to remove processing record");
        }
    }

    /// Push the message to `list`, gated on its processing record when one
    /// exists. Returns whether this worker performed the push.
    async fn push_to(
        &self,
        connection: &Client,
        message: &Message,
        list: &str,
        tracked: bool,
        shutdown: &ShutdownListener,
    ) -> bool {
        if !tracked {
            let payload = match serde_json::to_string(message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Failed to encode message, dropping");
                    return false;
                }
            };
            return retry_until_ok(&self.inner.core.options.retry, shutdown, "redis push", || {
                let payload = payload.clone();
                async move {
                    connection
                        .rpush::<(), _, _>(list, payload)
                        .await
                        .map_err(QueueError::from)
                }
            })
            .await;
        }

        match self.move_record(connection, message, list).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(message_id = %message.id, "Processing record already claimed by the scanner");
                false
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to settle message, left for recovery");
                false
            }
        }
    }

    /// Remove the message's processing record and push it to `list` if the
    /// record was still present. Returns whether the move happened.
    async fn move_record(&self, connection: &Client, message: &Message, list: &str) -> QueueResult<bool> {
        let payload = serde_json::to_string(message)?;
        let moved: i64 = connection
            .eval(
                SETTLE_SCRIPT,
                vec![self.inner.keys.processing().to_string(), list.to_string()],
                vec![message.id.clone(), payload],
            )
            .await?;
        Ok(moved == 1)
    }

    async fn run_scanner(self, shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.inner.core.options.scan_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.recover_abandoned().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Recovered abandoned messages"),
                Err(e) => error!(error = %e, "Processing scan failed"),
            }
        }
    }

    /// Retry or dead-letter every processing record older than its
    /// visibility timeout. Returns the number of records recovered.
    pub async fn recover_abandoned(&self) -> QueueResult<usize> {
        let client = &self.inner.client;
        let keys = &self.inner.keys;
        let records: HashMap<String, String> = client.hgetall(keys.processing()).await?;
        let now = Utc::now().timestamp();
        let mut recovered = 0;

        for (id, raw) in records {
            let mut message: Message = match serde_json::from_str(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Undecodable processing record");
                    let removed: i64 = client.hdel(keys.processing(), id.as_str()).await?;
                    if removed == 1 && self.inner.core.options.dead_letter {
                        let _: () = client.rpush(keys.dead_letter(), raw).await?;
                    }
                    continue;
                }
            };

            let visibility = if message.visibility_timeout == 0 {
                self.inner.core.options.visibility_timeout.as_secs()
            } else {
                message.visibility_timeout
            };
            let started = message.processing_start_time.unwrap_or(message.timestamp);
            if now.saturating_sub(started) < i64::try_from(visibility).unwrap_or(i64::MAX) {
                continue;
            }

            warn!(message_id = %message.id, "Processing record exceeded visibility timeout");
            message.processing_start_time = None;
            let disposition = self
                .inner
                .core
                .plan_failure(&mut message, "visibility timeout exceeded".to_string());
            let moved = match disposition {
                Disposition::Retry(_) => {
                    let moved = self.move_record(client, &message, keys.lane(message.priority)).await?;
                    if moved {
                        self.inner.core.record_retried();
                    }
                    moved
                }
                Disposition::DeadLetter(error) => {
                    if self.inner.core.dead_letter(&mut message, error) {
                        let moved = self.move_record(client, &message, keys.dead_letter()).await?;
                        if moved {
                            self.inner.core.record_dead_lettered();
                        }
                        moved
                    } else {
                        let removed: i64 = client.hdel(keys.processing(), id.as_str()).await?;
                        removed == 1
                    }
                }
                Disposition::Done | Disposition::Interrupted => false,
            };
            if moved {
                self.inner.core.record_failed();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Pending messages per priority.
    pub async fn queue_lengths(&self) -> QueueResult<QueueLengths> {
        let mut lengths = QueueLengths::default();
        for priority in Priority::DRAIN_ORDER {
            let length: u64 = self.inner.client.llen(self.inner.keys.lane(priority)).await?;
            lengths.set(priority, length);
        }
        Ok(lengths)
    }

    /// Pending messages across all priorities.
    pub async fn total_length(&self) -> QueueResult<u64> {
        Ok(self.queue_lengths().await?.total())
    }

    /// Messages currently held in the processing hash.
    pub async fn processing_count(&self) -> QueueResult<u64> {
        Ok(self.inner.client.hlen(self.inner.keys.processing()).await?)
    }

    /// Messages in the dead-letter list.
    pub async fn dead_letter_count(&self) -> QueueResult<u64> {
        Ok(self.inner.client.llen(self.inner.keys.dead_letter()).await?)
    }

    /// Up to `limit` dead-lettered messages, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let raw: Vec<String> = self
            .inner
            .client
            .lrange(self.inner.keys.dead_letter(), 0, stop)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    /// Delete the dead-letter list. Returns the number of messages removed.
    pub async fn clear_dead_letters(&self) -> QueueResult<u64> {
        let count = self.dead_letter_count().await?;
        let _: i64 = self.inner.client.del(self.inner.keys.dead_letter()).await?;
        info!(count, "Cleared dead-letter queue");
        Ok(count)
    }

    /// Move dead letters back to their priority lists with a fresh retry budget.
    pub async fn requeue_dead_letters(&self) -> QueueResult<u64> {
        let client = &self.inner.client;
        let keys = &self.inner.keys;
        let count = self.dead_letter_count().await?;
        let mut moved = 0;

        for _ in 0..count {
            let entry: Option<String> = client.lpop(keys.dead_letter(), None).await?;
            let Some(raw) = entry else {
                break;
            };
            match serde_json::from_str::<Message>(&raw) {
                Ok(mut message) => {
                    message.reset_for_requeue();
                    let payload = serde_json::to_string(&message)?;
                    let _: () = client.rpush(keys.lane(message.priority), payload).await?;
                    moved += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Keeping undecodable dead letter");
                    let _: () = client.rpush(keys.dead_letter(), raw).await?;
                }
            }
        }

        info!(moved, "Requeued dead letters");
        Ok(moved)
    }

    /// Counters plus list and hash gauges.
    pub async fn stats(&self) -> Stats {
        let mut stats = self.inner.core.counter_stats();
        stats.insert("queue_name".into(), self.inner.core.options.queue_name.clone().into());

        match self.queue_lengths().await {
            Ok(lengths) => {
                stats.insert("queue_lengths".into(), lengths.to_json());
                stats.insert("total_length".into(), lengths.total().into());
            }
            Err(e) => warn!(error = %e, "Failed to read queue lengths"),
        }
        match self.processing_count().await {
            Ok(count) => {
                stats.insert("processing_count".into(), count.into());
            }
            Err(e) => warn!(error = %e, "Failed to read processing count"),
        }
        match self.dead_letter_count().await {
            Ok(count) => {
                stats.insert("dead_letter_count".into(), count.into());
            }
            Err(e) => warn!(error = %e, "Failed to read dead-letter count"),
        }
        stats
    }
}
