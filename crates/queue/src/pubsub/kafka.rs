//! Kafka pub/sub backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meetq_common::KafkaConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::Message as _;
use rdkafka::producer::FutureProducer;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PubSubCore;
use crate::error::QueueResult;
use crate::handler::SharedHandler;
use crate::kafka::{self as client, FETCH_BACKOFF};
use crate::lifecycle::ShutdownListener;
use crate::model::{PubSubMessage, Stats};

struct Inner {
    core: PubSubCore,
    kafka: KafkaConfig,
    producer: FutureProducer,
    group_id: String,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Pub/sub over `{prefix}.events.{channel}` topics.
///
/// Each subscribed channel gets one auto-committing consumer in the
/// `{group_id}-events` group.
#[derive(Clone)]
pub struct KafkaPubSub {
    inner: Arc<Inner>,
}

impl KafkaPubSub {
    /// Create the producer. Consumers are created per channel.
    pub fn new(kafka: &KafkaConfig, handler_timeout: Duration) -> QueueResult<Self> {
        let producer = client::producer(kafka)?;
        Ok(Self {
            inner: Arc::new(Inner {
                core: PubSubCore::new(handler_timeout),
                kafka: kafka.clone(),
                producer,
                group_id: format!("{}-events", kafka.group_id),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(super) fn core(&self) -> &PubSubCore {
        &self.inner.core
    }

    /// Topic carrying `channel`.
    #[must_use]
    pub fn topic_for(&self, channel: &str) -> String {
        format!("{}.events.{channel}", self.inner.kafka.topic_prefix)
    }

    /// Add a handler; starts the channel's consumer when running.
    pub async fn subscribe(&self, channel: &str, handler: SharedHandler<PubSubMessage>) -> QueueResult<()> {
        self.inner.core.add_handler(channel, handler).await;
        if self.inner.core.pool.is_running() {
            self.open_channel(channel).await?;
        }
        debug!(channel, "Subscribed to channel");
        Ok(())
    }

    /// Drop the channel's handlers and stop its consumer.
    pub async fn unsubscribe(&self, channel: &str) -> QueueResult<()> {
        self.inner.core.remove_channel(channel).await;
        if let Some(task) = self.inner.subscriptions.lock().await.remove(channel) {
            task.abort();
        }
        debug!(channel, "Unsubscribed from channel");
        Ok(())
    }

    /// Produce one message keyed by its type.
    pub async fn publish(&self, channel: &str, mut message: PubSubMessage) -> QueueResult<()> {
        self.inner.core.prepare(&mut message);
        let payload = serde_json::to_string(&message)?;
        client::send(
            &self.inner.producer,
            &self.topic_for(channel),
            &message.message_type,
            &payload,
        )
        .await?;
        self.inner.core.record_published(1);
        Ok(())
    }

    /// Produce several messages, stopping at the first error.
    pub async fn publish_batch(&self, channel: &str, messages: Vec<PubSubMessage>) -> QueueResult<()> {
        for message in messages {
            self.publish(channel, message).await?;
        }
        Ok(())
    }

    /// Start a consumer for every channel with handlers.
    pub async fn start(&self) -> QueueResult<()> {
        if !self.inner.core.pool.begin() {
            return Ok(());
        }
        for channel in self.inner.core.channels().await {
            if let Err(e) = self.open_channel(&channel).await {
                self.stop_inner().await;
                return Err(e);
            }
        }
        info!(group_id = %self.inner.group_id, "Kafka pub/sub started");
        Ok(())
    }

    /// Stop every consumer and wait for it to exit.
    pub async fn stop(&self) {
        if self.stop_inner().await {
            info!("Kafka pub/sub stopped");
        }
    }

    async fn stop_inner(&self) -> bool {
        if !self.inner.core.pool.shutdown().await {
            return false;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        true
    }

    async fn open_channel(&self, channel: &str) -> QueueResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.contains_key(channel) {
            return Ok(());
        }

        let topic = self.topic_for(channel);
        client::ensure_topics(&self.inner.kafka, &[&topic]).await?;
        let consumer = client::consumer(&self.inner.kafka, &self.inner.group_id, &topic, true)?;

        let pubsub = self.clone();
        let shutdown = self.inner.core.pool.listener();
        let name = channel.to_string();
        let task = tokio::spawn(async move { pubsub.receive_loop(name, consumer, shutdown).await });
        subscriptions.insert(channel.to_string(), task);
        debug!(channel, topic = %topic, "Started channel consumer");
        Ok(())
    }

    async fn receive_loop(self, channel: String, consumer: StreamConsumer, shutdown: ShutdownListener) {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = consumer.recv() => received.map(|record| record.detach()),
            };
            match received {
                Ok(record) => {
                    if let Some(payload) = record.payload() {
                        self.inner.core.deliver_raw(&channel, payload, &shutdown).await;
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Kafka fetch failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(FETCH_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(channel = %channel, "Channel consumer stopped");
    }

    /// Delivery counters.
    pub async fn stats(&self) -> Stats {
        self.inner.core.counter_stats().await
    }
}
