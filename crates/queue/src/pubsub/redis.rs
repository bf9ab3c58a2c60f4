//! Redis pub/sub backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fred::clients::{Client, SubscriberClient};
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use fred::types::config::Config as RedisConfig;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PubSubCore;
use crate::error::QueueResult;
use crate::handler::SharedHandler;
use crate::lifecycle::ShutdownListener;
use crate::model::{PubSubMessage, Stats};

struct Subscription {
    client: SubscriberClient,
    task: JoinHandle<()>,
}

struct Inner {
    core: PubSubCore,
    config: RedisConfig,
    publisher: Client,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

/// Pub/sub over Redis channels, one subscriber connection per channel.
#[derive(Clone)]
pub struct RedisPubSub {
    inner: Arc<Inner>,
}

impl RedisPubSub {
    /// Connect the publishing client. Subscriber connections open lazily.
    pub async fn connect(redis_url: &str, handler_timeout: Duration) -> QueueResult<Self> {
        let config = RedisConfig::from_url(redis_url)?;
        let publisher = Client::new(config.clone(), None, None, None);
        publisher.init().await?;

        info!("Redis pub/sub initialized");
        Ok(Self {
            inner: Arc::new(Inner {
                core: PubSubCore::new(handler_timeout),
                config,
                publisher,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(super) fn core(&self) -> &PubSubCore {
        &self.inner.core
    }

    /// Add a handler; opens the channel's connection when running and not yet open.
    pub async fn subscribe(&self, channel: &str, handler: SharedHandler<PubSubMessage>) -> QueueResult<()> {
        self.inner.core.add_handler(channel, handler).await;
        if self.inner.core.pool.is_running() {
            self.open_channel(channel).await?;
        }
        debug!(channel, "Subscribed to channel");
        Ok(())
    }

    /// Drop the channel's handlers and close its connection.
    pub async fn unsubscribe(&self, channel: &str) -> QueueResult<()> {
        self.inner.core.remove_channel(channel).await;
        let subscription = self.inner.subscriptions.lock().await.remove(channel);
        if let Some(subscription) = subscription {
            subscription.task.abort();
            let _ = subscription.client.unsubscribe(channel).await;
            let _ = subscription.client.quit().await;
        }
        debug!(channel, "Unsubscribed from channel");
        Ok(())
    }

    /// Publish one message.
    pub async fn publish(&self, channel: &str, mut message: PubSubMessage) -> QueueResult<()> {
        self.inner.core.prepare(&mut message);
        let payload = serde_json::to_string(&message)?;
        let _: () = self.inner.publisher.publish(channel, payload).await?;
        self.inner.core.record_published(1);
        debug!(channel, message_id = %message.id, "Published pub/sub message");
        Ok(())
    }

    /// Publish several messages in one pipeline.
    pub async fn publish_batch(&self, channel: &str, messages: Vec<PubSubMessage>) -> QueueResult<()> {
        let mut payloads = Vec::with_capacity(messages.len());
        for mut message in messages {
            self.inner.core.prepare(&mut message);
            payloads.push(serde_json::to_string(&message)?);
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let pipeline = self.inner.publisher.pipeline();
        for payload in &payloads {
            let _: () = pipeline.publish(channel, payload.as_str()).await?;
        }
        let _: () = pipeline.all().await?;
        self.inner.core.record_published(payloads.len() as u64);
        Ok(())
    }

    /// Open a subscriber connection for every channel with handlers.
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
        info!(
            channels = self.inner.subscriptions.lock().await.len(),
            "Redis pub/sub started"
        );
        Ok(())
    }

    /// Close every subscriber connection and wait for the receive loops.
    pub async fn stop(&self) {
        if self.stop_inner().await {
            info!("Redis pub/sub stopped");
        }
    }

    async fn stop_inner(&self) -> bool {
        if !self.inner.core.pool.shutdown().await {
            return false;
        }
        let subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in subscriptions {
            let _ = subscription.task.await;
            let _ = subscription.client.quit().await;
        }
        true
    }

    async fn open_channel(&self, channel: &str) -> QueueResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.contains_key(channel) {
            return Ok(());
        }

        let client = SubscriberClient::new(self.inner.config.clone(), None, None, None);
        client.init().await?;
        let messages = client.message_rx();
        client.subscribe(channel).await?;

        let pubsub = self.clone();
        let shutdown = self.inner.core.pool.listener();
        let name = channel.to_string();
        let task = tokio::spawn(async move { pubsub.receive_loop(name, messages, shutdown).await });

        subscriptions.insert(channel.to_string(), Subscription { client, task });
        debug!(channel, "Opened subscriber connection");
        Ok(())
    }

    async fn receive_loop(
        self,
        channel: String,
        mut messages: tokio::sync::broadcast::Receiver<fred::types::Message>,
        shutdown: ShutdownListener,
    ) {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = messages.recv() => received,
            };
            match received {
                Ok(message) => {
                    if let Some(payload) = message.value.as_string() {
                        self.inner
                            .core
                            .deliver_raw(&channel, payload.as_bytes(), &shutdown)
                            .await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "Pub/sub receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(channel = %channel, "Pub/sub receive loop ended");
    }

    /// Delivery counters.
    pub async fn stats(&self) -> Stats {
        self.inner.core.counter_stats().await
    }
}
