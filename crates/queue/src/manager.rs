//! Composition root for every queue component, plus a process-wide instance.

use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use meetq_common::Config;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::ClientTaskManager;
use crate::dispatcher::TaskDispatcher;
use crate::error::{QueueError, QueueResult};
use crate::event_bus::{EventBusOptions, LocalEventBus, PriorityEventBus};
use crate::handler::Handler;
use crate::message_queue::MessageQueue;
use crate::model::{Message, Payload, Priority, PubSubMessage, Stats};
use crate::names::channels;
use crate::pubsub::PubSub;
use crate::scheduler::{SchedulerOptions, Task, TaskScheduler};

/// Source recorded on events and messages created by the manager itself.
const MANAGER_SOURCE: &str = "queue_manager";

/// Owns the enabled queue components and their start/stop order.
pub struct QueueManager {
    message_queue: Option<MessageQueue>,
    pubsub: Option<PubSub>,
    event_bus: Option<LocalEventBus>,
    priority_event_bus: Option<PriorityEventBus>,
    scheduler: Option<TaskScheduler>,
    dispatcher: Option<TaskDispatcher>,
    client_tasks: Option<ClientTaskManager>,
    started: Mutex<bool>,
}

/// Assembles a [`QueueManager`] from prebuilt components.
#[derive(Default)]
pub struct QueueManagerBuilder {
    message_queue: Option<MessageQueue>,
    pubsub: Option<PubSub>,
    event_bus: Option<LocalEventBus>,
    priority_event_bus: Option<PriorityEventBus>,
    scheduler: Option<TaskScheduler>,
    dispatcher: Option<TaskDispatcher>,
}

impl QueueManagerBuilder {
    /// Use `queue` as the durable message queue.
    #[must_use]
    pub fn message_queue(mut self, queue: MessageQueue) -> Self {
        self.message_queue = Some(queue);
        self
    }

    /// Use `pubsub` for cross-process events.
    #[must_use]
    pub fn pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Use `bus` as the local event bus.
    #[must_use]
    pub fn event_bus(mut self, bus: LocalEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Use `bus` as the priority event bus.
    #[must_use]
    pub fn priority_event_bus(mut self, bus: PriorityEventBus) -> Self {
        self.priority_event_bus = Some(bus);
        self
    }

    /// Use `scheduler` for in-process tasks.
    #[must_use]
    pub fn scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use `dispatcher` for routed requests; also enables the client task manager.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Finish assembly. Nothing is started.
    #[must_use]
    pub fn build(self) -> QueueManager {
        let client_tasks = self.dispatcher.clone().map(ClientTaskManager::new);
        QueueManager {
            message_queue: self.message_queue,
            pubsub: self.pubsub,
            event_bus: self.event_bus,
            priority_event_bus: self.priority_event_bus,
            scheduler: self.scheduler,
            dispatcher: self.dispatcher,
            client_tasks,
            started: Mutex::new(false),
        }
    }
}

impl QueueManager {
    /// Start an empty builder.
    #[must_use]
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    /// Construct every component enabled in `config`, connecting backends.
    pub async fn from_config(config: &Config) -> QueueResult<Self> {
        let mut builder = Self::builder();

        if config.message_queue.enabled {
            let queue = MessageQueue::from_config(config).await?;
            info!(backend = queue.backend(), queue = %config.message_queue.queue_name, "Message queue configured");
            builder = builder.message_queue(queue);
        }
        if config.pubsub.enabled {
            let pubsub = PubSub::from_config(config).await?;
            info!(backend = pubsub.backend(), "Pub/sub configured");
            builder = builder.pubsub(pubsub);
        }
        if config.event_bus.enabled {
            let options = EventBusOptions::from(&config.event_bus);
            builder = builder.event_bus(LocalEventBus::new(options));
            if config.event_bus.priority_enabled {
                builder = builder.priority_event_bus(PriorityEventBus::new(options));
            }
        }
        if config.task_scheduler.enabled {
            builder = builder.scheduler(TaskScheduler::new(SchedulerOptions::from(&config.task_scheduler)));
        }
        if config.task_dispatcher.enabled {
            builder = builder.dispatcher(TaskDispatcher::new(&config.task_dispatcher).await);
        }

        Ok(builder.build())
    }

    /// Start components in dependency order. A second call is a no-op.
    ///
    /// If a backend fails to start, components already started are stopped
    /// again before the error is returned.
    pub async fn start(&self) -> QueueResult<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        if let Some(queue) = &self.message_queue {
            queue.start().await?;
        }
        if let Some(pubsub) = &self.pubsub
            && let Err(e) = pubsub.start().await
        {
            if let Some(queue) = &self.message_queue {
                queue.stop().await;
            }
            return Err(e);
        }
        if let Some(bus) = &self.event_bus {
            bus.start().await;
        }
        if let Some(bus) = &self.priority_event_bus {
            bus.start().await;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.start().await;
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.start().await;
        }

        *started = true;
        info!("Queue manager started");
        Ok(())
    }

    /// Stop components in reverse start order. A second call is a no-op.
    pub async fn stop(&self) {
        let mut started = self.started.lock().await;
        if !*started {
            return;
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop().await;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
        if let Some(bus) = &self.priority_event_bus {
            bus.stop().await;
        }
        if let Some(bus) = &self.event_bus {
            bus.stop().await;
        }
        if let Some(pubsub) = &self.pubsub {
            pubsub.stop().await;
        }
        if let Some(queue) = &self.message_queue {
            queue.stop().await;
        }

        *started = false;
        info!("Queue manager stopped");
    }

    /// Whether [`Self::start`] has completed without a matching stop.
    pub async fn is_running(&self) -> bool {
        *self.started.lock().await
    }

    /// The durable message queue, if enabled.
    #[must_use]
    pub const fn message_queue(&self) -> Option<&MessageQueue> {
        self.message_queue.as_ref()
    }

    /// The pub/sub bus, if enabled.
    #[must_use]
    pub const fn pubsub(&self) -> Option<&PubSub> {
        self.pubsub.as_ref()
    }

    /// The local event bus, if enabled.
    #[must_use]
    pub const fn event_bus(&self) -> Option<&LocalEventBus> {
        self.event_bus.as_ref()
    }

    /// The priority event bus, if enabled.
    #[must_use]
    pub const fn priority_event_bus(&self) -> Option<&PriorityEventBus> {
        self.priority_event_bus.as_ref()
    }

    /// The task scheduler, if enabled.
    #[must_use]
    pub const fn scheduler(&self) -> Option<&TaskScheduler> {
        self.scheduler.as_ref()
    }

    /// The task dispatcher, if enabled.
    #[must_use]
    pub const fn dispatcher(&self) -> Option<&TaskDispatcher> {
        self.dispatcher.as_ref()
    }

    /// The client task manager; present whenever the dispatcher is.
    #[must_use]
    pub const fn client_tasks(&self) -> Option<&ClientTaskManager> {
        self.client_tasks.as_ref()
    }

    /// Enqueue a durable message of `message_type`.
    pub async fn publish_task(
        &self,
        message_type: &str,
        payload: Payload,
        priority: Priority,
    ) -> QueueResult<String> {
        let queue = self
            .message_queue
            .as_ref()
            .ok_or_else(|| QueueError::Config("message queue is disabled".to_string()))?;
        let message = Message::new(message_type, payload)
            .with_priority(priority)
            .with_source(MANAGER_SOURCE);
        queue.publish(message).await
    }

    /// Broadcast on the `system_events` channel, or the local bus without pub/sub.
    pub async fn publish_system_event(&self, event_type: &str, payload: Payload) -> QueueResult<()> {
        if let Some(pubsub) = &self.pubsub {
            let message = PubSubMessage::new(event_type, payload).with_source(MANAGER_SOURCE);
            return pubsub.publish(channels::SYSTEM_EVENTS, message).await;
        }
        if self.event_bus.is_some() || self.priority_event_bus.is_some() {
            warn!(event_type, "Pub/sub disabled, delivering system event locally");
            return self.emit_local_event(event_type, payload);
        }
        Err(QueueError::Config("no event transport is enabled".to_string()))
    }

    /// Emit on the local bus, or the priority bus at normal priority.
    pub fn emit_local_event(&self, event_type: &str, payload: Payload) -> QueueResult<()> {
        if let Some(bus) = &self.event_bus {
            return bus.emit(event_type, payload, MANAGER_SOURCE);
        }
        if let Some(bus) = &self.priority_event_bus {
            return bus.emit(event_type, payload, MANAGER_SOURCE);
        }
        Err(QueueError::Config("event bus is disabled".to_string()))
    }

    /// Run `handler` on the scheduler no earlier than `delay` from now.
    pub async fn schedule_delayed_task<H>(
        &self,
        task_type: &str,
        payload: Payload,
        delay: Duration,
        handler: H,
    ) -> QueueResult<String>
    where
        H: Handler<Task> + 'static,
    {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| QueueError::Config("task scheduler is disabled".to_string()))?;
        scheduler
            .submit_task(Task::new(task_type, payload, handler).with_delay(delay))
            .await
    }

    /// Per-component statistics keyed by component name.
    pub async fn stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("running".into(), self.is_running().await.into());
        if let Some(queue) = &self.message_queue {
            stats.insert("message_queue".into(), Value::Object(queue.stats().await));
        }
        if let Some(pubsub) = &self.pubsub {
            stats.insert("pubsub".into(), Value::Object(pubsub.stats().await));
        }
        if let Some(bus) = &self.event_bus {
            stats.insert("event_bus".into(), Value::Object(bus.stats()));
        }
        if let Some(bus) = &self.priority_event_bus {
            stats.insert("priority_event_bus".into(), Value::Object(bus.stats()));
        }
        if let Some(scheduler) = &self.scheduler {
            stats.insert("task_scheduler".into(), Value::Object(scheduler.stats().await));
        }
        if let Some(dispatcher) = &self.dispatcher {
            stats.insert("task_dispatcher".into(), Value::Object(dispatcher.stats().await));
        }
        if let Some(clients) = &self.client_tasks {
            stats.insert("client_tasks".into(), Value::Object(clients.stats().await));
        }
        stats
    }
}

static GLOBAL: StdRwLock<Option<Arc<QueueManager>>> = StdRwLock::new(None);

/// Start `manager` and install it as the process-wide instance.
///
/// Fails with [`QueueError::AlreadyInitialized`] if an instance is installed.
pub async fn init_global(manager: QueueManager) -> QueueResult<Arc<QueueManager>> {
    if GLOBAL.read().unwrap_or_else(PoisonError::into_inner).is_some() {
        return Err(QueueError::AlreadyInitialized);
    }

    let manager = Arc::new(manager);
    manager.start().await?;

    let installed = {
        let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            false
        } else {
            *slot = Some(Arc::clone(&manager));
            true
        }
    };
    if !installed {
        manager.stop().await;
        return Err(QueueError::AlreadyInitialized);
    }
    Ok(manager)
}

/// The process-wide instance.
pub fn global() -> QueueResult<Arc<QueueManager>> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(QueueError::NotRunning("global queue manager"))
}

/// Stop and remove the process-wide instance. Returns whether one was installed.
pub async fn shutdown_global() -> bool {
    let manager = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
    match manager {
        Some(manager) => {
            manager.stop().await;
            true
        }
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use meetq_common::QueueBackendKind;
    use serde_json::json;

    use super::*;
    use crate::handler::HandlerError;
    use crate::model::LocalEvent;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.message_queue.backend = QueueBackendKind::Memory;
        config.pubsub.enabled = false;
        config.event_bus.priority_enabled = true;
        config
    }

    #[tokio::test]
    async fn test_from_config_builds_enabled_components() {
        let mut config = memory_config();
        config.event_bus.priority_enabled = false;
        config.task_dispatcher.enabled = false;
        let manager = QueueManager::from_config(&config).await.unwrap();

        assert_eq!(manager.message_queue().unwrap().backend(), "memory");
        assert!(manager.pubsub().is_none());
        assert!(manager.event_bus().is_some());
        assert!(manager.priority_event_bus().is_none());
        assert!(manager.scheduler().is_some());
        assert!(manager.dispatcher().is_none());
        assert!(manager.client_tasks().is_none());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let manager = QueueManager::from_config(&memory_config()).await.unwrap();
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running().await);
        assert!(manager.message_queue().unwrap().is_running());

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(!manager.message_queue().unwrap().is_running());
    }

    #[tokio::test]
    async fn test_system_event_falls_back_to_local_bus() {
        let manager = QueueManager::from_config(&memory_config()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .event_bus()
            .unwrap()
            .on("maintenance.scheduled", move |event: LocalEvent| {
                let tx = tx.clone();
                async move {
                    tx.send(event.source).ok();
                    Ok::<(), HandlerError>(())
                }
            })
            .await;
        manager.start().await.unwrap();

        let mut payload = Payload::new();
        payload.insert("window".into(), json!("02:00"));
        manager
            .publish_system_event("maintenance.scheduled", payload)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), MANAGER_SOURCE);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_components_report_config_errors() {
        let manager = QueueManager::builder().build();
        assert!(matches!(
            manager.publish_task("x", Payload::new(), Priority::High).await,
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            manager.emit_local_event("x", Payload::new()),
            Err(QueueError::Config(_))
        ));
        let stats = manager.stats().await;
        assert_eq!(stats.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_keyed_by_component() {
        let manager = QueueManager::from_config(&memory_config()).await.unwrap();
        manager
            .publish_task("media.transcode", Payload::new(), Priority::Low)
            .await
            .unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats["message_queue"]["backend"], "memory");
        for key in ["event_bus", "priority_event_bus", "task_scheduler", "task_dispatcher", "client_tasks"] {
            assert!(stats.contains_key(key), "missing {key}");
        }
    }
}
