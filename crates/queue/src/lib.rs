//! Task and message distribution for meetq.
//!
//! This crate provides the queueing components used between meeting
//! services:
//!
//! - **Message queue**: Durable prioritized work items on Redis, Kafka or in memory
//! - **Pub/Sub**: Best-effort cross-process events on Redis channels or Kafka topics
//! - **Event buses**: Bounded in-process fan-out, with an optional priority variant
//! - **Scheduler**: In-process tasks with priorities, delays, retries and cancellation
//! - **Dispatcher**: Route table from typed task requests to owning services
//! - **Manager**: Builds, starts and stops the enabled components from [`meetq_common::Config`]
//!
//! # Example
//!
//! ```no_run
//! use meetq_common::Config;
//! use meetq_queue::{HandlerError, Message, Payload, Priority, QueueManager};
//!
//! async fn run(config: &Config) -> meetq_queue::QueueResult<()> {
//!     let manager = QueueManager::from_config(config).await?;
//!     if let Some(queue) = manager.message_queue() {
//!         queue
//!             .register_handler("media.transcode", |message: Message| async move {
//!                 tracing::info!(id = %message.id, "transcoding");
//!                 Ok::<(), HandlerError>(())
//!             })
//!             .await;
//!     }
//!     manager.start().await?;
//!     manager
//!         .publish_task("media.transcode", Payload::new(), Priority::High)
//!         .await?;
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod handler;
#[cfg(feature = "kafka")]
mod kafka;
mod lanes;
pub mod lifecycle;
pub mod manager;
pub mod message_queue;
pub mod model;
pub mod names;
pub mod pubsub;
pub mod retry;
pub mod scheduler;

pub use client::{
    ClientSession, ClientTaskManager, ClientTaskRequest, ClientTaskResponse, ClientTaskStatus,
    ClientTaskType,
};
pub use dispatcher::TaskDispatcher;
pub use error::{QueueError, QueueResult};
pub use event_bus::{EventBusOptions, LocalEventBus, PriorityEventBus};
pub use handler::{Handler, HandlerError, HandlerResult, SharedHandler};
pub use lifecycle::ShutdownListener;
pub use manager::{QueueManager, QueueManagerBuilder, global, init_global, shutdown_global};
#[cfg(feature = "kafka")]
pub use message_queue::KafkaMessageQueue;
pub use message_queue::{
    MemoryMessageQueue, MessageQueue, QueueKeys, QueueLengths, QueueOptions, RedisMessageQueue,
};
pub use model::{
    LocalEvent, Message, Payload, Priority, PubSubMessage, ServiceRoute, Stats, TaskRequest,
    TaskResponse, TaskStatus, TaskType,
};
#[cfg(feature = "kafka")]
pub use pubsub::KafkaPubSub;
pub use pubsub::{PubSub, RedisPubSub};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{SchedulerOptions, Task, TaskResult, TaskScheduler};
