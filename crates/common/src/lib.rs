//! Common utilities and shared types for meetq.
//!
//! This crate provides foundational components used across all meetq crates:
//!
//! - **Configuration**: Layered settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Metrics**: Process-wide queue counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use meetq_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     println!("queue {} id {}", config.message_queue.queue_name, id_gen.generate());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::{
    Config, EventBusConfig, KafkaConfig, LoggingConfig, MessageQueueConfig, PubSubBackendKind,
    PubSubConfig, QueueBackendKind, RedisConfig, TaskDispatcherConfig, TaskSchedulerConfig,
};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{Metrics, MetricsSnapshot, Timer, get_metrics};
