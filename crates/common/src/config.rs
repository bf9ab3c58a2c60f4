//! Application configuration.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Kafka configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Durable message queue configuration.
    #[serde(default)]
    pub message_queue: MessageQueueConfig,
    /// Publish/subscribe configuration.
    #[serde(default)]
    pub pubsub: PubSubConfig,
    /// In-process event bus configuration.
    #[serde(default)]
    pub event_bus: EventBusConfig,
    /// Task scheduler configuration.
    #[serde(default)]
    pub task_scheduler: TaskSchedulerConfig,
    /// Task dispatcher configuration.
    #[serde(default)]
    pub task_dispatcher: TaskDispatcherConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// Kafka configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap brokers.
    #[serde(default = "default_kafka_brokers")]
    pub brokers: Vec<String>,
    /// Prefix for every topic this process creates or consumes.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Consumer group id.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Partitions for auto-created topics.
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// Replication factor for auto-created topics.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    /// Consumer session timeout in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// `security.protocol` (e.g. `SASL_SSL`).
    #[serde(default)]
    pub security_protocol: Option<String>,
    /// `sasl.mechanism` (e.g. `PLAIN`, `SCRAM-SHA-512`).
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    /// SASL username.
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL password.
    #[serde(default)]
    pub sasl_password: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            topic_prefix: default_topic_prefix(),
            group_id: default_group_id(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            session_timeout_ms: default_session_timeout_ms(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

/// Storage backend for the durable message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    /// Four Redis lists plus processing hash and dead-letter list.
    #[default]
    Redis,
    /// Kafka topic with a consumer group.
    Kafka,
    /// In-process lanes, lost on restart.
    Memory,
}

/// Durable message queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Whether the message queue is constructed.
    pub enabled: bool,
    /// Backend selection.
    pub backend: QueueBackendKind,
    /// Logical queue name (Redis key prefix).
    pub queue_name: String,
    /// Worker count.
    pub workers: usize,
    /// Seconds a dequeued message stays invisible before it is considered abandoned.
    pub visibility_timeout_secs: u64,
    /// Blocking pop timeout in milliseconds.
    pub poll_interval_ms: u64,
    /// How often the processing set is scanned for abandoned messages.
    pub scan_interval_secs: u64,
    /// Retry budget applied to messages published without one.
    pub max_retries: u32,
    /// Base retry delay in milliseconds; the n-th retry waits n times this.
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single retry delay.
    pub retry_max_delay_secs: u64,
    /// Whether exhausted messages are kept in the dead-letter destination.
    pub enable_dead_letter_queue: bool,
    /// Lane capacity for the in-memory backend.
    pub buffer_size: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: QueueBackendKind::default(),
            queue_name: "meetq".to_string(),
            workers: 4,
            visibility_timeout_secs: 30,
            poll_interval_ms: 100,
            scan_interval_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_secs: 60,
            enable_dead_letter_queue: true,
            buffer_size: 1000,
        }
    }
}

/// Publish/subscribe backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubBackendKind {
    /// Redis PUBLISH/SUBSCRIBE.
    #[default]
    Redis,
    /// One Kafka topic per channel.
    Kafka,
}

/// Publish/subscribe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Whether the pub/sub bus is constructed.
    pub enabled: bool,
    /// Backend selection.
    pub backend: PubSubBackendKind,
    /// Per-handler timeout in seconds.
    pub handler_timeout_secs: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: PubSubBackendKind::default(),
            handler_timeout_secs: 10,
        }
    }
}

/// Local event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Whether the plain event bus is constructed.
    pub enabled: bool,
    /// Whether the priority event bus is constructed.
    pub priority_enabled: bool,
    /// Queue capacity.
    pub buffer_size: usize,
    /// Worker count.
    pub workers: usize,
    /// Per-handler timeout in seconds.
    pub handler_timeout_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority_enabled: false,
            buffer_size: 1000,
            workers: 4,
            handler_timeout_secs: 10,
        }
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSchedulerConfig {
    /// Whether the scheduler is constructed.
    pub enabled: bool,
    /// Total lane capacity, also the result channel capacity.
    pub buffer_size: usize,
    /// Worker count.
    pub workers: usize,
    /// Whether future `scheduled_at` values are honored.
    pub enable_delayed_tasks: bool,
    /// Promoter tick in milliseconds.
    pub promote_interval_ms: u64,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 1000,
            workers: 4,
            enable_delayed_tasks: true,
            promote_interval_ms: 100,
        }
    }
}

/// Task dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskDispatcherConfig {
    /// Whether the dispatcher is constructed.
    pub enabled: bool,
    /// Whether the built-in service routes are registered.
    pub enable_routing: bool,
    /// Whether registered callbacks are invoked.
    pub enable_callbacks: bool,
}

impl Default for TaskDispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_routing: true,
            enable_callbacks: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_kafka_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_topic_prefix() -> String {
    "meetq".to_string()
}

fn default_group_id() -> String {
    "meetq-workers".to_string()
}

const fn default_partitions() -> i32 {
    3
}

const fn default_replication_factor() -> i32 {
    1
}

const fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "meetq=debug".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `MEETQ_ENV`)
    /// 3. Environment variables with `MEETQ__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("MEETQ_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("MEETQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MEETQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml(source: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
