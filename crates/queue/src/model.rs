//! Wire and in-process data types shared by every queue component.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary JSON payload keyed by field name.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Component statistics, keyed by counter name.
pub type Stats = serde_json::Map<String, serde_json::Value>;

/// Delivery preference tier.
///
/// Serialized as its ordinal (`0` = low ... `3` = critical).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Background work.
    Low = 0,
    /// Default tier.
    #[default]
    Normal = 1,
    /// Latency-sensitive work.
    High = 2,
    /// Drained before anything else.
    Critical = 3,
}

impl Priority {
    /// Tiers in the order workers drain them.
    pub const DRAIN_ORDER: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Lower-case name, used in Redis keys and statistics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Position in [`Self::DRAIN_ORDER`].
    #[must_use]
    pub const fn drain_index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as Self
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Critical),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Durable work item carried by the message queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, assigned at publish time when empty.
    #[serde(default)]
    pub id: String,
    /// Discriminator used for handler lookup.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Delivery tier.
    #[serde(default)]
    pub priority: Priority,
    /// Application data.
    #[serde(default)]
    pub payload: Payload,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget.
    #[serde(default)]
    pub max_retries: u32,
    /// Handler deadline in seconds.
    #[serde(default)]
    pub timeout: u64,
    /// Producing service.
    #[serde(default)]
    pub source: String,
    /// Intended consumer, informational.
    #[serde(default)]
    pub destination: String,
    /// Set each time a worker dequeues the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_start_time: Option<i64>,
    /// Seconds the message may stay in processing before it is recovered.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub visibility_timeout: u64,
    /// Dead-letter destination name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dead_letter_queue: String,
    /// Error that sent the message to the dead-letter destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the message was dead-lettered, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

impl Message {
    /// Create a message of the given type. Remaining fields are filled at publish time.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: String::new(),
            message_type: message_type.into(),
            priority: Priority::Normal,
            payload,
            timestamp: 0,
            retry_count: 0,
            max_retries: 0,
            timeout: 0,
            source: String::new(),
            destination: String::new(),
            processing_start_time: None,
            visibility_timeout: 0,
            dead_letter_queue: String::new(),
            last_error: None,
            failed_at: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the handler deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs();
        self
    }

    /// Set the producing service.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the intended consumer.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Handler deadline as a [`Duration`].
    #[must_use]
    pub const fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Attach the failure annotation written with dead-lettered messages.
    pub fn mark_dead_lettered(&mut self, error: impl Into<String>) {
        self.processing_start_time = None;
        self.last_error = Some(error.into());
        self.failed_at = Some(Utc::now().timestamp());
    }

    /// Reset to a fresh attempt, as done when dead letters are requeued.
    pub fn reset_for_requeue(&mut self) {
        self.retry_count = 0;
        self.processing_start_time = None;
        self.last_error = None;
        self.failed_at = None;
    }
}

/// Best-effort fan-out message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubMessage {
    /// Unique id, assigned at publish time when empty.
    #[serde(default)]
    pub id: String,
    /// Event type; also the Kafka record key.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Application data.
    #[serde(default)]
    pub payload: Payload,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Producing service.
    #[serde(default)]
    pub source: String,
}

impl PubSubMessage {
    /// Create a message of the given type.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: String::new(),
            message_type: message_type.into(),
            payload,
            timestamp: 0,
            source: String::new(),
        }
    }

    /// Set the producing service.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// In-process event delivered by the local event buses.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEvent {
    /// Event type used for handler lookup.
    pub event_type: String,
    /// Application data.
    pub payload: Payload,
    /// Emit time.
    pub timestamp: DateTime<Utc>,
    /// Emitting component.
    pub source: String,
    /// Drain tier on the priority bus; ignored by the plain bus.
    pub priority: Priority,
}

impl LocalEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Payload, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            priority: Priority::Normal,
        }
    }
}

/// Lifecycle state shared by scheduler tasks and dispatched requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, waiting for a worker or for its scheduled time.
    Pending,
    /// A handler is running.
    Processing,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Cancelled while active.
    Cancelled,
}

impl TaskStatus {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a dispatched request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum TaskType {
    SpeechRecognition,
    EmotionDetection,
    SynthesisDetection,
    AudioDenoising,
    VideoEnhancement,
    TextToSpeech,
    MediaProcessing,
    StreamControl,
    Recording,
    MeetingControl,
    UserManagement,
    Signaling,
    WebrtcNegotiation,
}

impl TaskType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpeechRecognition => "speech_recognition",
            Self::EmotionDetection => "emotion_detection",
            Self::SynthesisDetection => "synthesis_detection",
            Self::AudioDenoising => "audio_denoising",
            Self::VideoEnhancement => "video_enhancement",
            Self::TextToSpeech => "text_to_speech",
            Self::MediaProcessing => "media_processing",
            Self::StreamControl => "stream_control",
            Self::Recording => "recording",
            Self::MeetingControl => "meeting_control",
            Self::UserManagement => "user_management",
            Self::Signaling => "signaling",
            Self::WebrtcNegotiation => "webrtc_negotiation",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing envelope accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Request id, assigned at dispatch when empty.
    #[serde(default)]
    pub task_id: String,
    /// Kind of work; selects the route.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Delivery tier.
    #[serde(default)]
    pub priority: Priority,
    /// Acting user.
    #[serde(default)]
    pub user_id: u64,
    /// Meeting the work belongs to.
    #[serde(default)]
    pub meeting_id: u64,
    /// Client session that issued the request.
    #[serde(default)]
    pub session_id: String,
    /// Application data.
    #[serde(default)]
    pub payload: Payload,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Deadline in seconds.
    #[serde(default)]
    pub timeout: u64,
    /// Retry budget.
    #[serde(default)]
    pub max_retries: u32,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub created_at: i64,
}

impl TaskRequest {
    /// Create a request of the given type.
    #[must_use]
    pub fn new(task_type: TaskType, payload: Payload) -> Self {
        Self {
            task_id: String::new(),
            task_type,
            priority: Priority::Normal,
            user_id: 0,
            meeting_id: 0,
            session_id: String::new(),
            payload,
            metadata: BTreeMap::new(),
            timeout: 0,
            max_retries: 0,
            created_at: 0,
        }
    }
}

/// Dispatcher answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Id of the answered request.
    pub task_id: String,
    /// Resulting status.
    pub status: TaskStatus,
    /// Result data.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub result: Payload,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time, unix seconds.
    pub processed_at: i64,
    /// Processing time in milliseconds.
    pub duration: u64,
}

/// Owner of a set of task types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoute {
    /// Logical service name.
    pub service_name: String,
    /// Queue the service consumes.
    pub queue_name: String,
    /// Types routed to the service.
    pub task_types: Vec<TaskType>,
}

impl ServiceRoute {
    /// Create a route.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        queue_name: impl Into<String>,
        task_types: Vec<TaskType>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            queue_name: queue_name.into(),
            task_types,
        }
    }

    /// Routes registered by a dispatcher with routing enabled.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "ai-service",
                "ai_tasks",
                vec![
                    TaskType::SpeechRecognition,
                    TaskType::EmotionDetection,
                    TaskType::SynthesisDetection,
                    TaskType::AudioDenoising,
                    TaskType::VideoEnhancement,
                    TaskType::TextToSpeech,
                ],
            ),
            Self::new(
                "media-service",
                "media_tasks",
                vec![
                    TaskType::MediaProcessing,
                    TaskType::StreamControl,
                    TaskType::Recording,
                ],
            ),
            Self::new(
                "meeting-service",
                "meeting_tasks",
                vec![TaskType::MeetingControl, TaskType::UserManagement],
            ),
            Self::new(
                "signaling-service",
                "signaling_tasks",
                vec![TaskType::Signaling, TaskType::WebrtcNegotiation],
            ),
        ]
    }
}
