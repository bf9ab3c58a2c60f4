//! Session-scoped front end to the [`TaskDispatcher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use meetq_common::IdGenerator;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::dispatcher::TaskDispatcher;
use crate::error::{QueueError, QueueResult};
use crate::handler::Handler;
use crate::model::{Payload, Priority, Stats, TaskRequest, TaskType};

/// Task kinds a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ClientTaskType {
    #[serde(rename = "ai.speech_recognition")]
    AiSpeechRecognition,
    #[serde(rename = "ai.emotion_detection")]
    AiEmotionDetection,
    #[serde(rename = "ai.synthesis_detection")]
    AiSynthesisDetection,
    #[serde(rename = "ai.audio_denoising")]
    AiAudioDenoising,
    #[serde(rename = "ai.video_enhancement")]
    AiVideoEnhancement,
    #[serde(rename = "media.start")]
    MediaStart,
    #[serde(rename = "media.stop")]
    MediaStop,
    #[serde(rename = "media.record")]
    MediaRecord,
    #[serde(rename = "media.screen_share")]
    MediaScreenShare,
    #[serde(rename = "meeting.join")]
    MeetingJoin,
    #[serde(rename = "meeting.leave")]
    MeetingLeave,
    #[serde(rename = "meeting.mute")]
    MeetingMute,
    #[serde(rename = "meeting.unmute")]
    MeetingUnmute,
    #[serde(rename = "meeting.kick_user")]
    MeetingKickUser,
    #[serde(rename = "chat.send")]
    ChatSend,
    #[serde(rename = "chat.history")]
    ChatHistory,
}

impl ClientTaskType {
    /// Dispatcher type serving this client request.
    #[must_use]
    pub const fn task_type(self) -> TaskType {
        match self {
            Self::AiSpeechRecognition => TaskType::SpeechRecognition,
            Self::AiEmotionDetection => TaskType::EmotionDetection,
            Self::AiSynthesisDetection => TaskType::SynthesisDetection,
            Self::AiAudioDenoising => TaskType::AudioDenoising,
            Self::AiVideoEnhancement => TaskType::VideoEnhancement,
            Self::MediaStart | Self::MediaStop | Self::MediaRecord | Self::MediaScreenShare => {
                TaskType::MediaProcessing
            }
            Self::MeetingJoin
            | Self::MeetingLeave
            | Self::MeetingMute
            | Self::MeetingUnmute
            | Self::MeetingKickUser => TaskType::MeetingControl,
            Self::ChatSend | Self::ChatHistory => TaskType::Signaling,
        }
    }
}

/// Request as sent by a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTaskRequest {
    /// Request id, assigned on submission when empty.
    #[serde(default)]
    pub request_id: String,
    /// Requested operation.
    #[serde(rename = "type")]
    pub task_type: ClientTaskType,
    /// Issuing session; must be registered.
    pub session_id: String,
    /// Request data.
    #[serde(default)]
    pub data: Payload,
    /// Delivery tier.
    #[serde(default)]
    pub priority: Priority,
    /// Deadline in seconds.
    #[serde(default)]
    pub timeout: u64,
    /// Submission time, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl ClientTaskRequest {
    /// Create a request for `session_id`.
    #[must_use]
    pub fn new(task_type: ClientTaskType, session_id: impl Into<String>, data: Payload) -> Self {
        Self {
            request_id: String::new(),
            task_type,
            session_id: session_id.into(),
            data,
            priority: Priority::Normal,
            timeout: 0,
            timestamp: 0,
        }
    }
}

/// Outcome reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ClientTaskStatus {
    Success,
    Error,
}

/// Answer to a [`ClientTaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTaskResponse {
    /// Id of the answered request.
    pub request_id: String,
    /// Overall outcome.
    pub status: ClientTaskStatus,
    /// Result data.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: Payload,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time, unix seconds.
    pub processed_at: i64,
}

/// Connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ClientSession {
    pub session_id: String,
    pub user_id: u64,
    pub meeting_id: u64,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ClientCounters {
    requests: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    dispatcher: TaskDispatcher,
    sessions: RwLock<HashMap<String, ClientSession>>,
    counters: ClientCounters,
    id_gen: IdGenerator,
}

/// Validates client sessions and forwards their requests to the dispatcher.
#[derive(Clone)]
pub struct ClientTaskManager {
    inner: Arc<Inner>,
}

impl ClientTaskManager {
    /// Wrap `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                sessions: RwLock::new(HashMap::new()),
                counters: ClientCounters::default(),
                id_gen: IdGenerator::new(),
            }),
        }
    }

    /// Register or replace a session.
    pub async fn register_session(&self, session_id: impl Into<String>, user_id: u64, meeting_id: u64) {
        let session_id = session_id.into();
        let now = Utc::now();
        debug!(session_id = %session_id, user_id, meeting_id, "Client session registered");
        self.inner.sessions.write().await.insert(
            session_id.clone(),
            ClientSession {
                session_id,
                user_id,
                meeting_id,
                connected_at: now,
                last_active: now,
            },
        );
    }

    /// Register a session under a fresh UUID v7 id and return the id.
    pub async fn open_session(&self, user_id: u64, meeting_id: u64) -> String {
        let session_id = self.inner.id_gen.generate_uuid_v7();
        self.register_session(session_id.clone(), user_id, meeting_id).await;
        session_id
    }

    /// Forget a session.
    pub async fn unregister_session(&self, session_id: &str) -> Option<ClientSession> {
        self.inner.sessions.write().await.remove(session_id)
    }

    /// Registered session by id.
    pub async fn session(&self, session_id: &str) -> Option<ClientSession> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    /// Dispatch a client request on behalf of its session.
    ///
    /// Unknown sessions are rejected with [`QueueError::NotFound`]. Dispatch
    /// failures are reported in the response with [`ClientTaskStatus::Error`].
    pub async fn submit_task(&self, mut request: ClientTaskRequest) -> QueueResult<ClientTaskResponse> {
        let session = self
            .session(&request.session_id)
            .await
            .ok_or_else(|| QueueError::NotFound(format!("session {}", request.session_id)))?;

        if request.request_id.is_empty() {
            request.request_id = self.inner.id_gen.generate();
        }
        if request.timestamp == 0 {
            request.timestamp = Utc::now().timestamp();
        }

        let mut task = TaskRequest::new(request.task_type.task_type(), request.data);
        task.task_id = request.request_id.clone();
        task.priority = request.priority;
        task.user_id = session.user_id;
        task.meeting_id = session.meeting_id;
        task.session_id = request.session_id.clone();
        task.timeout = request.timeout;
        task.created_at = Utc::now().timestamp();

        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        match self.inner.dispatcher.dispatch_task(task).await {
            Ok(response) => {
                self.inner.counters.success.fetch_add(1, Ordering::Relaxed);
                if let Some(session) = self.inner.sessions.write().await.get_mut(&request.session_id) {
                    session.last_active = Utc::now();
                }
                Ok(ClientTaskResponse {
                    request_id: request.request_id,
                    status: ClientTaskStatus::Success,
                    data: response.result,
                    error: None,
                    processed_at: response.processed_at,
                })
            }
            Err(e) => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %request.request_id, error = %e, "Client task failed");
                Ok(ClientTaskResponse {
                    request_id: request.request_id,
                    status: ClientTaskStatus::Error,
                    data: Payload::new(),
                    error: Some(e.to_string()),
                    processed_at: Utc::now().timestamp(),
                })
            }
        }
    }

    /// Submit, then hand the response to `callback` on a spawned task.
    pub async fn submit_task_async<H>(&self, request: ClientTaskRequest, callback: H) -> QueueResult<()>
    where
        H: Handler<ClientTaskResponse> + 'static,
    {
        let response = self.submit_task(request).await?;
        tokio::spawn(async move {
            let request_id = response.request_id.clone();
            if let Err(e) = callback.handle(response).await {
                warn!(request_id = %request_id, error = %e, "Client callback failed");
            }
        });
        Ok(())
    }

    /// Request counters and session count.
    pub async fn stats(&self) -> Stats {
        let c = &self.inner.counters;
        let mut stats = Stats::new();
        stats.insert("total_requests".into(), c.requests.load(Ordering::Relaxed).into());
        stats.insert("total_success".into(), c.success.load(Ordering::Relaxed).into());
        stats.insert("total_failed".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("active_sessions".into(), self.inner.sessions.read().await.len().into());
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use meetq_common::TaskDispatcherConfig;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::handler::HandlerError;

    async fn manager() -> ClientTaskManager {
        ClientTaskManager::new(TaskDispatcher::new(&TaskDispatcherConfig::default()).await)
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(ClientTaskType::AiAudioDenoising.task_type(), TaskType::AudioDenoising);
        assert_eq!(ClientTaskType::MediaScreenShare.task_type(), TaskType::MediaProcessing);
        assert_eq!(ClientTaskType::MeetingKickUser.task_type(), TaskType::MeetingControl);
        assert_eq!(ClientTaskType::ChatHistory.task_type(), TaskType::Signaling);
    }

    #[test]
    fn test_request_wire_format() {
        let request: ClientTaskRequest = serde_json::from_value(json!({
            "type": "meeting.mute",
            "session_id": "sess-1",
            "data": {"target_user": 7}
        }))
        .unwrap();
        assert_eq!(request.task_type, ClientTaskType::MeetingMute);
        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.data["target_user"], 7);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let clients = manager().await;
        let err = clients
            .submit_task(ClientTaskRequest::new(ClientTaskType::ChatSend, "ghost", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        assert_eq!(clients.stats().await["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_submit_for_session() {
        let clients = manager().await;
        clients.register_session("sess-1", 42, 9).await;

        let mut data = Payload::new();
        data.insert("text".into(), json!("hello"));
        let response = clients
            .submit_task(ClientTaskRequest::new(ClientTaskType::ChatSend, "sess-1", data.clone()))
            .await
            .unwrap();

        assert_eq!(response.status, ClientTaskStatus::Success);
        assert_eq!(response.data, data);
        assert!(!response.request_id.is_empty());

        let stats = clients.stats().await;
        assert_eq!(stats["total_success"], 1);
        assert_eq!(stats["active_sessions"], 1);
    }

    #[tokio::test]
    async fn test_open_session_assigns_id() {
        let clients = manager().await;
        let first = clients.open_session(42, 9).await;
        let second = clients.open_session(43, 9).await;

        assert_eq!(first.len(), 36);
        assert_ne!(first, second);
        let session = clients.session(&first).await.unwrap();
        assert_eq!(session.user_id, 42);
        assert_eq!(session.meeting_id, 9);
        assert_eq!(clients.stats().await["active_sessions"], 2);
    }

    #[tokio::test]
    async fn test_dispatch_failure_reported_as_error() {
        let dispatcher = TaskDispatcher::new(&TaskDispatcherConfig::default()).await;
        dispatcher.remove_route(TaskType::Signaling).await;
        let clients = ClientTaskManager::new(dispatcher);
        clients.register_session("sess-1", 1, 1).await;

        let response = clients
            .submit_task(ClientTaskRequest::new(ClientTaskType::ChatSend, "sess-1", Payload::new()))
            .await
            .unwrap();
        assert_eq!(response.status, ClientTaskStatus::Error);
        assert!(response.error.unwrap().contains("signaling"));
        assert_eq!(clients.stats().await["total_failed"], 1);
    }

    #[tokio::test]
    async fn test_async_submit_and_unregister() {
        let clients = manager().await;
        clients.register_session("sess-1", 1, 1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        clients
            .submit_task_async(
                ClientTaskRequest::new(ClientTaskType::MediaRecord, "sess-1", Payload::new()),
                move |response: ClientTaskResponse| {
                    let tx = tx.clone();
                    async move {
                        tx.send(response.status).ok();
                        Ok::<(), HandlerError>(())
                    }
                },
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), ClientTaskStatus::Success);

        assert!(clients.unregister_session("sess-1").await.is_some());
        assert_eq!(clients.stats().await["active_sessions"], 0);
    }
}
