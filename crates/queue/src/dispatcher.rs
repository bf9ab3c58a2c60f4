//! Route-table dispatcher for typed task requests.
//!
//! The dispatcher resolves a [`TaskRequest`] to the [`ServiceRoute`] owning
//! its type, records the request and answers with a completed
//! [`TaskResponse`] echoing the payload. Delivery to the routed service is
//! left to the service's own queue consumer; the route is only logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use meetq_common::{IdGenerator, TaskDispatcherConfig, Timer, get_metrics};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, SharedHandler};
use crate::model::{ServiceRoute, Stats, TaskRequest, TaskResponse, TaskStatus, TaskType};

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    config: TaskDispatcherConfig,
    routes: RwLock<HashMap<TaskType, Arc<ServiceRoute>>>,
    tasks: RwLock<HashMap<String, (TaskRequest, TaskStatus)>>,
    callbacks: RwLock<HashMap<String, SharedHandler<TaskResponse>>>,
    counters: DispatchCounters,
    id_gen: IdGenerator,
}

/// Resolves task requests to owning services.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

impl TaskDispatcher {
    /// Create a dispatcher; routing enabled installs [`ServiceRoute::defaults`].
    pub async fn new(config: &TaskDispatcherConfig) -> Self {
        let dispatcher = Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                routes: RwLock::new(HashMap::new()),
                tasks: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(HashMap::new()),
                counters: DispatchCounters::default(),
                id_gen: IdGenerator::new(),
            }),
        };
        if config.enable_routing {
            for route in ServiceRoute::defaults() {
                dispatcher.register_route(route).await;
            }
        }
        dispatcher
    }

    /// Point every type in `route` at it, replacing earlier owners.
    pub async fn register_route(&self, route: ServiceRoute) {
        let route = Arc::new(route);
        let mut routes = self.inner.routes.write().await;
        for task_type in &route.task_types {
            routes.insert(*task_type, Arc::clone(&route));
        }
        debug!(service = %route.service_name, queue = %route.queue_name, "Registered route");
    }

    /// Forget the route for one type.
    pub async fn remove_route(&self, task_type: TaskType) -> Option<ServiceRoute> {
        self.inner
            .routes
            .write()
            .await
            .remove(&task_type)
            .map(|route| (*route).clone())
    }

    /// Current type-to-route table.
    pub async fn routes(&self) -> HashMap<TaskType, ServiceRoute> {
        self.inner
            .routes
            .read()
            .await
            .iter()
            .map(|(task_type, route)| (*task_type, (**route).clone()))
            .collect()
    }

    /// Route and record `request`, then replay the response to its callback.
    pub async fn dispatch_task(&self, mut request: TaskRequest) -> QueueResult<TaskResponse> {
        let timer = Timer::start();
        let route = self.inner.routes.read().await.get(&request.task_type).cloned();
        let Some(route) = route else {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(task_type = %request.task_type, "No route for task type");
            return Err(QueueError::Unroutable(request.task_type.to_string()));
        };

        if request.task_id.is_empty() {
            request.task_id = self.inner.id_gen.generate();
        }
        if request.created_at == 0 {
            request.created_at = Utc::now().timestamp();
        }

        info!(
            task_id = %request.task_id,
            task_type = %request.task_type,
            service = %route.service_name,
            queue = %route.queue_name,
            "Dispatching task"
        );

        let response = TaskResponse {
            task_id: request.task_id.clone(),
            status: TaskStatus::Completed,
            result: request.payload.clone(),
            error: None,
            processed_at: Utc::now().timestamp(),
            duration: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        self.inner
            .tasks
            .write()
            .await
            .insert(request.task_id.clone(), (request, TaskStatus::Completed));

        self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.completed.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_task_dispatched();

        if self.inner.config.enable_callbacks {
            let callback = self.inner.callbacks.write().await.remove(&response.task_id);
            if let Some(callback) = callback
                && let Err(e) = callback.handle(response.clone()).await
            {
                warn!(task_id = %response.task_id, error = %e, "Task callback failed");
            }
        }

        Ok(response)
    }

    /// Dispatch now and run `callback` on a spawned task.
    ///
    /// Routing errors are returned directly and the callback is not run.
    pub async fn dispatch_task_async<H>(&self, request: TaskRequest, callback: H) -> QueueResult<()>
    where
        H: Handler<TaskResponse> + 'static,
    {
        let response = self.dispatch_task(request).await?;
        tokio::spawn(async move {
            let task_id = response.task_id.clone();
            if let Err(e) = callback.handle(response).await {
                warn!(task_id = %task_id, error = %e, "Task callback failed");
            }
        });
        Ok(())
    }

    /// Dispatch in order, stopping at the first error.
    pub async fn dispatch_batch_tasks(&self, requests: Vec<TaskRequest>) -> QueueResult<Vec<TaskResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.dispatch_task(request).await?);
        }
        Ok(responses)
    }

    /// Stored request and status for `task_id`.
    pub async fn task_status(&self, task_id: &str) -> QueueResult<(TaskRequest, TaskStatus)> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("task {task_id}")))
    }

    /// Mark a known task cancelled.
    pub async fn cancel_task(&self, task_id: &str) -> QueueResult<()> {
        let mut tasks = self.inner.tasks.write().await;
        let Some((_, status)) = tasks.get_mut(task_id) else {
            return Err(QueueError::NotFound(format!("task {task_id}")));
        };
        *status = TaskStatus::Cancelled;
        debug!(task_id, "Task cancelled");
        Ok(())
    }

    /// Run `callback` with the response when `task_id` is next dispatched.
    pub async fn register_callback<H>(&self, task_id: impl Into<String>, callback: H)
    where
        H: Handler<TaskResponse> + 'static,
    {
        self.inner
            .callbacks
            .write()
            .await
            .insert(task_id.into(), Arc::new(callback));
    }

    /// Log readiness. The dispatcher owns no background work.
    pub async fn start(&self) {
        info!(routes = self.inner.routes.read().await.len(), "Task dispatcher started");
    }

    /// Log shutdown.
    pub async fn stop(&self) {
        info!("Task dispatcher stopped");
    }

    /// Dispatch counters and table sizes.
    pub async fn stats(&self) -> Stats {
        let c = &self.inner.counters;
        let mut stats = Stats::new();
        stats.insert("total_dispatched".into(), c.dispatched.load(Ordering::Relaxed).into());
        stats.insert("total_completed".into(), c.completed.load(Ordering::Relaxed).into());
        stats.insert("total_failed".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("route_count".into(), self.inner.routes.read().await.len().into());
        stats.insert("stored_tasks".into(), self.inner.tasks.read().await.len().into());
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::handler::HandlerError;
    use crate::model::Payload;

    fn config() -> TaskDispatcherConfig {
        TaskDispatcherConfig {
            enabled: true,
            enable_routing: true,
            enable_callbacks: true,
        }
    }

    fn payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("audio_url".into(), json!("s3://rec/1.wav"));
        payload
    }

    #[tokio::test]
    async fn test_dispatch_echoes_payload() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        let response = dispatcher
            .dispatch_task(TaskRequest::new(TaskType::SpeechRecognition, payload()))
            .await
            .unwrap();

        assert!(!response.task_id.is_empty());
        assert_eq!(response.status, TaskStatus::Completed);
        assert_eq!(response.result, payload());

        let (request, status) = dispatcher.task_status(&response.task_id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert!(request.created_at > 0);
    }

    #[tokio::test]
    async fn test_unroutable_stores_nothing() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        dispatcher.remove_route(TaskType::Recording).await.unwrap();

        let err = dispatcher
            .dispatch_task(TaskRequest::new(TaskType::Recording, payload()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unroutable(t) if t == "recording"));

        let stats = dispatcher.stats().await;
        assert_eq!(stats["stored_tasks"], 0);
        assert_eq!(stats["total_failed"], 1);
    }

    #[tokio::test]
    async fn test_routing_disabled_has_no_routes() {
        let dispatcher = TaskDispatcher::new(&TaskDispatcherConfig {
            enable_routing: false,
            ..config()
        })
        .await;
        assert!(dispatcher.routes().await.is_empty());

        dispatcher
            .register_route(ServiceRoute::new("asr", "asr_tasks", vec![TaskType::SpeechRecognition]))
            .await;
        let routes = dispatcher.routes().await;
        assert_eq!(routes[&TaskType::SpeechRecognition].service_name, "asr");
    }

    #[tokio::test]
    async fn test_reregistering_overwrites_owner() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        dispatcher
            .register_route(ServiceRoute::new("edge-ai", "edge_tasks", vec![TaskType::TextToSpeech]))
            .await;
        let routes = dispatcher.routes().await;
        assert_eq!(routes[&TaskType::TextToSpeech].service_name, "edge-ai");
        assert_eq!(routes[&TaskType::SpeechRecognition].service_name, "ai-service");
    }

    #[tokio::test]
    async fn test_registered_callback_receives_response() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .register_callback("req-1", move |response: TaskResponse| {
                let tx = tx.clone();
                async move {
                    tx.send(response.task_id).ok();
                    Ok::<(), HandlerError>(())
                }
            })
            .await;

        let mut request = TaskRequest::new(TaskType::Signaling, Payload::new());
        request.task_id = "req-1".into();
        dispatcher.dispatch_task(request).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "req-1");
    }

    #[tokio::test]
    async fn test_async_dispatch_runs_callback() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .dispatch_task_async(
                TaskRequest::new(TaskType::MeetingControl, payload()),
                move |response: TaskResponse| {
                    let tx = tx.clone();
                    async move {
                        tx.send(response.status).ok();
                        Ok::<(), HandlerError>(())
                    }
                },
            )
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_error() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        dispatcher.remove_route(TaskType::Recording).await;

        let result = dispatcher
            .dispatch_batch_tasks(vec![
                TaskRequest::new(TaskType::Signaling, Payload::new()),
                TaskRequest::new(TaskType::Recording, Payload::new()),
                TaskRequest::new(TaskType::Signaling, Payload::new()),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(dispatcher.stats().await["total_dispatched"], 1);
    }

    #[tokio::test]
    async fn test_cancel_known_task() {
        let dispatcher = TaskDispatcher::new(&config()).await;
        let response = dispatcher
            .dispatch_task(TaskRequest::new(TaskType::Recording, Payload::new()))
            .await
            .unwrap();

        dispatcher.cancel_task(&response.task_id).await.unwrap();
        let (_, status) = dispatcher.task_status(&response.task_id).await.unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(matches!(
            dispatcher.cancel_task("missing").await,
            Err(QueueError::NotFound(_))
        ));
    }
}
