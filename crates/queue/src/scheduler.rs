//! In-process task scheduler with priorities, delays and retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use meetq_common::{IdGenerator, TaskSchedulerConfig, Timer, get_metrics};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, Outcome, SharedHandler, invoke};
use crate::lanes::{LaneReceivers, LaneSenders, lanes, next_item};
use crate::lifecycle::{ShutdownListener, WorkerPool};
use crate::model::{Payload, Priority, Stats, TaskStatus};
use crate::retry::{RetryDecision, RetryPolicy};

/// Handler deadline for tasks submitted without one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Unit of work run by the scheduler. The handler receives a copy of the task.
#[derive(Clone)]
pub struct Task {
    /// Id, `task_{ulid}` when left empty.
    pub id: String,
    /// Free-form type used in logs.
    pub task_type: String,
    /// Lane the task runs from.
    pub priority: Priority,
    /// Application data.
    pub payload: Payload,
    /// Code to run.
    pub handler: SharedHandler<Task>,
    /// Handler deadline.
    pub timeout: Duration,
    /// Retry budget.
    pub max_retries: u32,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may run.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Last recorded status.
    pub status: TaskStatus,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("scheduled_at", &self.scheduled_at)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a task that runs `handler`.
    pub fn new<H>(task_type: impl Into<String>, payload: Payload, handler: H) -> Self
    where
        H: Handler<Self> + 'static,
    {
        Self {
            id: String::new(),
            task_type: task_type.into(),
            priority: Priority::Normal,
            payload,
            handler: Arc::new(handler),
            timeout: Duration::ZERO,
            max_retries: 0,
            retry_count: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            status: TaskStatus::Pending,
        }
    }

    /// Set the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the handler deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run no earlier than `delay` from now.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Run no earlier than `at`.
    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// Outcome record emitted for every finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// Task id.
    pub task_id: String,
    /// Final status.
    pub status: TaskStatus,
    /// Failure description.
    pub error: Option<String>,
    /// Handler run time.
    pub duration: Duration,
}

/// Scheduler sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Total lane capacity; also the result channel capacity.
    pub buffer_size: usize,
    /// Concurrent workers.
    pub workers: usize,
    /// Honour `scheduled_at` on submission.
    pub enable_delayed_tasks: bool,
    /// Delayed-set scan period.
    pub promote_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&TaskSchedulerConfig::default())
    }
}

impl From<&TaskSchedulerConfig> for SchedulerOptions {
    fn from(config: &TaskSchedulerConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            workers: config.workers.max(1),
            enable_delayed_tasks: config.enable_delayed_tasks,
            promote_interval: Duration::from_millis(config.promote_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    dropped_results: AtomicU64,
}

struct Inner {
    options: SchedulerOptions,
    retry: RetryPolicy,
    senders: LaneSenders<Task>,
    receivers: Mutex<LaneReceivers<Task>>,
    delayed: Mutex<Vec<Task>>,
    statuses: RwLock<HashMap<String, TaskStatus>>,
    active: Mutex<HashMap<String, Arc<Notify>>>,
    results_tx: mpsc::Sender<TaskResult>,
    results_rx: Mutex<mpsc::Receiver<TaskResult>>,
    counters: SchedulerCounters,
    pool: WorkerPool,
    id_gen: IdGenerator,
}

/// Priority task scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Create a scheduler; call [`Self::start`] to begin running tasks.
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        let (senders, receivers) = lanes(options.buffer_size);
        let (results_tx, results_rx) = mpsc::channel(options.buffer_size.max(1));
        Self {
            inner: Arc::new(Inner {
                options,
                retry: RetryPolicy::default(),
                senders,
                receivers: Mutex::new(receivers),
                delayed: Mutex::new(Vec::new()),
                statuses: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                results_tx,
                results_rx: Mutex::new(results_rx),
                counters: SchedulerCounters::default(),
                pool: WorkerPool::new("task_scheduler"),
                id_gen: IdGenerator::new(),
            }),
        }
    }

    /// Accept a task. Future `scheduled_at` values hold it in the delayed set.
    pub async fn submit_task(&self, mut task: Task) -> QueueResult<String> {
        if task.id.is_empty() {
            task.id = self.inner.id_gen.generate_prefixed("task");
        }
        if task.timeout.is_zero() {
            task.timeout = DEFAULT_TASK_TIMEOUT;
        }
        if !self.inner.options.enable_delayed_tasks {
            task.scheduled_at = None;
        }
        task.status = TaskStatus::Pending;
        let id = task.id.clone();

        if task.is_due(Utc::now()) {
            let priority = task.priority;
            self.inner
                .senders
                .try_send(priority, task)
                .map_err(|_| QueueError::Full("task scheduler lane"))?;
        } else {
            debug!(task_id = %id, scheduled_at = ?task.scheduled_at, "Task delayed");
            self.inner.delayed.lock().await.push(task);
        }

        self.inner.statuses.write().await.insert(id.clone(), TaskStatus::Pending);
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_task_submitted();
        Ok(id)
    }

    /// Spawn workers, the delayed-task promoter and the result logger.
    pub async fn start(&self) {
        let pool = &self.inner.pool;
        if !pool.begin() {
            return;
        }
        for worker_id in 0..self.inner.options.workers {
            let scheduler = self.clone();
            let shutdown = pool.listener();
            pool.spawn(async move { scheduler.run_worker(worker_id, shutdown).await }).await;
        }
        let scheduler = self.clone();
        let shutdown = pool.listener();
        pool.spawn(async move { scheduler.run_promoter(shutdown).await }).await;
        let scheduler = self.clone();
        let shutdown = pool.listener();
        pool.spawn(async move { scheduler.run_result_logger(shutdown).await }).await;

        info!(workers = self.inner.options.workers, "Task scheduler started");
    }

    /// Stop all loops. Tasks interrupted mid-run go back to the delayed set.
    pub async fn stop(&self) {
        if self.inner.pool.shutdown().await {
            info!("Task scheduler stopped");
        }
    }

    /// Abort a running task. Only tasks currently processing can be cancelled.
    pub async fn cancel_task(&self, task_id: &str) -> QueueResult<()> {
        let signal = self.inner.active.lock().await.get(task_id).cloned();
        let Some(signal) = signal else {
            return Err(QueueError::NotFound(format!("active task {task_id}")));
        };
        self.inner
            .statuses
            .write()
            .await
            .insert(task_id.to_string(), TaskStatus::Cancelled);
        signal.notify_one();
        info!(task_id, "Task cancellation requested");
        Ok(())
    }

    /// Last recorded status of a known task.
    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.statuses.read().await.get(task_id).copied()
    }

    async fn run_worker(self, worker_id: usize, shutdown: ShutdownListener) {
        debug!(worker_id, "Scheduler worker started");
        while let Some(task) = next_item(&self.inner.receivers, &shutdown).await {
            self.run_task(task, &shutdown).await;
        }
        debug!(worker_id, "Scheduler worker stopped");
    }

    async fn run_task(&self, mut task: Task, shutdown: &ShutdownListener) {
        let inner = &self.inner;
        let signal = Arc::new(Notify::new());
        inner.active.lock().await.insert(task.id.clone(), Arc::clone(&signal));
        inner.statuses.write().await.insert(task.id.clone(), TaskStatus::Processing);
        task.status = TaskStatus::Processing;

        let stopping = shutdown.cancelled();
        let cancelled = async move {
            tokio::select! {
                () = signal.notified() => {}
                () = stopping => {}
            }
        };

        let timer = Timer::start();
        let outcome = invoke(Arc::clone(&task.handler), task.clone(), task.timeout, cancelled).await;
        let duration = timer.elapsed();
        inner.active.lock().await.remove(&task.id);

        let (status, error) = match outcome {
            Outcome::Completed => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                get_metrics().record_task_finished(true);
                (TaskStatus::Completed, None)
            }
            Outcome::Cancelled if shutdown.is_shutdown() => {
                debug!(task_id = %task.id, "Task interrupted by shutdown, requeued");
                task.status = TaskStatus::Pending;
                inner.statuses.write().await.insert(task.id.clone(), TaskStatus::Pending);
                inner.delayed.lock().await.push(task);
                return;
            }
            Outcome::Cancelled => {
                inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                (TaskStatus::Cancelled, Some("cancelled".to_string()))
            }
            failure => {
                let error = failure.error_text().unwrap_or_default();
                warn!(task_id = %task.id, task_type = %task.task_type, error = %error, "Task failed");
                match inner.retry.next_attempt(&mut task.retry_count, task.max_retries) {
                    RetryDecision::Retry(delay) => {
                        inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                        task.scheduled_at =
                            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                        task.status = TaskStatus::Pending;
                        inner.statuses.write().await.insert(task.id.clone(), TaskStatus::Pending);
                        debug!(task_id = %task.id, retry_count = task.retry_count, "Task scheduled for retry");
                        inner.delayed.lock().await.push(task);
                        return;
                    }
                    RetryDecision::Exhausted => {
                        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                        get_metrics().record_task_finished(false);
                        (TaskStatus::Failed, Some(error))
                    }
                }
            }
        };

        inner.statuses.write().await.insert(task.id.clone(), status);
        let result = TaskResult {
            task_id: task.id,
            status,
            error,
            duration,
        };
        if inner.results_tx.try_send(result).is_err() {
            inner.counters.dropped_results.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn run_promoter(self, shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.inner.options.promote_interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let promoted = self.promote_due().await;
            if promoted > 0 {
                debug!(promoted, "Promoted delayed tasks");
            }
        }
    }

    /// Move due delayed tasks into their lanes; tasks whose lane is full stay delayed.
    async fn promote_due(&self) -> usize {
        let now = Utc::now();
        let mut delayed = self.inner.delayed.lock().await;
        let mut promoted = 0;
        let mut waiting = Vec::with_capacity(delayed.len());

        for task in delayed.drain(..) {
            if !task.is_due(now) {
                waiting.push(task);
                continue;
            }
            let priority = task.priority;
            match self.inner.senders.try_send(priority, task) {
                Ok(()) => promoted += 1,
                Err(e) => waiting.push(e.into_inner()),
            }
        }
        *delayed = waiting;
        promoted
    }

    async fn run_result_logger(self, shutdown: ShutdownListener) {
        let mut results = self.inner.results_rx.lock().await;
        loop {
            let result = tokio::select! {
                () = shutdown.cancelled() => break,
                result = results.recv() => result,
            };
            let Some(result) = result else {
                break;
            };
            match &result.error {
                None => debug!(task_id = %result.task_id, status = %result.status, duration = ?result.duration, "Task finished"),
                Some(error) => info!(task_id = %result.task_id, status = %result.status, error = %error, "Task finished"),
            }
        }
    }

    /// Task counters and backlog gauges.
    pub async fn stats(&self) -> Stats {
        let c = &self.inner.counters;
        let mut stats = Stats::new();
        stats.insert("total_tasks".into(), c.total.load(Ordering::Relaxed).into());
        stats.insert("completed_tasks".into(), c.completed.load(Ordering::Relaxed).into());
        stats.insert("failed_tasks".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("cancelled_tasks".into(), c.cancelled.load(Ordering::Relaxed).into());
        stats.insert("retried_tasks".into(), c.retried.load(Ordering::Relaxed).into());
        stats.insert("active_tasks".into(), self.inner.active.lock().await.len().into());
        stats.insert("delayed_tasks".into(), self.inner.delayed.lock().await.len().into());
        stats.insert("pending_tasks".into(), self.inner.senders.total_pending().into());
        stats.insert("dropped_results".into(), c.dropped_results.load(Ordering::Relaxed).into());
        stats
    }
}
