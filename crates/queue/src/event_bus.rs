//! In-process event buses.
//!
//! [`LocalEventBus`] drains one bounded queue; [`PriorityEventBus`] drains
//! four priority lanes in strict order. Events are never retried: a full
//! bus drops the event and reports [`QueueError::Full`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use meetq_common::{EventBusConfig, Timer, get_metrics};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, SharedHandler, fan_out};
use crate::lanes::{LaneReceivers, LaneSenders, lanes, next_item};
use crate::lifecycle::{ShutdownListener, WorkerPool};
use crate::model::{LocalEvent, Payload, Priority, Stats};

/// Dispatches slower than this are logged as warnings.
const SLOW_DISPATCH: Duration = Duration::from_millis(100);

/// Event bus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusOptions {
    /// Queue capacity (split across lanes on the priority bus).
    pub buffer_size: usize,
    /// Concurrent workers.
    pub workers: usize,
    /// Deadline for each handler.
    pub handler_timeout: Duration,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            workers: 4,
            handler_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&EventBusConfig> for EventBusOptions {
    fn from(config: &EventBusConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            workers: config.workers.max(1),
            handler_timeout: Duration::from_secs(config.handler_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct BusCore {
    name: &'static str,
    options: EventBusOptions,
    handlers: RwLock<HashMap<String, Vec<SharedHandler<LocalEvent>>>>,
    counters: BusCounters,
    pool: WorkerPool,
    stopped: AtomicBool,
}

impl BusCore {
    fn new(name: &'static str, options: EventBusOptions) -> Self {
        Self {
            name,
            options,
            handlers: RwLock::new(HashMap::new()),
            counters: BusCounters::default(),
            pool: WorkerPool::new(name),
            stopped: AtomicBool::new(false),
        }
    }

    async fn on(&self, event_type: String, handler: SharedHandler<LocalEvent>) {
        debug!(bus = self.name, event_type = %event_type, "Registered event handler");
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Count an emit attempt; fails once the bus has been stopped.
    fn admit(&self) -> QueueResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped(self.name));
        }
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn record_rejected<T>(&self, err: &TrySendError<T>) -> QueueError {
        match err {
            TrySendError::Full(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                get_metrics().record_event(false);
                QueueError::Full(self.name)
            }
            TrySendError::Closed(_) => QueueError::Stopped(self.name),
        }
    }

    async fn dispatch(&self, event: LocalEvent, shutdown: &ShutdownListener) {
        let timer = Timer::start();
        let handlers = self
            .handlers
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(bus = self.name, event_type = %event.event_type, "No handlers for event");
            return;
        }

        let (tally, outcomes) =
            fan_out(handlers, &event, self.options.handler_timeout, shutdown).await;
        for error in outcomes.iter().filter_map(|outcome| outcome.error_text()) {
            warn!(bus = self.name, event_type = %event.event_type, error = %error, "Event handler failed");
        }
        self.counters.failed.fetch_add(tally.failed, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let elapsed = timer.elapsed();
        if elapsed > SLOW_DISPATCH {
            warn!(bus = self.name, event_type = %event.event_type, elapsed = ?elapsed, "Slow event dispatch");
        }
    }

    fn begin(&self) -> bool {
        if !self.pool.begin() {
            return false;
        }
        self.stopped.store(false, Ordering::SeqCst);
        true
    }

    async fn shutdown(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        self.pool.shutdown().await
    }

    fn counter_stats(&self, pending: usize) -> Stats {
        let c = &self.counters;
        let mut stats = Stats::new();
        stats.insert("total_events".into(), c.total.load(Ordering::Relaxed).into());
        stats.insert("processed_events".into(), c.processed.load(Ordering::Relaxed).into());
        stats.insert("failed_events".into(), c.failed.load(Ordering::Relaxed).into());
        stats.insert("dropped_events".into(), c.dropped.load(Ordering::Relaxed).into());
        stats.insert("pending_events".into(), pending.into());
        stats.insert("buffer_size".into(), self.options.buffer_size.into());
        stats
    }
}

struct LocalInner {
    core: BusCore,
    tx: mpsc::Sender<LocalEvent>,
    rx: Mutex<mpsc::Receiver<LocalEvent>>,
}

/// Bounded in-process event bus.
#[derive(Clone)]
pub struct LocalEventBus {
    inner: Arc<LocalInner>,
}

impl LocalEventBus {
    /// Create a bus; call [`Self::start`] to begin dispatching.
    #[must_use]
    pub fn new(options: EventBusOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        Self {
            inner: Arc::new(LocalInner {
                core: BusCore::new("event bus", options),
                tx,
                rx: Mutex::new(rx),
            }),
        }
    }

    /// Add a handler for `event_type`. Handlers of one type run concurrently.
    pub async fn on<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: Handler<LocalEvent> + 'static,
    {
        self.inner.core.on(event_type.into(), Arc::new(handler)).await;
    }

    /// Enqueue without waiting. A full bus drops the event.
    pub fn emit(&self, event_type: &str, payload: Payload, source: &str) -> QueueResult<()> {
        let core = &self.inner.core;
        core.admit()?;
        let event = LocalEvent::new(event_type, payload, source);
        match self.inner.tx.try_send(event) {
            Ok(()) => {
                get_metrics().record_event(true);
                Ok(())
            }
            Err(e) => {
                let err = core.record_rejected(&e);
                warn!(event_type, error = %err, "Event dropped");
                Err(err)
            }
        }
    }

    /// Enqueue, waiting for capacity. Returns [`QueueError::Stopped`] if
    /// the bus stops first; bound the wait by dropping the future.
    pub async fn emit_sync(&self, event_type: &str, payload: Payload, source: &str) -> QueueResult<()> {
        let core = &self.inner.core;
        core.admit()?;
        let event = LocalEvent::new(event_type, payload, source);
        let stopping = core.pool.listener();
        tokio::select! {
            sent = self.inner.tx.send(event) => {
                sent.map_err(|_| QueueError::Stopped(core.name))?;
                get_metrics().record_event(true);
                Ok(())
            }
            () = stopping.cancelled() => Err(QueueError::Stopped(core.name)),
        }
    }

    /// Spawn workers.
    pub async fn start(&self) {
        let core = &self.inner.core;
        if !core.begin() {
            return;
        }
        for worker_id in 0..core.options.workers {
            let bus = self.clone();
            let shutdown = core.pool.listener();
            core.pool.spawn(async move { bus.run_worker(worker_id, shutdown).await }).await;
        }
        info!(workers = core.options.workers, buffer_size = core.options.buffer_size, "Local event bus started");
    }

    /// Reject further emits and wait for workers to exit.
    pub async fn stop(&self) {
        if self.inner.core.shutdown().await {
            info!("Local event bus stopped");
        }
    }

    async fn run_worker(self, worker_id: usize, shutdown: ShutdownListener) {
        debug!(worker_id, "Event bus worker started");
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = async { self.inner.rx.lock().await.recv().await } => event,
            };
            let Some(event) = event else {
                break;
            };
            self.inner.core.dispatch(event, &shutdown).await;
        }
        debug!(worker_id, "Event bus worker stopped");
    }

    /// Events waiting for a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    /// Emit and dispatch counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.core.counter_stats(self.pending())
    }
}

struct PriorityInner {
    core: BusCore,
    senders: LaneSenders<LocalEvent>,
    receivers: Mutex<LaneReceivers<LocalEvent>>,
}

/// Event bus with four priority lanes drained Critical first.
#[derive(Clone)]
pub struct PriorityEventBus {
    inner: Arc<PriorityInner>,
}

impl PriorityEventBus {
    /// Create a bus; lane capacities are split from `options.buffer_size`.
    #[must_use]
    pub fn new(options: EventBusOptions) -> Self {
        let (senders, receivers) = lanes(options.buffer_size);
        Self {
            inner: Arc::new(PriorityInner {
                core: BusCore::new("priority event bus", options),
                senders,
                receivers: Mutex::new(receivers),
            }),
        }
    }

    /// Add a handler for `event_type`.
    pub async fn on<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: Handler<LocalEvent> + 'static,
    {
        self.inner.core.on(event_type.into(), Arc::new(handler)).await;
    }

    /// Enqueue at normal priority without waiting.
    pub fn emit(&self, event_type: &str, payload: Payload, source: &str) -> QueueResult<()> {
        self.emit_with_priority(Priority::Normal, event_type, payload, source)
    }

    /// Enqueue on the lane for `priority` without waiting.
    pub fn emit_with_priority(
        &self,
        priority: Priority,
        event_type: &str,
        payload: Payload,
        source: &str,
    ) -> QueueResult<()> {
        let core = &self.inner.core;
        core.admit()?;
        let mut event = LocalEvent::new(event_type, payload, source);
        event.priority = priority;
        match self.inner.senders.try_send(priority, event) {
            Ok(()) => {
                get_metrics().record_event(true);
                Ok(())
            }
            Err(e) => {
                let err = core.record_rejected(&e);
                warn!(event_type, priority = %priority, error = %err, "Event dropped");
                Err(err)
            }
        }
    }

    /// Enqueue on the lane for `priority`, waiting for capacity.
    pub async fn emit_sync_with_priority(
        &self,
        priority: Priority,
        event_type: &str,
        payload: Payload,
        source: &str,
    ) -> QueueResult<()> {
        let core = &self.inner.core;
        core.admit()?;
        let mut event = LocalEvent::new(event_type, payload, source);
        event.priority = priority;
        let stopping = core.pool.listener();
        tokio::select! {
            sent = self.inner.senders.send(priority, event) => {
                sent.map_err(|_| QueueError::Stopped(core.name))?;
                get_metrics().record_event(true);
                Ok(())
            }
            () = stopping.cancelled() => Err(QueueError::Stopped(core.name)),
        }
    }

    /// Spawn workers.
    pub async fn start(&self) {
        let core = &self.inner.core;
        if !core.begin() {
            return;
        }
        for worker_id in 0..core.options.workers {
            let bus = self.clone();
            let shutdown = core.pool.listener();
            core.pool.spawn(async move { bus.run_worker(worker_id, shutdown).await }).await;
        }
        info!(workers = core.options.workers, buffer_size = core.options.buffer_size, "Priority event bus started");
    }

    /// Reject further emits and wait for workers to exit.
    pub async fn stop(&self) {
        if self.inner.core.shutdown().await {
            info!("Priority event bus stopped");
        }
    }

    async fn run_worker(self, worker_id: usize, shutdown: ShutdownListener) {
        debug!(worker_id, "Priority event bus worker started");
        while let Some(event) = next_item(&self.inner.receivers, &shutdown).await {
            self.inner.core.dispatch(event, &shutdown).await;
        }
        debug!(worker_id, "Priority event bus worker stopped");
    }

    /// Emit and dispatch counters plus per-lane backlog.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let pending = self.inner.senders.pending();
        let mut stats = self.inner.core.counter_stats(pending.iter().sum());
        let by_priority: serde_json::Map<String, serde_json::Value> = Priority::DRAIN_ORDER
            .iter()
            .map(|p| (p.as_str().to_string(), json!(pending[p.drain_index()])))
            .collect();
        stats.insert("pending_by_priority".into(), by_priority.into());
        stats
    }
}
