//! Process-wide metrics for meetq.
//!
//! Every queue component reports into one shared [`Metrics`] instance so
//! that a process can export a single view regardless of which components
//! it enabled. Per-component statistics live with the components.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Initialize global metrics with custom instance.
pub fn init_metrics(metrics: Arc<Metrics>) -> Result<(), Arc<Metrics>> {
    METRICS.set(metrics)
}

/// Application metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Durable Queue ===
    /// Messages accepted by a durable queue
    pub messages_published: AtomicU64,
    /// Messages whose handler succeeded
    pub messages_processed: AtomicU64,
    /// Failed handler invocations
    pub messages_failed: AtomicU64,
    /// Messages re-enqueued for another attempt
    pub messages_retried: AtomicU64,
    /// Messages moved to a dead-letter destination
    pub messages_dead_lettered: AtomicU64,
    /// Total handler time in microseconds
    pub message_handle_time_us_total: AtomicU64,

    // === Pub/Sub ===
    /// Pub/sub messages published
    pub pubsub_published: AtomicU64,
    /// Pub/sub messages received from the broker
    pub pubsub_received: AtomicU64,

    // === Local Events ===
    /// Events accepted by a local bus
    pub events_emitted: AtomicU64,
    /// Events dropped because a bus was full
    pub events_dropped: AtomicU64,

    // === Tasks ===
    /// Tasks submitted to the scheduler
    pub tasks_submitted: AtomicU64,
    /// Tasks completed by the scheduler
    pub tasks_completed: AtomicU64,
    /// Tasks that exhausted their retries
    pub tasks_failed: AtomicU64,
    /// Requests accepted by the dispatcher
    pub tasks_dispatched: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages_published: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_retried: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            message_handle_time_us_total: AtomicU64::new(0),

            pubsub_published: AtomicU64::new(0),
            pubsub_received: AtomicU64::new(0),

            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),

            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
        }
    }

    /// Record messages accepted by a durable queue.
    pub fn record_published(&self, count: u64) {
        self.messages_published.fetch_add(count, Ordering::Relaxed);
    }

    /// Record one handler invocation.
    pub fn record_handled(&self, duration: Duration, success: bool) {
        self.message_handle_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if success {
            self.messages_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a retry.
    pub fn record_retried(&self) {
        self.messages_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead-letter write.
    pub fn record_dead_lettered(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pub/sub publish.
    pub fn record_pubsub_published(&self, count: u64) {
        self.pubsub_published.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a pub/sub delivery from the broker.
    pub fn record_pubsub_received(&self) {
        self.pubsub_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a local event emit attempt.
    pub fn record_event(&self, accepted: bool) {
        if accepted {
            self.events_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a scheduler submission.
    pub fn record_task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal scheduler outcome.
    pub fn record_task_finished(&self, success: bool) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a dispatcher admission.
    pub fn record_task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            message_handle_avg_time_us: self.average_handle_time_us(),

            pubsub_published: self.pubsub_published.load(Ordering::Relaxed),
            pubsub_received: self.pubsub_received.load(Ordering::Relaxed),

            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),

            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
        }
    }

    /// Calculate average handler time over all invocations.
    fn average_handle_time_us(&self) -> u64 {
        let total = self.message_handle_time_us_total.load(Ordering::Relaxed);
        let count = self.messages_processed.load(Ordering::Relaxed)
            + self.messages_failed.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    // Durable queue
    pub messages_published: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub message_handle_avg_time_us: u64,

    // Pub/Sub
    pub pubsub_published: u64,
    pub pubsub_received: u64,

    // Local events
    pub events_emitted: u64,
    pub events_dropped: u64,

    // Tasks
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_dispatched: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.messages_published.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.events_dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_handled() {
        let metrics = Metrics::new();

        metrics.record_handled(Duration::from_micros(100), true);
        metrics.record_handled(Duration::from_micros(300), false);

        assert_eq!(metrics.messages_processed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.messages_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.average_handle_time_us(), 200);
    }

    #[test]
    fn test_average_handle_time_empty() {
        let metrics = Metrics::new();
        assert_eq!(metrics.average_handle_time_us(), 0);
    }

    #[test]
    fn test_record_event() {
        let metrics = Metrics::new();

        metrics.record_event(true);
        metrics.record_event(true);
        metrics.record_event(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_emitted, 2);
        assert_eq!(snapshot.events_dropped, 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.record_published(10);
        metrics.record_retried();
        metrics.record_dead_lettered();
        metrics.record_task_finished(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 10);
        assert_eq!(snapshot.messages_retried, 1);
        assert_eq!(snapshot.messages_dead_lettered, 1);
        assert_eq!(snapshot.tasks_failed, 1);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
    }
}
