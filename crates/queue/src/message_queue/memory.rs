//! In-process priority queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{Disposition, QueueCore, QueueLengths, QueueOptions, wait_retry};
use crate::error::{QueueError, QueueResult};
use crate::lanes::{LaneReceivers, LaneSenders, lanes, next_item};
use crate::lifecycle::ShutdownListener;
use crate::model::{Message, Priority, Stats};

struct Inner {
    core: QueueCore,
    senders: LaneSenders<Message>,
    receivers: Mutex<LaneReceivers<Message>>,
    processing: Mutex<HashMap<String, Message>>,
    dead_letters: Mutex<Vec<Message>>,
}

/// Priority queue over bounded in-process lanes.
///
/// Messages live only as long as the process. Lane capacities follow
/// `buffer_size`: a quarter each for Critical, High and Low, half for Normal.
#[derive(Clone)]
pub struct MemoryMessageQueue {
    inner: Arc<Inner>,
}

impl MemoryMessageQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(options: QueueOptions) -> Self {
        let (senders, receivers) = lanes(options.buffer_size);
        Self {
            inner: Arc::new(Inner {
                core: QueueCore::new(options),
                senders,
                receivers: Mutex::new(receivers),
                processing: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(super) fn core(&self) -> &QueueCore {
        &self.inner.core
    }

    /// Apply defaults and enqueue. Fails with [`QueueError::Full`] when the lane is at capacity.
    pub async fn publish(&self, mut message: Message) -> QueueResult<String> {
        self.inner.core.prepare(&mut message);
        let id = message.id.clone();
        let priority = message.priority;

        self.inner
            .senders
            .try_send(priority, message)
            .map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full("message queue lane"),
                TrySendError::Closed(_) => QueueError::Stopped("message queue"),
            })?;
        self.inner.core.record_published(1);

        debug!(message_id = %id, priority = %priority, "Message published");
        Ok(id)
    }

    /// Enqueue each message in turn, stopping at the first rejection.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }

    /// Start workers.
    pub async fn start(&self) -> QueueResult<()> {
        let core = &self.inner.core;
        if !core.pool.begin() {
            return Ok(());
        }
        for worker_id in 0..core.options.workers {
            let queue = self.clone();
            let shutdown = core.pool.listener();
            core.pool
                .spawn(async move { queue.run_worker(worker_id, shutdown).await })
                .await;
        }
        info!(
            queue = %core.options.queue_name,
            workers = core.options.workers,
            "In-memory message queue started"
        );
        Ok(())
    }

    /// Stop workers and wait for them to exit.
    pub async fn stop(&self) {
        if self.inner.core.pool.shutdown().await {
            info!(queue = %self.inner.core.options.queue_name, "In-memory message queue stopped");
        }
    }

    async fn run_worker(self, worker_id: usize, shutdown: ShutdownListener) {
        debug!(worker_id, "In-memory queue worker started");
        while let Some(mut message) = next_item(&self.inner.receivers, &shutdown).await {
            message.processing_start_time = Some(Utc::now().timestamp());
            self.inner
                .processing
                .lock()
                .await
                .insert(message.id.clone(), message.clone());

            let disposition = self.inner.core.process(&mut message, &shutdown).await;
            self.settle(message, disposition, &shutdown).await;
        }
        debug!(worker_id, "In-memory queue worker stopped");
    }

    async fn settle(&self, mut message: Message, disposition: Disposition, shutdown: &ShutdownListener) {
        match disposition {
            Disposition::Done => {}
            Disposition::Interrupted => {
                // Requeue so the message runs again after a restart.
                message.processing_start_time = None;
                if let Err(e) = self.inner.senders.try_send(message.priority, message.clone()) {
                    warn!(message_id = %message.id, "Lane full, dead-lettering interrupted message");
                    self.dead_letter(rejected(e), "interrupted and lane full".to_string())
                        .await;
                }
            }
            Disposition::Retry(delay) => {
                wait_retry(delay, shutdown).await;
                message.processing_start_time = None;
                match self.inner.senders.try_send(message.priority, message.clone()) {
                    Ok(()) => self.inner.core.record_retried(),
                    Err(e) => self.dead_letter(rejected(e), "retry lane full".to_string()).await,
                }
            }
            Disposition::DeadLetter(error) => {
                self.dead_letter(message.clone(), error).await;
            }
        }
        self.inner.processing.lock().await.remove(&message.id);
    }

    async fn dead_letter(&self, mut message: Message, error: String) {
        if self.inner.core.dead_letter(&mut message, error) {
            self.inner.dead_letters.lock().await.push(message);
            self.inner.core.record_dead_lettered();
        }
    }

    /// Pending messages per priority.
    #[must_use]
    pub fn queue_lengths(&self) -> QueueLengths {
        let mut lengths = QueueLengths::default();
        let pending = self.inner.senders.pending();
        for priority in Priority::DRAIN_ORDER {
            lengths.set(priority, pending[priority.drain_index()] as u64);
        }
        lengths
    }

    /// Pending messages across all priorities.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.inner.senders.total_pending() as u64
    }

    /// Messages currently being handled.
    pub async fn processing_count(&self) -> u64 {
        self.inner.processing.lock().await.len() as u64
    }

    /// Messages in the dead-letter list.
    pub async fn dead_letter_count(&self) -> u64 {
        self.inner.dead_letters.lock().await.len() as u64
    }

    /// Up to `limit` dead-lettered messages, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Vec<Message> {
        self.inner
            .dead_letters
            .lock()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop every dead letter. Returns the number removed.
    pub async fn clear_dead_letters(&self) -> u64 {
        let mut dead_letters = self.inner.dead_letters.lock().await;
        let count = dead_letters.len() as u64;
        dead_letters.clear();
        count
    }

    /// Move dead letters back to their lanes with a fresh retry budget.
    ///
    /// Messages whose lane is full stay in the dead-letter list.
    pub async fn requeue_dead_letters(&self) -> u64 {
        let drained = std::mem::take(&mut *self.inner.dead_letters.lock().await);
        let mut kept = Vec::new();
        let mut moved = 0;

        for mut message in drained {
            message.reset_for_requeue();
            match self.inner.senders.try_send(message.priority, message) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(mut message) | TrySendError::Closed(mut message)) => {
                    message.mark_dead_lettered("requeue lane full");
                    kept.push(message);
                }
            }
        }

        if !kept.is_empty() {
            let mut dead_letters = self.inner.dead_letters.lock().await;
            kept.append(&mut dead_letters);
            *dead_letters = kept;
        }
        info!(moved, "Requeued dead letters");
        moved
    }

    /// Counters plus lane and processing gauges.
    pub async fn stats(&self) -> Stats {
        let mut stats = self.inner.core.counter_stats();
        let lengths = self.queue_lengths();
        stats.insert("queue_name".into(), self.inner.core.options.queue_name.clone().into());
        stats.insert("queue_lengths".into(), lengths.to_json());
        stats.insert("total_length".into(), lengths.total().into());
        stats.insert("processing_count".into(), self.processing_count().await.into());
        stats.insert("dead_letter_count".into(), self.dead_letter_count().await.into());
        stats
    }
}

fn rejected(error: TrySendError<Message>) -> Message {
    match error {
        TrySendError::Full(message) | TrySendError::Closed(message) => message,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Payload;

    fn queue(buffer_size: usize) -> MemoryMessageQueue {
        MemoryMessageQueue::new(QueueOptions {
            queue_name: "test".to_string(),
            workers: 1,
            buffer_size,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_publish_rejects_when_lane_full() {
        let queue = queue(4);
        queue
            .publish(Message::new("x", Payload::new()).with_priority(Priority::High))
            .await
            .unwrap();

        let err = queue
            .publish(Message::new("x", Payload::new()).with_priority(Priority::High))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full(_)));

        queue
            .publish(Message::new("x", Payload::new()).with_priority(Priority::Low))
            .await
            .unwrap();
        assert_eq!(queue.queue_lengths().high, 1);
        assert_eq!(queue.total_length(), 2);
    }

    #[tokio::test]
    async fn test_requeue_resets_failure_fields() {
        let queue = queue(16);
        let mut message = Message::new("x", Payload::new());
        message.id = "dead-1".to_string();
        message.retry_count = 3;
        message.mark_dead_lettered("boom");
        queue.inner.dead_letters.lock().await.push(message);

        assert_eq!(queue.requeue_dead_letters().await, 1);
        assert_eq!(queue.dead_letter_count().await, 0);
        assert_eq!(queue.total_length(), 1);

        let requeued = queue.inner.receivers.lock().await.try_recv().unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert!(requeued.last_error.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_message_dead_lettered_when_lane_full() {
        let queue = queue(4);
        queue
            .publish(Message::new("x", Payload::new()).with_priority(Priority::Critical))
            .await
            .unwrap();

        let mut message = Message::new("x", Payload::new()).with_priority(Priority::Critical);
        message.id = "in-flight".to_string();
        queue
            .inner
            .processing
            .lock()
            .await
            .insert(message.id.clone(), message.clone());

        let pool = crate::lifecycle::WorkerPool::new("test");
        pool.begin();
        queue
            .settle(message, Disposition::Interrupted, &pool.listener())
            .await;

        assert_eq!(queue.processing_count().await, 0);
        let dead = queue.dead_letters(10).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, "in-flight");
        assert_eq!(queue.stats().await["total_dead_letter"], 1);
    }

    #[tokio::test]
    async fn test_retry_counted_once_requeued() {
        let queue = queue(16);
        let message = Message::new("x", Payload::new());
        let pool = crate::lifecycle::WorkerPool::new("test");
        pool.begin();
        queue
            .settle(message, Disposition::Retry(std::time::Duration::ZERO), &pool.listener())
            .await;

        assert_eq!(queue.total_length(), 1);
        assert_eq!(queue.stats().await["total_retried"], 1);
    }

    #[tokio::test]
    async fn test_clear_dead_letters() {
        let queue = queue(16);
        for _ in 0..3 {
            queue
                .inner
                .dead_letters
                .lock()
                .await
                .push(Message::new("x", Payload::new()));
        }
        assert_eq!(queue.dead_letters(2).await.len(), 2);
        assert_eq!(queue.clear_dead_letters().await, 3);
        assert_eq!(queue.dead_letter_count().await, 0);
    }
}
