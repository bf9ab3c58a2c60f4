//! Kafka-backed queue.
//!
//! Priority is carried on the message but does not reorder delivery:
//! records are consumed in partition order.

use std::sync::Arc;

use meetq_common::KafkaConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Message as _, OwnedMessage};
use rdkafka::producer::FutureProducer;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use super::{Disposition, QueueCore, QueueOptions, retry_until_ok, wait_retry};
use crate::error::QueueResult;
use crate::kafka::{self as client, FETCH_BACKOFF};
use crate::lifecycle::ShutdownListener;
use crate::model::{Message, Stats};

struct Inner {
    core: QueueCore,
    kafka: KafkaConfig,
    producer: FutureProducer,
    topic: String,
    dead_letter_topic: String,
}

/// Queue over a `{prefix}.tasks` topic consumed by one consumer group.
#[derive(Clone)]
pub struct KafkaMessageQueue {
    inner: Arc<Inner>,
}

impl KafkaMessageQueue {
    /// Create the producer. Topics and consumers are set up by [`Self::start`].
    pub fn new(kafka: &KafkaConfig, options: QueueOptions) -> QueueResult<Self> {
        let producer = client::producer(kafka)?;
        let topic = format!("{}.tasks", kafka.topic_prefix);
        let dead_letter_topic = format!("{topic}.dlq");

        Ok(Self {
            inner: Arc::new(Inner {
                core: QueueCore::new(options),
                kafka: kafka.clone(),
                producer,
                topic,
                dead_letter_topic,
            }),
        })
    }

    pub(super) fn core(&self) -> &QueueCore {
        &self.inner.core
    }

    /// Tasks topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Dead-letter topic.
    #[must_use]
    pub fn dead_letter_topic(&self) -> &str {
        &self.inner.dead_letter_topic
    }

    /// Apply defaults and produce keyed by message type.
    pub async fn publish(&self, mut message: Message) -> QueueResult<String> {
        if message.dead_letter_queue.is_empty() {
            message.dead_letter_queue.clone_from(&self.inner.dead_letter_topic);
        }
        self.inner.core.prepare(&mut message);
        let payload = serde_json::to_string(&message)?;

        client::send(&self.inner.producer, &self.inner.topic, &message.message_type, &payload).await?;
        self.inner.core.record_published(1);

        debug!(message_id = %message.id, topic = %self.inner.topic, "Message produced");
        Ok(message.id)
    }

    /// Produce each message in turn, stopping at the first error.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }

    /// Create topics if missing and start one group consumer per worker.
    pub async fn start(&self) -> QueueResult<()> {
        let core = &self.inner.core;
        if !core.pool.begin() {
            return Ok(());
        }

        let setup = async {
            client::ensure_topics(
                &self.inner.kafka,
                &[&self.inner.topic, &self.inner.dead_letter_topic],
            )
            .await?;
            let mut consumers = Vec::with_capacity(core.options.workers);
            for _ in 0..core.options.workers {
                consumers.push(client::consumer(
                    &self.inner.kafka,
                    &self.inner.kafka.group_id,
                    &self.inner.topic,
                    false,
                )?);
            }
            QueueResult::Ok(consumers)
        };
        let consumers = match setup.await {
            Ok(consumers) => consumers,
            Err(e) => {
                core.pool.shutdown().await;
                return Err(e);
            }
        };

        for (worker_id, consumer) in consumers.into_iter().enumerate() {
            let queue = self.clone();
            let shutdown = core.pool.listener();
            core.pool
                .spawn(async move { queue.run_worker(worker_id, consumer, shutdown).await })
                .await;
        }

        info!(
            topic = %self.inner.topic,
            group_id = %self.inner.kafka.group_id,
            workers = core.options.workers,
            "Kafka message queue started"
        );
        Ok(())
    }

    /// Stop consumers and wait for them to exit.
    pub async fn stop(&self) {
        if self.inner.core.pool.shutdown().await {
            info!(topic = %self.inner.topic, "Kafka message queue stopped");
        }
    }

    async fn run_worker(self, worker_id: usize, consumer: StreamConsumer, shutdown: ShutdownListener) {
        debug!(worker_id, "Kafka queue worker started");
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = consumer.recv() => received.map(|record| record.detach()),
            };
            let record = match received {
                Ok(record) => record,
                Err(e) => {
                    warn!(worker_id, error = %e, "Kafka fetch failed");
                    wait_retry(FETCH_BACKOFF, &shutdown).await;
                    continue;
                }
            };

            if !self.handle_record(&record, &shutdown).await {
                // Shutdown before the outcome was applied; the group redelivers
                // from the uncommitted offset.
                break;
            }
            commit(&consumer, &record);
        }
        debug!(worker_id, "Kafka queue worker stopped");
    }

    /// Apply the handler outcome. Returns `false` when shutdown came first
    /// and the offset must stay uncommitted.
    async fn handle_record(&self, record: &OwnedMessage, shutdown: &ShutdownListener) -> bool {
        let decoded = record
            .payload()
            .map(serde_json::from_slice::<Message>);
        let mut message = match decoded {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(offset = record.offset(), error = %e, "Undecodable record skipped");
                return true;
            }
            None => {
                warn!(offset = record.offset(), "Empty record skipped");
                return true;
            }
        };

        message.processing_start_time = Some(chrono::Utc::now().timestamp());
        let disposition = self.inner.core.process(&mut message, shutdown).await;
        message.processing_start_time = None;

        match disposition {
            Disposition::Done => true,
            Disposition::Interrupted => false,
            Disposition::Retry(delay) => {
                wait_retry(delay, shutdown).await;
                let produced = self.produce_until_sent(&self.inner.topic, &message, shutdown).await;
                if produced {
                    self.inner.core.record_retried();
                }
                produced
            }
            Disposition::DeadLetter(error) => {
                if !self.inner.core.dead_letter(&mut message, error) {
                    return true;
                }
                let produced = self
                    .produce_until_sent(&self.inner.dead_letter_topic, &message, shutdown)
                    .await;
                if produced {
                    self.inner.core.record_dead_lettered();
                }
                produced
            }
        }
    }

    /// Produce `message`, backing off between failures. Returns `false` only
    /// when shutdown interrupts the attempts.
    async fn produce_until_sent(&self, topic: &str, message: &Message, shutdown: &ShutdownListener) -> bool {
        let sent = retry_until_ok(&self.inner.core.options.retry, shutdown, "kafka produce", || {
            self.produce(topic, message)
        })
        .await;
        if !sent {
            warn!(message_id = %message.id, topic, "Shutdown while producing, offset left uncommitted");
        }
        sent
    }

    async fn produce(&self, topic: &str, message: &Message) -> QueueResult<()> {
        let payload = serde_json::to_string(message)?;
        client::send(&self.inner.producer, topic, &message.message_type, &payload).await
    }

    /// Counters plus topic names.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = self.inner.core.counter_stats();
        stats.insert("topic".into(), self.inner.topic.clone().into());
        stats.insert("dead_letter_topic".into(), self.inner.dead_letter_topic.clone().into());
        stats.insert("group_id".into(), self.inner.kafka.group_id.clone().into());
        stats
    }
}

fn commit(consumer: &StreamConsumer, record: &OwnedMessage) {
    let mut offsets = TopicPartitionList::new();
    if let Err(e) =
        offsets.add_partition_offset(record.topic(), record.partition(), Offset::Offset(record.offset() + 1))
    {
        error!(error = %e, "Failed to build commit offsets");
        return;
    }
    if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
        error!(error = %e, offset = record.offset(), "Offset commit failed");
    }
}
