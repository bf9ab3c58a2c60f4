//! Kafka integration tests.
//!
//! These tests require a running Kafka broker.
//! Run with: `cargo test --test kafka_integration -- --ignored`
//!
//! Set `KAFKA_BROKERS` (comma separated) to point to your brokers.
//! Default: localhost:9092

#![cfg(feature = "kafka")]

use std::sync::Arc;
use std::time::Duration;

use meetq_common::KafkaConfig;
use meetq_queue::{
    HandlerError, KafkaMessageQueue, KafkaPubSub, Message, MessageQueue, Payload, Priority,
    PubSubMessage, QueueOptions,
};
use serde_json::json;
use tokio::sync::mpsc;

fn kafka_config(test: &str) -> KafkaConfig {
    let brokers = std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let run = std::process::id();
    KafkaConfig {
        brokers: brokers.split(',').map(str::to_string).collect(),
        topic_prefix: format!("meetq_test_{test}_{run}"),
        group_id: format!("meetq-test-{test}-{run}"),
        partitions: 1,
        replication_factor: 1,
        ..KafkaConfig::default()
    }
}

/// Low then Critical on one key arrive in publish order.
#[tokio::test]
#[ignore = "requires running Kafka broker"]
async fn test_priority_does_not_reorder() {
    let queue = MessageQueue::Kafka(
        KafkaMessageQueue::new(
            &kafka_config("fifo"),
            QueueOptions {
                workers: 1,
                ..QueueOptions::default()
            },
        )
        .expect("Failed to create Kafka queue"),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    queue
        .register_handler("meeting.notify", move |message: Message| {
            let tx = tx.clone();
            async move {
                tx.send(message.priority).ok();
                Ok::<(), HandlerError>(())
            }
        })
        .await;
    queue.start().await.expect("Failed to start");

    for priority in [Priority::Low, Priority::Critical] {
        queue
            .publish(Message::new("meeting.notify", Payload::new()).with_priority(priority))
            .await
            .expect("Failed to publish");
    }

    let mut order = Vec::new();
    for _ in 0..2 {
        let priority = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("no message within 30s")
            .expect("handler channel closed");
        order.push(priority);
    }
    queue.stop().await;

    assert_eq!(order, vec![Priority::Low, Priority::Critical]);
}

/// Events published on a channel reach its subscriber.
#[tokio::test]
#[ignore = "requires running Kafka broker"]
async fn test_pubsub_round_trip() {
    let pubsub = KafkaPubSub::new(&kafka_config("events"), Duration::from_secs(5))
        .expect("Failed to create Kafka pub/sub");
    let (tx, mut rx) = mpsc::unbounded_channel();
    pubsub
        .subscribe(
            "meeting_events",
            Arc::new(move |message: PubSubMessage| {
                let tx = tx.clone();
                async move {
                    tx.send(message).ok();
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .await
        .expect("Failed to subscribe");
    pubsub.start().await.expect("Failed to start");
    // Let the consumer join its group before producing.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut payload = Payload::new();
    payload.insert("user_id".into(), json!(3));
    pubsub
        .publish(
            "meeting_events",
            PubSubMessage::new("meeting.user_joined", payload.clone()),
        )
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("no event within 30s")
        .expect("handler channel closed");
    pubsub.stop().await;

    assert_eq!(received.message_type, "meeting.user_joined");
    assert_eq!(received.payload, payload);
}
