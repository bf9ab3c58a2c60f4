//! Redis integration tests.
//!
//! These tests require a running Redis instance.
//! Run with: `cargo test --test redis_integration -- --ignored`
//!
//! Set `REDIS_URL` environment variable to point to your Redis instance.
//! Default: <redis://localhost:6379>

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use fred::clients::Client;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, ListInterface};
use fred::types::config::Config as RedisConfig;
use meetq_queue::{
    HandlerError, Message, MessageQueue, Payload, Priority, PubSubMessage, QueueOptions,
    RedisMessageQueue, RedisPubSub, RetryPolicy,
};
use serde_json::json;
use tokio::sync::mpsc;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Options with a per-test queue name so runs do not share keys.
fn options(test: &str, workers: usize) -> QueueOptions {
    QueueOptions {
        queue_name: format!("meetq_test:{test}:{}", std::process::id()),
        workers,
        poll_interval: Duration::from_millis(200),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        ..QueueOptions::default()
    }
}

async fn connect(test: &str, workers: usize) -> MessageQueue {
    let queue = RedisMessageQueue::connect(&get_redis_url(), options(test, workers))
        .await
        .expect("Failed to connect to Redis");
    queue.clear_dead_letters().await.expect("Failed to clear DLQ");
    MessageQueue::Redis(queue)
}

async fn raw_client() -> Client {
    let config = RedisConfig::from_url(&get_redis_url()).expect("Invalid REDIS_URL");
    let client = Client::new(config, None, None, None);
    client.init().await.expect("Failed to connect to Redis");
    client
}

/// Test that we can connect to Redis.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_connection() {
    let queue = RedisMessageQueue::connect(&get_redis_url(), options("connect", 1)).await;
    assert!(queue.is_ok(), "Failed to connect to Redis: {:?}", queue.err());
}

/// Messages queued before start are drained Critical, High, Normal, Low.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_priority_order_single_worker() {
    let queue = connect("order", 1).await;
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

    for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
        queue
            .publish(Message::new("meeting.notify", Payload::new()).with_priority(priority))
            .await
            .expect("Failed to publish");
    }
    queue.start().await.expect("Failed to start");

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(rx.recv().await.expect("handler channel closed"));
    }
    queue.stop().await;

    assert_eq!(
        order,
        vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
    );
}

/// A failing message is retried and then dead-lettered once.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_retry_then_dead_letter() {
    let queue = connect("dlq", 2).await;
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    queue
        .register_handler("media.transcode", move |_: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("codec unavailable".into())
            }
        })
        .await;
    queue.start().await.expect("Failed to start");

    let id = queue
        .publish(Message::new("media.transcode", Payload::new()).with_max_retries(2))
        .await
        .expect("Failed to publish");

    let redis = queue.as_redis().expect("redis backend");
    for _ in 0..100 {
        if redis.dead_letter_count().await.expect("dlq length") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    queue.stop().await;

    let dead = redis.dead_letters(10).await.expect("Failed to read DLQ");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(redis.processing_count().await.expect("processing count"), 0);

    redis.clear_dead_letters().await.expect("Failed to clear DLQ");
}

/// A message with no handler is dead-lettered without retries.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_unhandled_type_dead_lettered() {
    let queue = connect("nohandler", 1).await;
    queue.start().await.expect("Failed to start");
    queue
        .publish(Message::new("unknown.type", Payload::new()))
        .await
        .expect("Failed to publish");

    let redis = queue.as_redis().expect("redis backend");
    for _ in 0..40 {
        if redis.dead_letter_count().await.expect("dlq length") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    queue.stop().await;

    let dead = redis.dead_letters(1).await.expect("Failed to read DLQ");
    assert_eq!(dead[0].retry_count, 0);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("unknown.type"));
    redis.clear_dead_letters().await.expect("Failed to clear DLQ");
}

/// Dead letters can be moved back onto their lanes.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_requeue_dead_letters() {
    let queue = connect("requeue", 1).await;
    queue.start().await.expect("Failed to start");
    queue
        .publish(Message::new("unknown.type", Payload::new()).with_priority(Priority::High))
        .await
        .expect("Failed to publish");

    let redis = queue.as_redis().expect("redis backend");
    for _ in 0..40 {
        if redis.dead_letter_count().await.expect("dlq length") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    queue.stop().await;

    assert_eq!(redis.requeue_dead_letters().await.expect("requeue"), 1);
    assert_eq!(redis.dead_letter_count().await.expect("dlq length"), 0);
    assert_eq!(redis.queue_lengths().await.expect("lengths").high, 1);
}

/// A stale processing record is requeued exactly once, a fresh one is left alone.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_abandoned_record_requeued_once() {
    let queue = connect("abandoned", 1).await;
    let redis = queue.as_redis().expect("redis backend");
    let client = raw_client().await;
    let keys = redis.keys();
    let now = Utc::now().timestamp();

    let mut stale = Message::new("media.transcode", Payload::new())
        .with_priority(Priority::High)
        .with_max_retries(3);
    stale.id = format!("stale-{}", std::process::id());
    stale.timestamp = now - 120;
    stale.visibility_timeout = 30;
    stale.processing_start_time = Some(now - 120);

    let mut fresh = stale.clone();
    fresh.id = format!("fresh-{}", std::process::id());
    fresh.processing_start_time = Some(now);

    for message in [&stale, &fresh] {
        let record = serde_json::to_string(message).expect("encode record");
        let _: () = client
            .hset(keys.processing(), (message.id.as_str(), record))
            .await
            .expect("Failed to seed processing record");
    }

    assert_eq!(redis.recover_abandoned().await.expect("first scan"), 1);
    assert_eq!(redis.recover_abandoned().await.expect("second scan"), 0);
    assert_eq!(redis.processing_count().await.expect("processing count"), 1);

    let pending: Vec<String> = client
        .lrange(keys.lane(Priority::High), 0, -1)
        .await
        .expect("Failed to read lane");
    assert_eq!(pending.len(), 1);
    let requeued: Message = serde_json::from_str(&pending[0]).expect("decode requeued");
    assert_eq!(requeued.id, stale.id);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.processing_start_time.is_none());

    let stats = redis.stats().await;
    assert_eq!(stats["total_failed"], 1);
    assert_eq!(stats["total_retried"], 1);

    let mut cleanup = keys.lanes();
    cleanup.push(keys.processing().to_string());
    let _: i64 = client.del(cleanup).await.expect("cleanup");
}

/// Published pub/sub messages reach channel subscribers.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_pubsub_round_trip() {
    let pubsub = RedisPubSub::connect(&get_redis_url(), Duration::from_secs(5))
        .await
        .expect("Failed to connect to Redis");
    let channel = format!("meetq_test_events_{}", std::process::id());
    let (tx, mut rx) = mpsc::unbounded_channel();
    pubsub
        .subscribe(
            &channel,
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

    let mut payload = Payload::new();
    payload.insert("meeting_id".into(), json!(7));
    pubsub
        .publish(
            &channel,
            PubSubMessage::new("meeting.created", payload.clone()).with_source("integration"),
        )
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .expect("handler channel closed");
    pubsub.stop().await;

    assert_eq!(received.message_type, "meeting.created");
    assert_eq!(received.payload, payload);
    assert_eq!(received.source, "integration");
}
