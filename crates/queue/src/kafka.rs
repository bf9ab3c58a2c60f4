//! Kafka client construction shared by the queue and pub/sub backends.

use std::time::Duration;

use meetq_common::KafkaConfig;
use rdkafka::ClientConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::StreamConsumer;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, info};

use crate::error::QueueResult;

/// Delivery timeout for produced records.
pub(crate) const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed fetch.
pub(crate) const FETCH_BACKOFF: Duration = Duration::from_millis(500);

/// Base client settings: brokers plus optional TLS/SASL.
pub(crate) fn client_config(kafka: &KafkaConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", kafka.brokers.join(","));
    if let Some(protocol) = &kafka.security_protocol {
        config.set("security.protocol", protocol);
    }
    if let Some(mechanism) = &kafka.sasl_mechanism {
        config.set("sasl.mechanism", mechanism);
    }
    if let Some(username) = &kafka.sasl_username {
        config.set("sasl.username", username);
    }
    if let Some(password) = &kafka.sasl_password {
        config.set("sasl.password", password);
    }
    config
}

pub(crate) fn producer(kafka: &KafkaConfig) -> QueueResult<FutureProducer> {
    let producer = client_config(kafka)
        .set("message.timeout.ms", PRODUCE_TIMEOUT.as_millis().to_string())
        .create()?;
    Ok(producer)
}

/// Group consumer subscribed to `topic`.
pub(crate) fn consumer(
    kafka: &KafkaConfig,
    group_id: &str,
    topic: &str,
    auto_commit: bool,
) -> QueueResult<StreamConsumer> {
    use rdkafka::consumer::Consumer;

    let consumer: StreamConsumer = client_config(kafka)
        .set("group.id", group_id)
        .set("enable.auto.commit", auto_commit.to_string())
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
        .create()?;
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Create `topics` if missing. An existing topic is not an error.
pub(crate) async fn ensure_topics(kafka: &KafkaConfig, topics: &[&str]) -> QueueResult<()> {
    let admin: AdminClient<DefaultClientContext> = client_config(kafka).create()?;
    let new_topics: Vec<NewTopic<'_>> = topics
        .iter()
        .map(|name| {
            NewTopic::new(
                name,
                kafka.partitions,
                TopicReplication::Fixed(kafka.replication_factor),
            )
        })
        .collect();

    let results = admin
        .create_topics(new_topics.iter(), &AdminOptions::new())
        .await?;
    for result in results {
        match result {
            Ok(topic) => info!(topic = %topic, "Created Kafka topic"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %topic, "Kafka topic already exists");
            }
            Err((_, code)) => return Err(KafkaError::AdminOp(code).into()),
        }
    }
    Ok(())
}

/// Produce one JSON record keyed by `key`.
pub(crate) async fn send(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &str,
) -> QueueResult<()> {
    producer
        .send(
            FutureRecord::to(topic).key(key).payload(payload),
            PRODUCE_TIMEOUT,
        )
        .await
        .map_err(|(e, _)| e)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_includes_security() {
        let kafka = KafkaConfig {
            brokers: vec!["k1:9092".to_string(), "k2:9092".to_string()],
            security_protocol: Some("SASL_SSL".to_string()),
            sasl_mechanism: Some("PLAIN".to_string()),
            sasl_username: Some("meetq".to_string()),
            sasl_password: Some("secret".to_string()),
            ..Default::default()
        };
        let config = client_config(&kafka);

        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.username"), Some("meetq"));
    }

    #[test]
    fn test_client_config_without_security() {
        let config = client_config(&KafkaConfig::default());
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("security.protocol"), None);
    }
}
