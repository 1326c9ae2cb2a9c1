//! Kafka broker (compiled with the `kafka` feature).
//!
//! Offsets are stored explicitly after the hub accepts a record and are
//! committed in the background by librdkafka.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use super::{Broker, BrokerRecord};
use crate::error::BrokerError;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);

pub struct KafkaBroker {
    producer: FutureProducer,
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaBroker {
    pub fn connect(brokers: &str, topic: &str, group: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .set("session.timeout.ms", "30000")
            .create()?;
        consumer.subscribe(&[topic])?;

        info!(brokers, topic, group, "Connected to Kafka");

        Ok(Self {
            producer,
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        match self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
        {
            Ok((partition, offset)) => {
                debug!(partition, offset, key, "Published payload");
                Ok(())
            }
            Err((e, _)) => Err(e.into()),
        }
    }

    async fn poll(&self) -> Result<Vec<BrokerRecord>, BrokerError> {
        let message = self.consumer.recv().await?;
        let Some(payload) = message.payload() else {
            warn!(
                partition = message.partition(),
                offset = message.offset(),
                "Kafka record has no payload"
            );
            self.consumer.store_offset_from_message(&message)?;
            return Ok(Vec::new());
        };

        Ok(vec![BrokerRecord {
            payload: payload.to_vec(),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset().to_string(),
        }])
    }

    async fn commit(&self, record: &BrokerRecord) -> Result<(), BrokerError> {
        let offset: i64 = record
            .offset
            .parse()
            .map_err(|_| BrokerError::Malformed(format!("bad offset {}", record.offset)))?;
        // Stored offsets name the next record to read.
        self.consumer
            .store_offset(&record.topic, record.partition, offset + 1)?;
        Ok(())
    }
}
