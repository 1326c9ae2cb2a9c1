//! Ingestion edge between a connection and the hub.
//!
//! The transport is chosen once at startup. Direct mode pushes payloads into
//! the hub's transmit queue, spilling into a small per-connection overflow
//! queue when the hub is saturated and shedding load once that is full too.
//! Queued mode publishes to a durable broker; a consumer task feeds the hub.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::broker::redis_stream::RedisStreamBroker;
use crate::broker::Broker;
use crate::config::{MessageMode, ServerConfig};
use crate::error::HubError;
use crate::hub::HubHandle;

/// How inbound payloads reach the hub. Fixed for the process lifetime.
#[derive(Clone)]
pub enum Transport {
    Direct,
    Queued(Arc<dyn Broker>),
}

impl Transport {
    /// Build the transport selected by `MESSAGE_MODE`.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        match config.message_mode {
            MessageMode::Channel => {
                info!("Using direct channel transport");
                Ok(Transport::Direct)
            }
            MessageMode::RedisStream => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("MESSAGE_MODE=redis_stream requires REDIS_URL")?;
                let broker = RedisStreamBroker::connect(
                    url,
                    &config.kafka_topic,
                    &config.kafka_group,
                    config.broker_partitions,
                    &config.broker_consumer,
                )
                .await
                .context("failed to connect Redis stream broker")?;
                info!(partitions = config.broker_partitions, "Using Redis stream transport");
                Ok(Transport::Queued(Arc::new(broker)))
            }
            MessageMode::Kafka => Self::kafka(config),
        }
    }

    #[cfg(feature = "kafka")]
    fn kafka(config: &ServerConfig) -> anyhow::Result<Self> {
        let broker = crate::broker::kafka::KafkaBroker::connect(
            &config.kafka_brokers,
            &config.kafka_topic,
            &config.kafka_group,
        )
        .context("failed to connect Kafka broker")?;
        info!("Using Kafka transport");
        Ok(Transport::Queued(Arc::new(broker)))
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka(_config: &ServerConfig) -> anyhow::Result<Self> {
        anyhow::bail!("MESSAGE_MODE=kafka requires building with the `kafka` feature")
    }

    pub fn broker(&self) -> Option<Arc<dyn Broker>> {
        match self {
            Transport::Direct => None,
            Transport::Queued(broker) => Some(broker.clone()),
        }
    }
}

/// What happened to one submitted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the hub or the broker.
    Accepted,
    /// Parked in the connection's overflow queue.
    Deferred,
    /// Dropped; the sender should be told the server is busy.
    Shed,
    /// The broker refused the payload.
    Failed,
    /// The hub is gone.
    Closed,
}

/// Per-connection ingress: the transport plus the connection's own
/// overflow queue.
pub struct Ingress {
    transport: Transport,
    hub: HubHandle,
    overflow_tx: mpsc::Sender<Vec<u8>>,
    overflow_rx: mpsc::Receiver<Vec<u8>>,
}

impl Ingress {
    pub fn new(transport: Transport, hub: HubHandle, capacity: usize) -> Self {
        let (overflow_tx, overflow_rx) = mpsc::channel(capacity.max(1));
        Self {
            transport,
            hub,
            overflow_tx,
            overflow_rx,
        }
    }

    /// Route one inbound payload from `sender_id`.
    pub async fn submit(&mut self, sender_id: &str, payload: Vec<u8>) -> Admission {
        match &self.transport {
            Transport::Direct => self.submit_direct(payload),
            Transport::Queued(broker) => match broker.publish(sender_id, &payload).await {
                Ok(()) => Admission::Accepted,
                Err(e) => {
                    warn!(sender = %sender_id, error = %e, "Failed to publish payload");
                    Admission::Failed
                }
            },
        }
    }

    fn submit_direct(&mut self, payload: Vec<u8>) -> Admission {
        if self.drain().is_err() {
            return Admission::Closed;
        }

        // Older parked payloads go first.
        let payload = if self.overflow_rx.is_empty() {
            match self.hub.try_transmit(payload) {
                Ok(()) => return Admission::Accepted,
                Err(TrySendError::Full(payload)) => payload,
                Err(TrySendError::Closed(_)) => return Admission::Closed,
            }
        } else {
            payload
        };

        match self.overflow_tx.try_send(payload) {
            Ok(()) => {
                debug!(backlog = self.backlog(), "Hub busy, payload deferred");
                Admission::Deferred
            }
            Err(_) => Admission::Shed,
        }
    }

    /// Move as many parked payloads into the hub as it has room for.
    pub fn drain(&mut self) -> Result<usize, HubError> {
        let mut moved = 0;
        while !self.overflow_rx.is_empty() {
            let permit = match self.hub.try_reserve_transmit() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => break,
                Err(TrySendError::Closed(())) => return Err(HubError::Closed),
            };
            match self.overflow_rx.try_recv() {
                Ok(payload) => {
                    permit.send(payload);
                    moved += 1;
                }
                Err(_) => break,
            }
        }
        Ok(moved)
    }

    /// Wait for hub capacity and move the oldest parked payload into it.
    pub async fn drain_one(&mut self) -> Result<(), HubError> {
        let permit = self.hub.reserve_transmit().await?;
        if let Ok(payload) = self.overflow_rx.try_recv() {
            permit.send(payload);
        }
        Ok(())
    }

    pub fn backlog(&self) -> usize {
        self.overflow_rx.len()
    }

    pub fn has_backlog(&self) -> bool {
        !self.overflow_rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::broker::spawn_consumer;
    use crate::collaborators::ContactStatus;
    use crate::hub::Hub;
    use crate::test_support::{next_frame, text_payload, FakeBroker, Harness};

    /// A hub whose loop is not running, so its queue only fills.
    fn idle_hub(capacity: usize) -> (Hub, HubHandle, Harness) {
        let harness = Harness::new();
        let services = crate::hub::HubServices {
            persistence: harness.persistence.clone(),
            validator: crate::validator::DeliveryValidator::new(
                Arc::new(harness.contacts.clone()),
                Arc::new(harness.sessions.clone()),
                Duration::from_secs(3),
            ),
            groups: Arc::new(harness.groups.clone()),
        };
        let (hub, handle) = Hub::new(services, capacity);
        (hub, handle, harness)
    }

    #[tokio::test]
    async fn test_direct_defers_then_sheds() {
        let (_hub, handle, _h) = idle_hub(2);
        let mut ingress = Ingress::new(Transport::Direct, handle, 2);

        assert_eq!(ingress.submit("U1", b"1".to_vec()).await, Admission::Accepted);
        assert_eq!(ingress.submit("U1", b"2".to_vec()).await, Admission::Accepted);
        assert_eq!(ingress.submit("U1", b"3".to_vec()).await, Admission::Deferred);
        assert_eq!(ingress.submit("U1", b"4".to_vec()).await, Admission::Deferred);
        assert_eq!(ingress.submit("U1", b"5".to_vec()).await, Admission::Shed);
        assert_eq!(ingress.backlog(), 2);
    }

    #[tokio::test]
    async fn test_backlog_drains_in_order() {
        let (mut hub, handle, _h) = idle_hub(2);
        let mut ingress = Ingress::new(Transport::Direct, handle, 4);

        for n in 1..=4u8 {
            ingress.submit("U1", vec![n]).await;
        }
        assert_eq!(hub.try_next_payload(), Some(vec![1]));

        // Room for one: the oldest parked payload moves first.
        assert_eq!(ingress.submit("U1", vec![5]).await, Admission::Deferred);
        assert_eq!(hub.try_next_payload(), Some(vec![2]));
        assert_eq!(hub.try_next_payload(), Some(vec![3]));
        assert_eq!(hub.try_next_payload(), None);

        ingress.drain_one().await.unwrap();
        assert_eq!(ingress.drain().unwrap(), 1);
        assert_eq!(hub.try_next_payload(), Some(vec![4]));
        assert_eq!(hub.try_next_payload(), Some(vec![5]));
        assert!(!ingress.has_backlog());
    }

    #[tokio::test]
    async fn test_closed_hub() {
        let (hub, handle, _h) = idle_hub(2);
        drop(hub);
        let mut ingress = Ingress::new(Transport::Direct, handle, 2);
        assert_eq!(ingress.submit("U1", b"x".to_vec()).await, Admission::Closed);
    }

    #[tokio::test]
    async fn test_queued_publishes_keyed_by_sender() {
        let (_hub, handle, _h) = idle_hub(2);
        let broker = FakeBroker::default();
        let mut ingress = Ingress::new(Transport::Queued(Arc::new(broker.clone())), handle, 2);

        assert_eq!(ingress.submit("U1", b"hello".to_vec()).await, Admission::Accepted);
        assert_eq!(broker.published(), vec![("U1".to_string(), b"hello".to_vec())]);

        broker.fail();
        assert_eq!(ingress.submit("U1", b"again".to_vec()).await, Admission::Failed);
    }

    #[tokio::test]
    async fn test_consumer_feeds_hub_and_commits() {
        let h = Harness::new();
        h.contacts.set("U1", "U2", ContactStatus::Normal);
        let (_, mut bob) = h.connect("U2").await;
        next_frame(&mut bob).await;

        let broker = FakeBroker::default();
        let shutdown = CancellationToken::new();
        let consumer = spawn_consumer(Arc::new(broker.clone()), h.hub.clone(), shutdown.clone());

        let mut ingress =
            Ingress::new(Transport::Queued(Arc::new(broker.clone())), h.hub.clone(), 4);
        ingress.submit("U1", text_payload("U1", "U2", "via broker")).await;

        let frame = next_frame(&mut bob).await;
        assert!(frame.payload.contains("via broker"));

        shutdown.cancel();
        consumer.await.unwrap();
        assert_eq!(broker.committed(), vec!["0-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_mode_requires_redis_url() {
        let config = ServerConfig {
            message_mode: MessageMode::RedisStream,
            redis_url: None,
            ..ServerConfig::default()
        };
        assert!(Transport::from_config(&config).await.is_err());

        let direct = Transport::from_config(&ServerConfig::default()).await.unwrap();
        assert!(direct.broker().is_none());
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn test_kafka_mode_requires_feature() {
        let config = ServerConfig {
            message_mode: MessageMode::Kafka,
            ..ServerConfig::default()
        };
        assert!(Transport::from_config(&config).await.is_err());
    }
}
