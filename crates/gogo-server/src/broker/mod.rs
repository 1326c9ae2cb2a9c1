//! Durable brokers used by the queued transport.
//!
//! Inbound payloads are published keyed by sender, so one sender's messages
//! stay in one partition and keep their order. A consumer task reads them
//! back and re-injects them into the hub's transmit path, committing each
//! record only after the hub has accepted it (at-least-once).

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod redis_stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::hub::HubHandle;

/// Pause after a failed poll before trying again.
const POLL_BACKOFF: Duration = Duration::from_secs(1);

/// One payload read back from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub payload: Vec<u8>,
    /// Stream or topic the record was read from.
    pub topic: String,
    pub partition: i32,
    /// Broker-native position (stream entry id or numeric offset).
    pub offset: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Wait for the next batch of records. May return an empty batch.
    async fn poll(&self) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Mark a record as processed.
    async fn commit(&self, record: &BrokerRecord) -> Result<(), BrokerError>;
}

/// Stable partition index for `key` (FNV-1a).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions.max(1)
}

/// Spawn the task that feeds broker records into the hub.
///
/// The task stops on `shutdown` or when the hub is gone.
pub fn spawn_consumer(
    broker: Arc<dyn Broker>,
    hub: HubHandle,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Broker consumer started");
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = broker.poll() => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Broker poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => continue,
                    }
                }
            };

            for record in records {
                if hub.transmit(record.payload.clone()).await.is_err() {
                    info!("Hub closed, stopping broker consumer");
                    return;
                }
                if let Err(e) = broker.commit(&record).await {
                    warn!(
                        topic = %record.topic,
                        offset = %record.offset,
                        error = %e,
                        "Failed to commit broker record"
                    );
                } else {
                    debug!(topic = %record.topic, offset = %record.offset, "Record handed to hub");
                }
            }
        }
        info!("Broker consumer stopped");
    })
}

#[cfg(test)]
mod tests {
    use gogo_shared::protocol::MessageView;

    use super::*;
    use crate::collaborators::ContactStatus;
    use crate::test_support::{next_frame, text_payload, FakeBroker, Harness};

    #[test]
    fn test_partition_is_stable_and_bounded() {
        for key in ["U1", "U2", "U12345", ""] {
            let p = partition_for(key, 3);
            assert!(p < 3);
            assert_eq!(p, partition_for(key, 3));
        }
        assert_eq!(partition_for("U1", 0), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_record_is_replayed_after_restart() {
        let broker = FakeBroker::default();
        broker
            .publish("U1", &text_payload("U1", "U2", "survives restart"))
            .await
            .unwrap();

        // First run: the hub is already gone, so the record is read but never committed.
        let stopped = Harness::new();
        stopped.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while stopped.hub.get_client("U1").await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let first = spawn_consumer(
            Arc::new(broker.clone()),
            stopped.hub.clone(),
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .unwrap()
            .unwrap();
        assert!(broker.committed().is_empty());

        // Second run under the same consumer identity.
        broker.restart();
        let h = Harness::new();
        h.contacts.set("U1", "U2", ContactStatus::Normal);
        let (_, mut bob) = h.connect("U2").await;
        next_frame(&mut bob).await;

        let shutdown = CancellationToken::new();
        let second = spawn_consumer(Arc::new(broker.clone()), h.hub.clone(), shutdown.clone());

        let view: MessageView = serde_json::from_str(&next_frame(&mut bob).await.payload).unwrap();
        assert_eq!(view.content, "survives restart");

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.committed().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.committed(), vec!["0-1".to_string()]);

        shutdown.cancel();
        second.await.unwrap();
    }
}
