//! Redis Streams broker.
//!
//! The topic is split into `partitions` streams (`{topic}:{n}`). Records are
//! read through a consumer group and acknowledged with `XACK` once the hub
//! has taken them.
//!
//! Blocking reads run on their own connection so publishes and acks never
//! queue behind a `BLOCK`. After a restart the consumer first replays its
//! own pending entries (read from id `0`) before reading new ones, which
//! requires a consumer name that stays the same across restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{partition_for, Broker, BrokerRecord};
use crate::error::BrokerError;

/// Field holding the raw payload in each stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// How long one `XREADGROUP` may block.
const READ_BLOCK: Duration = Duration::from_millis(2000);

/// Maximum entries returned by one read.
const READ_COUNT: usize = 64;

/// Start id selecting this consumer's delivered but unacknowledged entries.
const PENDING_START: &str = "0";

/// Start id selecting entries never delivered to the group.
const NEW_START: &str = ">";

#[derive(Clone)]
pub struct RedisStreamBroker {
    /// Publishes, acks and group setup.
    conn: ConnectionManager,
    /// Used only by `poll`.
    reader: MultiplexedConnection,
    streams: Vec<String>,
    group: String,
    consumer: String,
    replaying: Arc<AtomicBool>,
}

impl RedisStreamBroker {
    /// Connect and make sure every partition stream has the consumer group.
    pub async fn connect(
        url: &str,
        topic: &str,
        group: &str,
        partitions: u32,
        consumer: &str,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone()).await?;
        let reader = client.get_multiplexed_async_connection().await?;

        let streams: Vec<String> = (0..partitions.max(1))
            .map(|n| format!("{topic}:{n}"))
            .collect();

        for stream in &streams {
            let created: redis::RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match created {
                Ok(()) => info!(stream = %stream, group, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!(stream = %stream, group, "Consumer group already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(group, consumer, "Redis stream consumer ready");
        Ok(Self {
            conn,
            reader,
            streams,
            group: group.to_string(),
            consumer: consumer.to_string(),
            replaying: Arc::new(AtomicBool::new(true)),
        })
    }

    fn stream_for(&self, key: &str) -> &str {
        let idx = partition_for(key, self.streams.len() as u32) as usize;
        &self.streams[idx]
    }

    /// One `XREADGROUP` over every partition starting at `start`.
    ///
    /// Returns the records plus the number of entries seen, which includes
    /// unreadable entries that were acknowledged and skipped.
    async fn read(
        &self,
        start: &str,
        block: Option<Duration>,
    ) -> Result<(Vec<BrokerRecord>, usize), BrokerError> {
        let mut reader = self.reader.clone();
        let cmd = read_group_cmd(&self.group, &self.consumer, &self.streams, start, block);

        // A blocking read that times out replies nil.
        let reply: Option<StreamReadReply> = cmd.query_async(&mut reader).await?;
        let Some(reply) = reply else {
            return Ok((Vec::new(), 0));
        };

        let mut conn = self.conn.clone();
        let mut records = Vec::new();
        let mut seen = 0;
        for stream_key in reply.keys {
            let partition = self
                .streams
                .iter()
                .position(|s| *s == stream_key.key)
                .unwrap_or_default() as i32;
            for entry in stream_key.ids {
                seen += 1;
                match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
                    Some(payload) => records.push(BrokerRecord {
                        payload,
                        topic: stream_key.key.clone(),
                        partition,
                        offset: entry.id,
                    }),
                    None => {
                        // Trimmed or unreadable entries are acked so they are not replayed forever.
                        warn!(stream = %stream_key.key, id = %entry.id, "Stream entry has no payload");
                        let _: i64 = conn
                            .xack(&stream_key.key, &self.group, &[&entry.id])
                            .await?;
                    }
                }
            }
        }
        Ok((records, seen))
    }
}

/// Build `XREADGROUP GROUP g c COUNT n [BLOCK ms] STREAMS s.. id..`.
fn read_group_cmd(
    group: &str,
    consumer: &str,
    streams: &[String],
    start: &str,
    block: Option<Duration>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP")
        .arg(group)
        .arg(consumer)
        .arg("COUNT")
        .arg(READ_COUNT);
    if let Some(block) = block {
        cmd.arg("BLOCK").arg(block.as_millis() as u64);
    }
    cmd.arg("STREAMS");
    for stream in streams {
        cmd.arg(stream);
    }
    for _ in streams {
        cmd.arg(start);
    }
    cmd
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let stream = self.stream_for(key);
        let id: String = conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await?;
        debug!(stream, id = %id, "Published payload");
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<BrokerRecord>, BrokerError> {
        if self.replaying.load(Ordering::Acquire) {
            let (records, seen) = self.read(PENDING_START, None).await?;
            if seen > 0 {
                debug!(replayed = records.len(), "Replaying pending stream entries");
                return Ok(records);
            }
            info!(consumer = %self.consumer, "Pending stream entries drained");
            self.replaying.store(false, Ordering::Release);
        }

        let (records, _) = self.read(NEW_START, Some(READ_BLOCK)).await?;
        Ok(records)
    }

    async fn commit(&self, record: &BrokerRecord) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&record.topic, &self.group, &[&record.offset])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &redis::Cmd) -> Vec<String> {
        cmd.args_iter()
            .map(|arg| match arg {
                redis::Arg::Simple(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                _ => "<cursor>".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_pending_read_does_not_block() {
        let streams = vec!["chat:0".to_string(), "chat:1".to_string()];
        let cmd = read_group_cmd("chat", "hub-a", &streams, PENDING_START, None);
        assert_eq!(
            args(&cmd),
            vec!["XREADGROUP", "GROUP", "chat", "hub-a", "COUNT", "64", "STREAMS", "chat:0", "chat:1", "0", "0"]
        );
    }

    #[test]
    fn test_new_entries_read_blocks() {
        let streams = vec!["chat:0".to_string()];
        let cmd = read_group_cmd("chat", "hub-a", &streams, NEW_START, Some(READ_BLOCK));
        assert_eq!(
            args(&cmd),
            vec!["XREADGROUP", "GROUP", "chat", "hub-a", "COUNT", "64", "BLOCK", "2000", "STREAMS", "chat:0", ">"]
        );
    }
}
