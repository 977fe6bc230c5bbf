//! Consumer-group reader feeding the shared consumption loop.

use std::time::Duration;

use async_trait::async_trait;
use cachesync_core::{BrokerError, BrokerResult, EventSource, InvalidationEvent};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use tracing::{debug, info, warn};

use crate::config::StreamReaderConfig;

/// Field holding the JSON-encoded event in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// `XGROUP CREATE <stream> <group> $ MKSTREAM`. An existing group is fine.
pub(crate) async fn create_group<C>(
    conn: &mut C,
    stream: &str,
    group: &str,
) -> Result<(), RedisError>
where
    C: AsyncCommands,
{
    let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "$").await;
    match created {
        Ok(()) => {
            info!(stream = %stream, group = %group, "consumer group created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream = %stream, group = %group, "consumer group exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Reads new entries for one consumer in a group.
///
/// Uses its own connection because `XREADGROUP ... BLOCK` parks the
/// connection for up to `max_wait_ms`. After any failure the connection is
/// dropped and reopened on the next read.
///
/// Entries are acknowledged at the start of the following read, after the
/// loop has handed the previous batch to the handler. Whatever is still
/// pending for this consumer (a lost reply, a crash before the ack) is
/// replayed with id `0` after every (re)connect, before new entries are
/// requested with `>`. Replay across restarts needs a stable
/// `consumer_name`; the generated `hostname-pid` changes with the process.
pub(crate) struct StreamSource {
    client: Client,
    streams: Vec<String>,
    group: String,
    consumer: String,
    reader: StreamReaderConfig,
    conn: Option<MultiplexedConnection>,
    groups_ready: bool,
    backlog_drained: bool,
    unacked: Vec<(String, String)>,
}

impl StreamSource {
    pub(crate) fn new(
        client: Client,
        streams: Vec<String>,
        group: String,
        consumer: String,
        reader: StreamReaderConfig,
    ) -> Self {
        Self {
            client,
            streams,
            group,
            consumer,
            reader,
            conn: None,
            groups_ready: false,
            backlog_drained: false,
            unacked: Vec::new(),
        }
    }

    async fn connection(&mut self) -> BrokerResult<MultiplexedConnection> {
        if let Some(conn) = &self.conn {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::connection(e.to_string()))?;
        debug!(consumer = %self.consumer, "stream reader connected");
        self.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn ensure_groups(&mut self, conn: &mut MultiplexedConnection) -> BrokerResult<()> {
        if self.groups_ready {
            return Ok(());
        }
        for stream in &self.streams {
            create_group(conn, stream, &self.group)
                .await
                .map_err(|e| BrokerError::connection(e.to_string()))?;
        }
        self.groups_ready = true;
        Ok(())
    }

    async fn ack_delivered(&mut self, conn: &mut MultiplexedConnection) -> BrokerResult<()> {
        while let Some((stream, id)) = self.unacked.last() {
            let _: u64 = conn
                .xack(stream, &self.group, &[id])
                .await
                .map_err(|e| BrokerError::read(format!("XACK failed: {e}")))?;
            self.unacked.pop();
        }
        Ok(())
    }

    fn decode(&mut self, reply: StreamReadReply) -> Vec<InvalidationEvent> {
        let mut events = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                self.unacked.push((stream.key.clone(), entry.id.clone()));

                let Some(payload) = entry.get::<Vec<u8>>(PAYLOAD_FIELD) else {
                    warn!(stream = %stream.key, id = %entry.id, "skipping entry without payload");
                    continue;
                };
                if payload.len() > self.reader.max_payload_bytes {
                    warn!(
                        stream = %stream.key,
                        id = %entry.id,
                        size = payload.len(),
                        max = self.reader.max_payload_bytes,
                        "skipping oversized entry"
                    );
                    continue;
                }
                match InvalidationEvent::from_payload(&payload) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(
                        stream = %stream.key,
                        id = %entry.id,
                        error = %e,
                        "skipping undecodable entry"
                    ),
                }
            }
        }
        events
    }

    /// `BLOCK 0` waits forever, so the wait is at least one millisecond.
    fn block_ms(&self) -> u64 {
        self.reader.max_wait_ms.max(1)
    }

    /// Decode a reply to the pending-entries read. An empty reply means the
    /// backlog is drained and later reads switch to `>`.
    fn take_backlog(&mut self, reply: Option<StreamReadReply>) -> Option<Vec<InvalidationEvent>> {
        let reply = reply.filter(|r| r.keys.iter().any(|k| !k.ids.is_empty()));
        match reply {
            Some(reply) => {
                let pending: usize = reply.keys.iter().map(|k| k.ids.len()).sum();
                info!(consumer = %self.consumer, pending, "redelivering pending entries");
                Some(self.decode(reply))
            }
            None => {
                self.backlog_drained = true;
                None
            }
        }
    }

    async fn read_batch(&mut self) -> BrokerResult<Vec<InvalidationEvent>> {
        let mut conn = self.connection().await?;
        self.ensure_groups(&mut conn).await?;
        self.ack_delivered(&mut conn).await?;

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.reader.batch_size.max(1));

        if !self.backlog_drained {
            let ids = vec!["0"; self.streams.len()];
            let reply: Option<StreamReadReply> = conn
                .xread_options(&self.streams, &ids, &options)
                .await
                .map_err(|e| BrokerError::read(e.to_string()))?;
            if let Some(events) = self.take_backlog(reply) {
                return Ok(events);
            }
        }

        let options = options.block(self.block_ms() as usize);
        let ids = vec![">"; self.streams.len()];
        let reply: Option<StreamReadReply> = conn
            .xread_options(&self.streams, &ids, &options)
            .await
            .map_err(|e| BrokerError::read(e.to_string()))?;

        Ok(reply.map(|r| self.decode(r)).unwrap_or_default())
    }
}

#[async_trait]
impl EventSource for StreamSource {
    async fn read(&mut self) -> BrokerResult<Vec<InvalidationEvent>> {
        let wait = Duration::from_millis(self.block_ms());
        // Guard against a server that never answers the blocking read.
        let deadline = wait + Duration::from_secs(5);
        let result = match tokio::time::timeout(deadline, self.read_batch()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::read(format!(
                "stream read timed out after {}ms",
                deadline.as_millis()
            ))),
        };
        if result.is_err() {
            self.conn = None;
            self.groups_ready = false;
            self.backlog_drained = false;
        }
        result
    }
}
