//! Redis Streams [`EventBroker`].
//!
//! Each topic maps to one stream (`<prefix><topic>`). Publishing is an
//! `XADD` carrying the JSON event in a `payload` field; consuming uses a
//! consumer group so that cooperating instances share one cursor per group.
//!
//! ```text
//! publish("orders", "42")
//!   → XADD cachesync:invalidations * payload {"topic":"orders","key":"42"}
//!   → XREADGROUP GROUP cachesync node-1 COUNT 64 BLOCK 1000 STREAMS cachesync:invalidations >
//!   → handler.handle("orders", "42")
//!   → XACK (next read)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cachesync_core::{
    BrokerError, BrokerResult, EventBroker, InvalidationEvent, InvalidationHandler, RetryPolicy,
    Subscription, TopicWriters, aggregate_close, default_channel, spawn_consumer,
};
use deadpool_redis::Pool;
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamBrokerConfig;
use crate::pool::{build_pool, mask_password, ping};
use crate::source::{PAYLOAD_FIELD, StreamSource, create_group};

/// Writer pool size; publishes are short and infrequent.
const WRITER_POOL_SIZE: usize = 4;

/// Outbound side for one topic's stream.
pub struct StreamTopicWriter {
    topic: String,
    stream: String,
    pool: Pool,
    maxlen: Option<usize>,
    // Keeps appends from one writer in submission order.
    send_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StreamTopicWriter {
    fn new(topic: &str, stream: String, pool: Pool, maxlen: Option<usize>) -> Self {
        Self {
            topic: topic.to_string(),
            stream,
            pool,
            maxlen,
            send_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    async fn send(&self, event: &InvalidationEvent) -> BrokerResult<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let payload = event.to_payload()?;
        let _ordered = self.send_lock.lock().await;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::publish(&self.topic, e.to_string()))?;

        let fields = [(PAYLOAD_FIELD, payload.as_str())];
        let appended: Result<String, RedisError> = match self.maxlen {
            Some(maxlen) => {
                conn.xadd_maxlen(&self.stream, StreamMaxlen::Approx(maxlen), "*", &fields)
                    .await
            }
            None => conn.xadd(&self.stream, "*", &fields).await,
        };
        appended.map_err(|e| BrokerError::publish(&self.topic, e.to_string()))
    }

    fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

/// Broker over Redis Streams with consumer groups.
pub struct RedisStreamBroker {
    config: StreamBrokerConfig,
    client: Client,
    pool: Pool,
    default_channel: String,
    writers: TopicWriters<StreamTopicWriter>,
    policy: RetryPolicy,
    subscribed: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl RedisStreamBroker {
    /// Validate the URL and build the writer pool.
    ///
    /// A malformed URL is an error. An unreachable server is only logged:
    /// publishes fail until it comes back, and the listener goes through
    /// the regular retry path.
    pub async fn connect(config: StreamBrokerConfig, policy: RetryPolicy) -> BrokerResult<Self> {
        let masked = mask_password(&config.url);
        let client =
            Client::open(config.url.as_str()).map_err(|e| BrokerError::connection(e.to_string()))?;
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let pool = build_pool(&config.url, WRITER_POOL_SIZE, probe_timeout)
            .map_err(|e| BrokerError::connection(e.to_string()))?;

        let reachable = match tokio::time::timeout(probe_timeout, ping(&pool)).await {
            Ok(Ok(())) => {
                info!(url = %masked, "connected to Redis Streams");
                true
            }
            Ok(Err(e)) => {
                warn!(url = %masked, error = %e, "Redis Streams not reachable yet");
                false
            }
            Err(_) => {
                warn!(url = %masked, "Redis Streams probe timed out");
                false
            }
        };

        let broker = Self {
            default_channel: default_channel(&config.topics),
            config,
            client,
            pool,
            writers: TopicWriters::new(),
            policy,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        for topic in broker.config.topics.clone() {
            broker.writer(&topic);
        }
        if reachable {
            broker.provision_groups().await;
        }
        Ok(broker)
    }

    /// Create the consumer group on every subscribed stream. Failures are
    /// logged; the reader provisions again before its first read.
    async fn provision_groups(&self) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "skipping consumer group provisioning");
                return;
            }
        };
        for stream in self.subscribed_streams() {
            if let Err(e) = create_group(&mut *conn, &stream, &self.config.group_id).await {
                warn!(stream = %stream, error = %e, "consumer group provisioning failed");
            }
        }
    }

    fn writer(&self, topic: &str) -> Arc<StreamTopicWriter> {
        self.writers.get_or_create(topic, |t| {
            StreamTopicWriter::new(
                t,
                self.config.stream_key(t),
                self.pool.clone(),
                self.config.stream_maxlen,
            )
        })
    }

    async fn send(&self, channel: &str, event: InvalidationEvent) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let writer = self.writer(channel);
        let id = writer.send(&event).await?;
        debug!(
            stream = %writer.stream(),
            topic = %event.topic,
            key = %event.key,
            id = %id,
            "event appended"
        );
        Ok(())
    }

    /// Streams the listener consumes. Falls back to the default channel so
    /// that an empty topic list still hears its own publishes.
    fn subscribed_streams(&self) -> Vec<String> {
        if self.config.topics.is_empty() {
            vec![self.config.stream_key(&self.default_channel)]
        } else {
            self.config
                .topics
                .iter()
                .map(|t| self.config.stream_key(t))
                .collect()
        }
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    pub fn config(&self) -> &StreamBrokerConfig {
        &self.config
    }
}

#[async_trait]
impl EventBroker for RedisStreamBroker {
    fn name(&self) -> &str {
        "redis-streams"
    }

    async fn publish(&self, topic: &str, key: &str) -> BrokerResult<()> {
        self.send(&self.default_channel, InvalidationEvent::new(topic, key))
            .await
    }

    async fn publish_to(&self, channel: &str, key: &str) -> BrokerResult<()> {
        self.send(channel, InvalidationEvent::new(channel, key)).await
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> BrokerResult<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySubscribed);
        }

        let streams = self.subscribed_streams();
        let consumer = self.config.resolve_consumer_name();
        info!(
            streams = ?streams,
            group = %self.config.group_id,
            consumer = %consumer,
            "subscribing to invalidation streams"
        );

        let source = StreamSource::new(
            self.client.clone(),
            streams,
            self.config.group_id.clone(),
            consumer,
            self.config.reader.clone(),
        );
        Ok(spawn_consumer(
            source,
            handler,
            self.policy,
            self.cancel.child_token(),
        ))
    }

    async fn close(&self) -> BrokerResult<()> {
        info!("redis streams broker closing");
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let results = self
            .writers
            .snapshot()
            .into_iter()
            .map(|(topic, writer)| (format!("writer {topic}"), writer.close()));
        let outcome = aggregate_close(results);
        self.pool.close();

        outcome?;
        info!("redis streams broker closed");
        Ok(())
    }
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("url", &mask_password(&self.config.url))
            .field("topics", &self.writers.topics())
            .field("group", &self.config.group_id)
            .finish()
    }
}
