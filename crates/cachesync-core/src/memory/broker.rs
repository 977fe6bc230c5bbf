//! In-process broker for single-host deployments and tests.
//!
//! Every [`MemoryBroker`] built from the same [`MemoryBus`] sees the others'
//! messages, which makes a bus behave like a tiny shared message system:
//!
//! ```text
//! MemoryBroker A ──publish──► MemoryBus (tokio broadcast) ──► MemoryBroker B listener
//!                                                         └─► MemoryBroker A listener
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    EventBroker, InvalidationHandler, Subscription, TopicWriters, aggregate_close,
    default_channel,
};
use crate::consumer::{EventSource, RetryPolicy, spawn_consumer};
use crate::error::{BrokerError, BrokerResult};
use crate::event::InvalidationEvent;

/// Default buffer size for the bus.
/// Receivers that fall further behind lose messages and report a read failure.
const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
struct BusMessage {
    channel: String,
    payload: String,
}

/// Shared in-process transport.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    fn send(&self, channel: &str, payload: String) -> usize {
        self.sender
            .send(BusMessage {
                channel: channel.to_string(),
                payload,
            })
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Number of active consumption loops on this bus.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Outbound channel for one topic.
pub struct MemoryTopicWriter {
    channel: String,
    bus: MemoryBus,
    closed: AtomicBool,
}

impl MemoryTopicWriter {
    fn new(channel: &str, bus: MemoryBus) -> Self {
        Self {
            channel: channel.to_string(),
            bus,
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, event: &InvalidationEvent) -> BrokerResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(self.bus.send(&self.channel, event.to_payload()?))
    }

    fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Broker over a [`MemoryBus`].
///
/// `topics` plays the role of the subscribed topic list: the listener only
/// sees messages sent to those channels (all channels when empty), and the
/// first entry is the default publish channel.
pub struct MemoryBroker {
    bus: MemoryBus,
    topics: Vec<String>,
    default_channel: String,
    writers: TopicWriters<MemoryTopicWriter>,
    policy: RetryPolicy,
    subscribed: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl MemoryBroker {
    pub fn new(bus: MemoryBus, topics: Vec<String>, policy: RetryPolicy) -> Self {
        let broker = Self {
            default_channel: default_channel(&topics),
            bus,
            topics,
            writers: TopicWriters::new(),
            policy,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        for topic in &broker.topics {
            broker.writer(topic);
        }
        broker
    }

    fn writer(&self, channel: &str) -> Arc<MemoryTopicWriter> {
        self.writers
            .get_or_create(channel, |c| MemoryTopicWriter::new(c, self.bus.clone()))
    }

    fn send(&self, channel: &str, event: InvalidationEvent) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let receivers = self.writer(channel).send(&event)?;
        tracing::debug!(
            channel = %channel,
            topic = %event.topic,
            key = %event.key,
            receivers,
            "message sent"
        );
        Ok(())
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, topic: &str, key: &str) -> BrokerResult<()> {
        self.send(&self.default_channel, InvalidationEvent::new(topic, key))
    }

    async fn publish_to(&self, channel: &str, key: &str) -> BrokerResult<()> {
        self.send(channel, InvalidationEvent::new(channel, key))
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> BrokerResult<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySubscribed);
        }

        let source = MemorySource {
            receiver: self.bus.subscribe(),
            topics: self.topics.clone(),
            attached: false,
        };
        Ok(spawn_consumer(
            source,
            handler,
            self.policy,
            self.cancel.child_token(),
        ))
    }

    async fn close(&self) -> BrokerResult<()> {
        tracing::info!("memory broker closing");
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let results = self
            .writers
            .snapshot()
            .into_iter()
            .map(|(topic, writer)| (format!("writer {topic}"), writer.close()));
        aggregate_close(results)?;

        tracing::info!("memory broker closed");
        Ok(())
    }
}

struct MemorySource {
    receiver: broadcast::Receiver<BusMessage>,
    topics: Vec<String>,
    // The receiver exists from subscribe() on; the first read reports that
    // as an empty poll instead of waiting for traffic.
    attached: bool,
}

impl MemorySource {
    fn accepts(&self, channel: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == channel)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn read(&mut self) -> BrokerResult<Vec<InvalidationEvent>> {
        if !self.attached {
            self.attached = true;
            return Ok(Vec::new());
        }
        match self.receiver.recv().await {
            Ok(message) => {
                if !self.accepts(&message.channel) {
                    return Ok(Vec::new());
                }
                match InvalidationEvent::from_payload(message.payload.as_bytes()) {
                    Ok(event) => Ok(vec![event]),
                    Err(e) => {
                        tracing::warn!(
                            channel = %message.channel,
                            error = %e,
                            "skipping undecodable message"
                        );
                        Ok(Vec::new())
                    }
                }
            }
            Err(RecvError::Lagged(missed)) => Err(BrokerError::read(format!(
                "listener lagged behind, {missed} messages lost"
            ))),
            Err(RecvError::Closed) => Err(BrokerError::read("memory bus closed")),
        }
    }
}
