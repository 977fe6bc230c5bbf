//! Event broker abstraction.
//!
//! A broker carries [`InvalidationEvent`](crate::InvalidationEvent)s between
//! instances that share a cache backend. Publishing goes through one lazily
//! created [`TopicWriters`] entry per channel; consumption runs as a single
//! background loop per broker (see [`crate::consumer`]).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consumer::ConsumerState;
use crate::error::{BrokerError, BrokerResult};

/// Channel used by [`EventBroker::publish`] when no topic is configured.
pub const DEFAULT_CHANNEL: &str = "default";

/// Pick the default publish channel from a configured topic list.
pub fn default_channel(topics: &[String]) -> String {
    topics
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string())
}

/// Receiver side of the broker.
///
/// Handlers are invoked sequentially by the consumption loop. They must not
/// fail: anything that goes wrong is logged inside the handler and the loop
/// moves on to the next message.
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    /// Unique name for this handler (for logging).
    fn name(&self) -> &str {
        "invalidation"
    }

    /// Handle one received invalidation.
    async fn handle(&self, topic: &str, key: &str);
}

/// Publish/subscribe over an external messaging system.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Send `{topic, key}` on the broker's default channel.
    async fn publish(&self, topic: &str, key: &str) -> BrokerResult<()>;

    /// Send `{channel, key}` on an explicit channel.
    async fn publish_to(&self, channel: &str, key: &str) -> BrokerResult<()>;

    /// Start the broker's single consumption loop.
    ///
    /// Fails with [`BrokerError::AlreadySubscribed`] on a second call.
    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> BrokerResult<Subscription>;

    /// Stop consumption and close every writer.
    async fn close(&self) -> BrokerResult<()>;
}

/// Type alias for a shareable broker.
pub type DynEventBroker = Arc<dyn EventBroker>;

/// Handle to a running consumption loop.
pub struct Subscription {
    handle: JoinHandle<BrokerResult<()>>,
    cancel: CancellationToken,
    state: Arc<ConsumerState>,
}

impl Subscription {
    pub fn new(
        handle: JoinHandle<BrokerResult<()>>,
        cancel: CancellationToken,
        state: Arc<ConsumerState>,
    ) -> Self {
        Self {
            handle,
            cancel,
            state,
        }
    }

    /// Live counters of the loop.
    pub fn state(&self) -> Arc<ConsumerState> {
        Arc::clone(&self.state)
    }

    /// Ask the loop to stop at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end.
    ///
    /// Returns `Ok(())` after cancellation and
    /// [`BrokerError::ConsumerExhausted`] when the loop gave up.
    pub async fn wait(self) -> BrokerResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(BrokerError::read(format!("consumer task failed: {e}"))),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("finished", &self.handle.is_finished())
            .field("state", &self.state)
            .finish()
    }
}

/// Topic → writer registry with lazy, mutually exclusive creation.
///
/// Lookups take the read lock. Creation takes the write lock and re-checks,
/// so concurrent first publishes to one topic end up sharing a single writer.
pub struct TopicWriters<W> {
    writers: RwLock<HashMap<String, Arc<W>>>,
}

impl<W> TopicWriters<W> {
    pub fn new() -> Self {
        Self {
            writers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<W>> {
        self.writers.read().get(topic).cloned()
    }

    /// Return the writer for `topic`, creating it with `create` if needed.
    pub fn get_or_create<F>(&self, topic: &str, create: F) -> Arc<W>
    where
        F: FnOnce(&str) -> W,
    {
        if let Some(writer) = self.get(topic) {
            return writer;
        }

        let mut writers = self.writers.write();
        if let Some(writer) = writers.get(topic) {
            return Arc::clone(writer);
        }

        let writer = Arc::new(create(topic));
        writers.insert(topic.to_string(), Arc::clone(&writer));
        tracing::info!(topic = %topic, "created writer for topic");
        writer
    }

    /// Current writers, for closing.
    pub fn snapshot(&self) -> Vec<(String, Arc<W>)> {
        self.writers
            .read()
            .iter()
            .map(|(topic, writer)| (topic.clone(), Arc::clone(writer)))
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.writers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.writers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.read().is_empty()
    }
}

impl<W> Default for TopicWriters<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold per-resource close results into one outcome.
///
/// Every resource has already been closed by the time this runs; failures
/// are reported together.
pub fn aggregate_close<I>(results: I) -> BrokerResult<()>
where
    I: IntoIterator<Item = (String, BrokerResult<()>)>,
{
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|(resource, result)| result.err().map(|e| format!("{resource}: {e}")))
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::Close(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_channel() {
        assert_eq!(default_channel(&[]), "default");
        assert_eq!(
            default_channel(&["orders".to_string(), "users".to_string()]),
            "orders"
        );
    }

    #[test]
    fn test_get_or_create_reuses_writer() {
        let writers: TopicWriters<String> = TopicWriters::new();
        let first = writers.get_or_create("orders", |t| format!("writer-{t}"));
        let second = writers.get_or_create("orders", |_| panic!("must not create twice"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(writers.len(), 1);
        assert_eq!(writers.topics(), vec!["orders".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_first_use_creates_one_writer() {
        let writers: Arc<TopicWriters<usize>> = Arc::new(TopicWriters::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let writers = Arc::clone(&writers);
            let created = Arc::clone(&created);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                writers.get_or_create("fresh-topic", |_| created.fetch_add(1, Ordering::SeqCst))
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(writers.len(), 1);
    }

    #[test]
    fn test_aggregate_close_reports_all_failures() {
        assert!(aggregate_close(vec![("reader".to_string(), Ok(()))]).is_ok());

        let err = aggregate_close(vec![
            ("reader".to_string(), Err(BrokerError::connection("reset"))),
            ("writer orders".to_string(), Ok(())),
            ("writer users".to_string(), Err(BrokerError::Closed)),
        ])
        .unwrap_err();

        match err {
            BrokerError::Close(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("reader:"));
                assert!(failures[1].starts_with("writer users:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
