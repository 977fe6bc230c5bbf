//! Broker consumption loop with fixed-backoff retries.
//!
//! ```text
//!            success                      failure (n < max)
//!   Reading ─────────► Reading    Reading ─────────────────► Backoff(n) ──► Reading
//!                                 Backoff(n) ── failure, n >= max ──► Fatal
//! ```
//!
//! Any successful read (including an empty poll) resets the failure streak.
//! Reaching the limit ends the loop with
//! [`BrokerError::ConsumerExhausted`]; deciding to exit the process is left to
//! the caller holding the [`Subscription`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::{InvalidationHandler, Subscription};
use crate::error::{BrokerError, BrokerResult};
use crate::event::InvalidationEvent;

/// Default number of consecutive read failures before giving up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default pause between failed reads.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Retry limits for the consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_consecutive_failures: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_consecutive_failures: u32, backoff: Duration) -> Self {
        Self {
            // A limit of zero would abort before the first retry.
            max_consecutive_failures: max_consecutive_failures.max(1),
            backoff,
        }
    }
}

/// Broker-specific reader driven by [`run_consumer`].
#[async_trait]
pub trait EventSource: Send {
    /// Block until at least one message arrives or the broker's poll window
    /// elapses. An empty batch is a successful read.
    async fn read(&mut self) -> BrokerResult<Vec<InvalidationEvent>>;
}

/// Shared counters describing a consumption loop.
#[derive(Debug, Default)]
pub struct ConsumerState {
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    messages_handled: AtomicU64,
    ready: AtomicBool,
}

impl ConsumerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Acquire)
    }

    pub fn messages_handled(&self) -> u64 {
        self.messages_handled.load(Ordering::Acquire)
    }

    /// True after a successful read and until the next failed one.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns true on a not-ready → ready transition.
    fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        !self.ready.swap(true, Ordering::AcqRel)
    }

    /// Returns the new streak length.
    fn record_failure(&self) -> u32 {
        self.ready.store(false, Ordering::Release);
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::AcqRel);
    }
}

/// Run the consumption loop until cancelled or exhausted.
pub async fn run_consumer<S>(
    mut source: S,
    handler: Arc<dyn InvalidationHandler>,
    policy: RetryPolicy,
    state: Arc<ConsumerState>,
    cancel: CancellationToken,
) -> BrokerResult<()>
where
    S: EventSource,
{
    info!(
        handler = handler.name(),
        max_failures = policy.max_consecutive_failures,
        backoff_ms = policy.backoff.as_millis() as u64,
        "consumer started"
    );

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("consumer stopped");
                return Ok(());
            }
            read = source.read() => read,
        };

        match read {
            Ok(events) => {
                if state.record_success() {
                    info!("consumer ready");
                }
                for event in events {
                    debug!(topic = %event.topic, key = %event.key, "invalidation received");
                    handler.handle(&event.topic, &event.key).await;
                    state.record_message();
                }
            }
            Err(e) => {
                let failures = state.record_failure();
                error!(
                    attempt = failures,
                    max = policy.max_consecutive_failures,
                    error = %e,
                    "consumer read failed"
                );
                if failures >= policy.max_consecutive_failures {
                    error!(failures, "consumer aborted after max retry limit");
                    return Err(BrokerError::ConsumerExhausted {
                        failures,
                        last_error: e.to_string(),
                    });
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("consumer stopped during backoff");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(policy.backoff) => {}
                }
            }
        }
    }
}

/// Spawn [`run_consumer`] on the runtime and return its handle.
pub fn spawn_consumer<S>(
    source: S,
    handler: Arc<dyn InvalidationHandler>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Subscription
where
    S: EventSource + 'static,
{
    let state = Arc::new(ConsumerState::new());
    let handle = tokio::spawn(run_consumer(
        source,
        handler,
        policy,
        Arc::clone(&state),
        cancel.clone(),
    ));
    Subscription::new(handle, cancel, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Replays a fixed script, then cancels the loop.
    struct ScriptedSource {
        script: VecDeque<Result<Vec<InvalidationEvent>, String>>,
        reads: Arc<AtomicU32>,
        cancel: CancellationToken,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<Result<Vec<InvalidationEvent>, String>>,
            cancel: CancellationToken,
        ) -> (Self, Arc<AtomicU32>) {
            let reads = Arc::new(AtomicU32::new(0));
            let source = Self {
                script: script.into(),
                reads: Arc::clone(&reads),
                cancel,
            };
            (source, reads)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn read(&mut self) -> BrokerResult<Vec<InvalidationEvent>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(Ok(events)) => Ok(events),
                Some(Err(e)) => Err(BrokerError::read(e)),
                None => {
                    self.cancel.cancel();
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Fails every read.
    struct BrokenSource {
        reads: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventSource for BrokenSource {
        async fn read(&mut self) -> BrokerResult<Vec<InvalidationEvent>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::connection("broker unreachable"))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl InvalidationHandler for RecordingHandler {
        async fn handle(&self, topic: &str, key: &str) {
            self.seen.lock().await.push((topic.to_string(), key.to_string()));
        }
    }

    fn fast_policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_millis(1))
    }

    fn fail() -> Result<Vec<InvalidationEvent>, String> {
        Err("read timeout".to_string())
    }

    #[tokio::test]
    async fn test_failures_below_limit_reset_on_success() {
        let cancel = CancellationToken::new();
        let (source, reads) = ScriptedSource::new(
            vec![fail(), fail(), Ok(vec![InvalidationEvent::new("orders", "42")])],
            cancel.clone(),
        );
        let handler = Arc::new(RecordingHandler::default());
        let state = Arc::new(ConsumerState::new());

        let result = run_consumer(
            source,
            handler.clone(),
            fast_policy(3),
            Arc::clone(&state),
            cancel,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.total_failures(), 2);
        assert_eq!(state.messages_handled(), 1);
        assert!(state.is_ready());
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(
            *handler.seen.lock().await,
            vec![("orders".to_string(), "42".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_accumulate_across_successes() {
        let cancel = CancellationToken::new();
        let ok = || Ok(Vec::new());
        let (source, _) = ScriptedSource::new(
            vec![fail(), fail(), ok(), fail(), fail(), ok(), fail(), fail()],
            cancel.clone(),
        );
        let state = Arc::new(ConsumerState::new());

        let result = run_consumer(
            source,
            Arc::new(RecordingHandler::default()),
            fast_policy(3),
            Arc::clone(&state),
            cancel,
        )
        .await;

        assert!(result.is_ok(), "six failures in streaks of two must not abort");
        assert_eq!(state.total_failures(), 6);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported_exactly_once() {
        let reads = Arc::new(AtomicU32::new(0));
        let source = BrokenSource {
            reads: Arc::clone(&reads),
        };
        let subscription = spawn_consumer(
            source,
            Arc::new(RecordingHandler::default()),
            fast_policy(3),
            CancellationToken::new(),
        );
        let state = subscription.state();

        let err = subscription.wait().await.unwrap_err();
        match err {
            BrokerError::ConsumerExhausted { failures, .. } => assert_eq!(failures, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.consecutive_failures(), 3);
        assert!(!state.is_ready());

        // The loop is gone: no further reads happen.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_loop() {
        let reads = Arc::new(AtomicU32::new(0));
        let subscription = spawn_consumer(
            BrokenSource {
                reads: Arc::clone(&reads),
            },
            Arc::new(RecordingHandler::default()),
            RetryPolicy::new(10, Duration::from_secs(60)),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        subscription.cancel();
        assert!(subscription.wait().await.is_ok());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_consecutive_failures, 1);
    }

    #[test]
    fn test_ready_transition_reported_once() {
        let state = ConsumerState::new();
        assert!(state.record_success());
        assert!(!state.record_success());
        assert_eq!(state.record_failure(), 1);
        assert!(state.record_success());
    }
}
