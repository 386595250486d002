//! Retry policy and the executor that applies it.
//!
//! A [`RetryPolicy`] pairs a [`TransientClassifier`] (which failures are worth
//! retrying) with a [`BackoffPolicy`] (how often and how long to wait). The
//! [`RetryExecutor`] drives an async action through that policy:
//!
//! 1. run the action;
//! 2. on a non-transient failure, return it at once;
//! 3. on a transient failure, ask the schedule; on `Stop` return the failure,
//!    otherwise wait and go to 1.
//!
//! Both the action and the wait race against a cancellation token.
//! Cancellation ends the loop with [`ClientError::Cancelled`].

use std::{fmt, future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backoff::{BackoffPolicy, ExponentialBackoff, RetryDecision},
    error::{ClientError, Result},
};

/// Decides whether a failure is worth retrying.
pub trait TransientClassifier: Send + Sync {
    fn is_transient(&self, error: &ClientError) -> bool;
}

impl<F> TransientClassifier for F
where
    F: Fn(&ClientError) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &ClientError) -> bool {
        self(error)
    }
}

/// Classifies by error kind: see [`ClientError::is_transient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl TransientClassifier for DefaultClassifier {
    fn is_transient(&self, error: &ClientError) -> bool {
        error.is_transient()
    }
}

/// Classifier plus backoff schedule.
///
/// Cheap to clone; the kernel snapshots the current policy at the start of
/// every operation so replacing it never affects an operation in flight.
#[derive(Clone)]
pub struct RetryPolicy {
    classifier: Arc<dyn TransientClassifier>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl RetryPolicy {
    pub fn new(
        classifier: impl TransientClassifier + 'static,
        backoff: impl BackoffPolicy + 'static,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            backoff: Arc::new(backoff),
        }
    }

    /// Default classification with a custom schedule.
    pub fn with_backoff(backoff: impl BackoffPolicy + 'static) -> Self {
        Self::new(DefaultClassifier, backoff)
    }

    pub fn is_transient(&self, error: &ClientError) -> bool {
        self.classifier.is_transient(error)
    }

    pub fn decide(&self, attempt: u32, error: &ClientError) -> RetryDecision {
        self.backoff.decide(attempt, error)
    }
}

impl Default for RetryPolicy {
    /// Unbounded exponential backoff (100ms, capped at 10s) over the default classifier.
    fn default() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

type RetryHook<'a> = Box<dyn Fn(&ClientError, u32, Duration) + Send + Sync + 'a>;

/// Runs an async action under a [`RetryPolicy`].
///
/// # Examples
///
/// ```ignore
/// let executor = RetryExecutor::new(RetryPolicy::default());
/// let twin = executor
///     .run(&cancel, || async { session.get_twin().await.map_err(Into::into) })
///     .await?;
/// ```
pub struct RetryExecutor<'a> {
    policy: RetryPolicy,
    first_attempt: u32,
    on_retry: Option<RetryHook<'a>>,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            first_attempt: 0,
            on_retry: None,
        }
    }

    /// Continues an attempt sequence that already granted `attempt` retries.
    pub fn starting_at(mut self, attempt: u32) -> Self {
        self.first_attempt = attempt;
        self
    }

    /// Registers a hook invoked before every backoff wait with the failure,
    /// the attempt number and the delay about to be applied.
    pub fn on_retry(mut self, hook: impl Fn(&ClientError, u32, Duration) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Runs `action` until it succeeds, fails permanently, exhausts the
    /// policy, or `cancel` fires.
    ///
    /// # Returns
    /// - `Ok(T)`: the first successful result
    /// - `Err(ClientError::Cancelled)`: the token fired during the action or a wait
    /// - `Err(e)`: the last failure when it is permanent or the schedule stopped
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = self.first_attempt;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                outcome = action() => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if matches!(err, ClientError::Cancelled) || !self.policy.is_transient(&err) {
                debug!(error = %err, "Permanent failure, not retrying");
                return Err(err);
            }

            let delay = match self.policy.decide(attempt, &err) {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::Stop => {
                    warn!(attempt, error = %err, "Retry policy exhausted");
                    return Err(err);
                }
            };

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            if let Some(hook) = &self.on_retry {
                hook(&err, attempt, delay);
            }

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{
        backoff::{FixedDelay, NoRetry},
        error::TransportError,
    };

    fn fast(max_retries: Option<u32>) -> RetryPolicy {
        RetryPolicy::with_backoff(FixedDelay::new(max_retries, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast(None));

        let result = executor
            .run(&CancellationToken::new(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(TransportError::Network("reset".into()).into())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast(None));

        let result: Result<()> = executor
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Unauthorized("sig".into()).into())
            })
            .await;

        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::Unauthorized(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_when_policy_is_exhausted() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast(Some(2)));

        let result: Result<()> = executor
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::ServerBusy("busy".into()).into())
            })
            .await;

        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::ServerBusy(_)))
        ));
        // one initial try plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::with_backoff(NoRetry));

        let result: Result<()> = executor
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Network("down".into()).into())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let policy = RetryPolicy::with_backoff(FixedDelay::new(None, Duration::from_secs(3600)));
        let executor = RetryExecutor::new(policy);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result: Result<()> = executor
            .run(&cancel, || async {
                Err(TransportError::Network("down".into()).into())
            })
            .await;

        assert_eq!(result, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_action() {
        let executor = RetryExecutor::new(fast(None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = executor
            .run(&cancel, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_hook_sees_attempt_numbers() {
        let seen = Mutex::new(Vec::new());
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(fast(None))
            .starting_at(1)
            .on_retry(|_, attempt, _| seen.lock().unwrap().push(attempt));

        let _ = executor
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Timeout("slow".into()).into())
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            |e: &ClientError| matches!(e, ClientError::Transport(TransportError::Protocol(_))),
            FixedDelay::new(Some(1), Duration::ZERO),
        );
        let executor = RetryExecutor::new(policy);

        let result: Result<()> = executor
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Protocol("odd frame".into()).into())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
