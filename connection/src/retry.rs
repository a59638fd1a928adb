//! Bounded retry loops with cooperative cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::ConnectionError;

/// How many attempts an operation gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

#[derive(Debug, Default)]
struct SignalInner {
    triggered: AtomicBool,
    notify: Notify,
}

/// Cancellation signal shared by a connection and its tasks.
///
/// Once triggered it stays triggered; a reconnect installs a fresh signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal and wake every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is triggered.
    pub async fn triggered(&self) {
        loop {
            // Register before checking the flag so a trigger in between is not lost
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Sleep for `duration` unless `signal` fires first.
pub async fn sleep_or_shutdown(
    duration: Duration,
    signal: &ShutdownSignal,
) -> Result<(), ConnectionError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = signal.triggered() => Err(ConnectionError::Cancelled),
    }
}

/// Run `attempt` until it succeeds, fails permanently or the budget is spent.
///
/// `on_failure` sees every failed attempt with its 1-based number. Cancellation
/// ends the loop at once with [`ConnectionError::Cancelled`], non-retryable errors are
/// returned as they are, and exhaustion yields [`ConnectionError::ConnectionLost`].
pub async fn execute_with_retry<T, F, Fut, R>(
    operation: &str,
    policy: RetryPolicy,
    signal: &ShutdownSignal,
    mut attempt: F,
    mut on_failure: R,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
    R: FnMut(u32, &ConnectionError),
{
    let attempts = policy.attempts.max(1);

    for number in 1..=attempts {
        if signal.is_triggered() {
            return Err(ConnectionError::Cancelled);
        }

        let result = tokio::select! {
            result = attempt() => result,
            _ = signal.triggered() => Err(ConnectionError::Cancelled),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(ConnectionError::Cancelled) => return Err(ConnectionError::Cancelled),
            Err(err) => {
                on_failure(number, &err);
                if !err.is_retryable() {
                    return Err(err);
                }
                debug!(operation, attempt = number, attempts, error = %err, "Attempt failed");
                if number < attempts {
                    sleep_or_shutdown(policy.interval, signal).await?;
                }
            }
        }
    }

    Err(ConnectionError::ConnectionLost {
        operation: operation.to_string(),
        attempts,
    })
}
