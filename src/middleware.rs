//! Pre-invocation middlewares.
//!
//! Each middleware wraps an [`Action`] and returns a new one. The stack is
//! assembled once per task: retry innermost, then delay, fill and timeout
//! outermost, so the timeout bounds the whole padded call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::error::TaskError;
use crate::options::{ResolvedOptions, RetryPolicy};

/// Type-erased action as the engine runs it.
pub(crate) type Action<A, T> =
    Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, TaskError>> + Send + Sync>;

/// Erase a user action, mapping its error into [`TaskError::Action`].
pub(crate) fn erase<A, T, F, Fut, E>(action: F) -> Action<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(move |args: A| action(args).map(|outcome| outcome.map_err(TaskError::action)).boxed())
}

/// Apply every configured middleware to `action`.
pub(crate) fn stack<A, T>(
    action: Action<A, T>,
    options: &ResolvedOptions,
    name: Arc<str>,
) -> Action<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    let mut action = action;
    if options.retry != RetryPolicy::NoRetry {
        action = with_retry(action, options.retry, name.clone());
    }
    if let Some(delay) = options.delay {
        action = with_delay(action, delay, name.clone());
    }
    if let Some(fill) = options.fill {
        action = with_fill(action, fill, name.clone());
    }
    if let Some(timeout) = options.timeout {
        action = with_timeout(action, timeout, options.timeout_message.clone(), name);
    }
    action
}

/// Re-invoke the action after action errors, as allowed by `policy`.
fn with_retry<A, T>(action: Action<A, T>, policy: RetryPolicy, _name: Arc<str>) -> Action<A, T>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    Arc::new(move |args: A| {
        let action = action.clone();
        #[cfg(feature = "tracing")]
        let name = _name.clone();
        async move {
            let mut attempt = 0u8;
            loop {
                match action(args.clone()).await {
                    Err(TaskError::Action(_)) if policy.should_retry(attempt) => {
                        attempt += 1;
                        #[cfg(feature = "tracing")]
                        tracing::warn!(task = %name, retry = attempt, "task.retry");
                        let backoff = policy.backoff();
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                    outcome => return outcome,
                }
            }
        }
        .boxed()
    })
}

/// Sleep for `delay` before invoking the action.
fn with_delay<A, T>(action: Action<A, T>, delay: Duration, _name: Arc<str>) -> Action<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    Arc::new(move |args: A| {
        let action = action.clone();
        #[cfg(feature = "tracing")]
        tracing::debug!(task = %_name, delay_ms = delay.as_millis() as u64, "task.delay");
        async move {
            tokio::time::sleep(delay).await;
            action(args).await
        }
        .boxed()
    })
}

/// Pad the call so it takes at least `fill`, whether it succeeds or fails.
fn with_fill<A, T>(action: Action<A, T>, fill: Duration, _name: Arc<str>) -> Action<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    Arc::new(move |args: A| {
        let action = action.clone();
        #[cfg(feature = "tracing")]
        let name = _name.clone();
        async move {
            let started = Instant::now();
            let outcome = action(args).await;
            let elapsed = started.elapsed();
            if elapsed < fill {
                let remaining = fill - elapsed;
                #[cfg(feature = "tracing")]
                tracing::debug!(task = %name, sleep_ms = remaining.as_millis() as u64, "task.fill");
                tokio::time::sleep(remaining).await;
            }
            outcome
        }
        .boxed()
    })
}

/// Race the action against a timer. A late result is dropped with the
/// action's future.
fn with_timeout<A, T>(
    action: Action<A, T>,
    limit: Duration,
    message: String,
    _name: Arc<str>,
) -> Action<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    Arc::new(move |args: A| {
        let action = action.clone();
        let message = message.clone();
        #[cfg(feature = "tracing")]
        let name = _name.clone();
        async move {
            match tokio::time::timeout(limit, action(args)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(task = %name, timeout_ms = limit.as_millis() as u64, "task.timeout");
                    Err(TaskError::Timeout(message))
                }
            }
        }
        .boxed()
    })
}
