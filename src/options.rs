//! Task configuration.
//!
//! [`TaskOptions`] is plain data so it can be loaded from configuration
//! files. Every field is optional; options are layered (builder calls over
//! explicit options over [`Context`](crate::Context) defaults) and resolved
//! once when the task is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DEFAULT_TIMEOUT_MESSAGE;

/// Automatic re-invocation of the action after action errors, before the
/// task transitions. Timeouts, parse errors and cancellations are never
/// retried; [`Task::reload`](crate::Task::reload) stays the manual retry.
///
/// In configuration: `{"kind": "retry", "maxAttempts": 3, "backoffMs": 100}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RetryPolicy {
    /// Fail on the first action error.
    #[default]
    NoRetry,
    /// Re-invoke up to `max_attempts` more times, sleeping `backoff_ms`
    /// between attempts.
    Retry {
        /// Attempts after the first one.
        #[serde(rename = "maxAttempts")]
        max_attempts: u8,
        /// Fixed pause between attempts, in milliseconds.
        #[serde(rename = "backoffMs", default)]
        backoff_ms: u64,
    },
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times, back to back.
    pub const fn retries(max_attempts: u8) -> Self {
        Self::Retry {
            max_attempts,
            backoff_ms: 0,
        }
    }

    /// Retry up to `max_attempts` times, pausing `backoff_ms` in between.
    pub const fn retries_with_backoff(max_attempts: u8, backoff_ms: u64) -> Self {
        Self::Retry {
            max_attempts,
            backoff_ms,
        }
    }

    /// Whether another attempt is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u8) -> bool {
        match self {
            Self::NoRetry => false,
            Self::Retry { max_attempts, .. } => attempt < *max_attempts,
        }
    }

    /// Pause before the next attempt.
    pub fn backoff(&self) -> Duration {
        match self {
            Self::NoRetry => Duration::ZERO,
            Self::Retry { backoff_ms, .. } => Duration::from_millis(*backoff_ms),
        }
    }
}

/// Construction options for a task. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskOptions {
    /// Identifier used in log events and as the snapshot key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Serialize overlapping calls instead of dropping them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    /// Sleep before invoking the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Pad the observed latency up to at least this duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<u64>,
    /// Fail the call if the action takes longer than this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Message carried by the timeout error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_message: Option<String>,
    /// Time-to-live of cache entries and persisted snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Enable the argument-keyed result cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    /// Automatic retry of action failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskOptions {
    /// Layer `self` over `base`: fields set on `self` win.
    pub fn layered_over(self, base: &TaskOptions) -> TaskOptions {
        TaskOptions {
            name: self.name.or_else(|| base.name.clone()),
            queued: self.queued.or(base.queued),
            delay: self.delay.or(base.delay),
            fill: self.fill.or(base.fill),
            timeout: self.timeout.or(base.timeout),
            timeout_message: self
                .timeout_message
                .or_else(|| base.timeout_message.clone()),
            expires_in: self.expires_in.or(base.expires_in),
            cached: self.cached.or(base.cached),
            retry: self.retry.or(base.retry),
        }
    }

    pub(crate) fn resolve(&self) -> ResolvedOptions {
        ResolvedOptions {
            queued: self.queued.unwrap_or(false),
            delay: non_zero(self.delay),
            fill: non_zero(self.fill),
            timeout: non_zero(self.timeout),
            timeout_message: self
                .timeout_message
                .clone()
                .unwrap_or_else(|| DEFAULT_TIMEOUT_MESSAGE.to_string()),
            expires_in: non_zero(self.expires_in),
            cached: self.cached.unwrap_or(false),
            retry: self.retry.unwrap_or_default(),
        }
    }
}

/// Options with defaults applied. Zero durations mean "disabled".
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub(crate) queued: bool,
    pub(crate) delay: Option<Duration>,
    pub(crate) fill: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) timeout_message: String,
    pub(crate) expires_in: Option<Duration>,
    pub(crate) cached: bool,
    pub(crate) retry: RetryPolicy,
}

fn non_zero(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_should_retry() {
        let no_retry = RetryPolicy::NoRetry;
        assert!(!no_retry.should_retry(0));
        assert!(!no_retry.should_retry(1));

        let retry_3 = RetryPolicy::retries(3);
        assert!(retry_3.should_retry(0));
        assert!(retry_3.should_retry(2));
        assert!(!retry_3.should_retry(3));
        assert!(!retry_3.should_retry(4));
    }

    #[test]
    fn retry_policy_backoff() {
        assert_eq!(RetryPolicy::NoRetry.backoff(), Duration::ZERO);
        assert_eq!(
            RetryPolicy::retries_with_backoff(3, 100).backoff(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn retry_policy_config_shape() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"kind":"retry","maxAttempts":4}"#)
            .expect("policy should deserialize");
        assert_eq!(policy, RetryPolicy::retries(4));
        assert_eq!(
            serde_json::to_value(RetryPolicy::NoRetry).ok(),
            Some(serde_json::json!({"kind": "noRetry"}))
        );
    }

    #[test]
    fn explicit_fields_win_when_layering() {
        let base = TaskOptions {
            queued: Some(true),
            timeout: Some(1_000),
            timeout_message: Some("base".into()),
            ..Default::default()
        };
        let top = TaskOptions {
            timeout: Some(50),
            cached: Some(true),
            ..Default::default()
        };

        let layered = top.layered_over(&base);
        assert_eq!(layered.queued, Some(true));
        assert_eq!(layered.timeout, Some(50));
        assert_eq!(layered.timeout_message.as_deref(), Some("base"));
        assert_eq!(layered.cached, Some(true));
    }

    #[test]
    fn zero_durations_are_disabled() {
        let resolved = TaskOptions {
            delay: Some(0),
            fill: Some(20),
            ..Default::default()
        }
        .resolve();

        assert_eq!(resolved.delay, None);
        assert_eq!(resolved.fill, Some(Duration::from_millis(20)));
        assert_eq!(resolved.timeout_message, DEFAULT_TIMEOUT_MESSAGE);
        assert!(!resolved.queued);
        assert!(!resolved.cached);
    }

    #[test]
    fn deserializes_camel_case_config() {
        let options: TaskOptions = serde_json::from_str(
            r#"{"name":"users","expiresIn":500,"timeoutMessage":"slow","cached":true,
                "retry":{"kind":"retry","maxAttempts":2,"backoffMs":10}}"#,
        )
        .expect("options should deserialize");

        assert_eq!(options.name.as_deref(), Some("users"));
        assert_eq!(options.expires_in, Some(500));
        assert_eq!(options.timeout_message.as_deref(), Some("slow"));
        assert_eq!(options.retry, Some(RetryPolicy::retries_with_backoff(2, 10)));
        assert_eq!(options.queued, None);
    }
}
