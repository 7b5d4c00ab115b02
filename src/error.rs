//! Error types shared by every task flavour.
//!
//! [`TaskError`] is what an [`Execution`](crate::Execution) resolves to on
//! failure. It is `Clone` because one outcome is delivered to every caller
//! awaiting the same execution.

use std::error::Error as StdError;
use std::sync::Arc;

/// Message used when a timeout fires and no custom message was configured.
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Action timeout";

/// A boxed, shareable error produced by an action or a parser.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Programmer misuse of a task.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// The task was never executed, so there is nothing to reload or await.
    #[error("task has not been executed yet")]
    NotExecuted,

    /// A page resolver did not produce arguments for the next page.
    #[error("page resolver did not emit arguments for the next page")]
    NextArgsNotEmitted,
}

/// Failure of a single task execution.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TaskError {
    /// The wrapped action failed.
    #[error("action failed: {0}")]
    Action(SharedError),

    /// The configured parser rejected the action's result.
    #[error("could not parse result: {0}")]
    Parse(SharedError),

    /// The action did not settle within the configured timeout.
    #[error("{0}")]
    Timeout(String),

    /// The call was queued and the task was reset before it started.
    #[error("task was reset while executing")]
    Cancelled,

    /// The action, the parser or a hook panicked during the call.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The call was dropped before it settled.
    #[error("execution was abandoned before it settled")]
    Abandoned,

    /// The call sequence was invalid.
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl TaskError {
    /// Wrap an action error.
    pub fn action<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Action(Arc::new(error))
    }

    /// Wrap a parser error.
    pub fn parse<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Parse(Arc::new(error))
    }

    /// Returns `true` for [`TaskError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns `true` for [`TaskError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the underlying action error, if this is one.
    pub fn as_action(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Action(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
