#![deny(missing_docs)]

//! Observable tasks: managed, single-flight async actions.
//!
//! # Design Goals
//!
//! - **Single-flight**: at most one invocation of an action is in flight per
//!   task; overlapping calls are dropped or queued in FIFO order
//! - **Observable state**: every transition is visible through getters,
//!   synchronous subscribers and lifecycle hooks
//! - **Composition over inheritance**: caching, pagination and persistence
//!   are attached behaviours of one engine
//!
//! # Core Concepts
//!
//! - [`Task`]: wraps an action, tracks `Idle → Executing → Succeeded/Failed`
//! - [`Execution`]: shared outcome of one `execute` call
//! - [`FingerprintCache`]: results keyed by argument equality, with TTL
//! - [`Paged`]: accumulates items across pages via a [`PageResolver`]
//! - [`Context`]: default options, type-wide hooks and the clock
//! - [`SnapshotStore`]: where terminal state is persisted; see [`hydrate`]
//!
//! ```ignore
//! let users = Task::builder(|id: u32| async move { api.user(id).await })
//!     .name("users")
//!     .cached(true)
//!     .expires_in(Duration::from_secs(60))
//!     .build();
//!
//! let user = users.execute(7).await?;
//! ```

// Modules
pub mod cache;
pub mod context;
pub mod error;
pub mod hooks;
mod macros;
mod middleware;
pub mod options;
pub mod paged;
pub mod store;
pub mod task;
pub mod transport;

// Re-exports for convenience
pub use cache::{CallRecord, FingerprintCache};
pub use context::{now_millis, Clock, Context, ManualClock, SystemClock};
pub use error::{SharedError, TaskError, UsageError, DEFAULT_TIMEOUT_MESSAGE};
pub use hooks::{ChainTarget, ReloadTarget, TaskInfo, Unregister};
pub use options::{RetryPolicy, TaskOptions};
pub use paged::{PageResolver, Paged};
pub use store::{hydrate, Hydrate, MemoryStore, Snapshot, SnapshotStore, StoreError};
pub use task::{CallArgs, Execution, Phase, StateChange, Task, TaskBuilder, TaskOutput};
pub use transport::Transport;

#[cfg(test)]
mod tests;
