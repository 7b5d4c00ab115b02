//! Explicit registry shared by a family of tasks.
//!
//! A [`Context`] carries what would otherwise be process-wide state: default
//! options, type-wide hooks and the clock used for expiry. It is created by
//! the caller and handed to each [`TaskBuilder`](crate::TaskBuilder).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::hooks::{CallbackList, TaskInfo, Unregister};
use crate::options::{duration_ms, TaskOptions};

/// Get the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Source of wall-clock time for expiry checks.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current Unix timestamp in milliseconds.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_millis()
    }
}

/// A clock that only moves when told to. Useful in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` (Unix millis).
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_ms(by), Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) type GlobalHookFn = dyn Fn(&dyn TaskInfo) + Send + Sync;

/// Defaults, type-wide hooks and clock shared by the tasks built with it.
pub struct Context {
    defaults: RwLock<TaskOptions>,
    hooks: Arc<CallbackList<GlobalHookFn>>,
    clock: Arc<dyn Clock>,
}

impl Context {
    /// Create a context using the system clock.
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a context reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            defaults: RwLock::new(TaskOptions::default()),
            hooks: Arc::new(CallbackList::new()),
            clock,
        })
    }

    /// Replace the default options applied to tasks built afterwards.
    ///
    /// A `name` in the defaults is ignored; every task gets its own.
    pub fn configure(&self, mut defaults: TaskOptions) {
        defaults.name = None;
        *self.defaults.write() = defaults;
    }

    /// Current default options.
    pub fn defaults(&self) -> TaskOptions {
        self.defaults.read().clone()
    }

    /// Register a hook fired after every terminal transition of every task
    /// built with this context, after that task's own hooks.
    pub fn register_hook<F>(&self, hook: F) -> Unregister
    where
        F: Fn(&dyn TaskInfo) + Send + Sync + 'static,
    {
        self.register_hook_named("global_hook", hook)
    }

    /// Same as [`Context::register_hook`] with a name used in log events.
    pub fn register_hook_named<F>(&self, name: &str, hook: F) -> Unregister
    where
        F: Fn(&dyn TaskInfo) + Send + Sync + 'static,
    {
        let id = self.hooks.push(name, Arc::new(hook), false);
        #[cfg(feature = "tracing")]
        tracing::debug!(hook = name, "context.hook.register");
        Unregister::new(&self.hooks, id)
    }

    /// Number of registered type-wide hooks.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Drop every global hook and restore default options.
    pub fn teardown(&self) {
        self.hooks.clear();
        *self.defaults.write() = TaskOptions::default();
        #[cfg(feature = "tracing")]
        tracing::debug!("context.teardown");
    }

    /// Current time according to this context's clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn trigger_hooks(&self, task: &dyn TaskInfo) {
        for (_name, hook) in self.hooks.take_for_trigger() {
            #[cfg(feature = "tracing")]
            tracing::debug!(task = task.name(), hook = %_name, "task.hook.global");
            hook(task);
        }
    }

    pub(crate) fn generate_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("task_{}", &id[..8])
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("defaults", &*self.defaults.read())
            .field("hooks", &self.hooks.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn configure_ignores_name_and_teardown_resets() {
        let ctx = Context::new();
        ctx.configure(TaskOptions {
            name: Some("shared".into()),
            queued: Some(true),
            ..Default::default()
        });
        assert_eq!(ctx.defaults().name, None);
        assert_eq!(ctx.defaults().queued, Some(true));

        let _ = ctx.register_hook(|_| {});
        assert_eq!(ctx.hook_count(), 1);

        ctx.teardown();
        assert_eq!(ctx.hook_count(), 0);
        assert_eq!(ctx.defaults(), TaskOptions::default());
    }

    #[test]
    fn generated_names_are_distinct() {
        let ctx = Context::new();
        let a = ctx.generate_name();
        let b = ctx.generate_name();
        assert!(a.starts_with("task_"));
        assert_eq!(a.len(), "task_".len() + 8);
        assert_ne!(a, b);
    }
}
