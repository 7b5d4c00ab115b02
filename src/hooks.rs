//! Lifecycle hooks.
//!
//! Hooks run synchronously as part of every terminal transition (success or
//! error): instance hooks first in registration order, then the context's
//! type-wide hooks. They finish before any awaiting caller sees the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::task::{CallArgs, Phase, Task, TaskOutput};

/// Read-only view of a task, handed to type-wide hooks.
pub trait TaskInfo: Send + Sync {
    /// Task name.
    fn name(&self) -> &str;
    /// Current phase.
    fn phase(&self) -> Phase;
    /// Whether the last terminal transition was a success.
    fn was_successful(&self) -> bool;
    /// Whether the last terminal transition was a failure.
    fn is_error(&self) -> bool;
    /// The error of the last failed transition.
    fn error(&self) -> Option<TaskError>;
}

struct Entry<F: ?Sized> {
    id: u64,
    name: Arc<str>,
    once: bool,
    callback: Arc<F>,
}

/// Ordered list of callbacks with stable ids.
pub(crate) struct CallbackList<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<F>>>,
}

impl<F: ?Sized> CallbackList<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, name: &str, callback: Arc<F>, once: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry {
            id,
            name: name.into(),
            once,
            callback,
        });
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Snapshot for one round of invocations. One-shot entries are removed
    /// here, before any callback runs.
    pub(crate) fn take_for_trigger(&self) -> Vec<(Arc<str>, Arc<F>)> {
        let mut entries = self.entries.lock();
        let snapshot = entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.callback.clone()))
            .collect();
        entries.retain(|entry| !entry.once);
        snapshot
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Disposer returned by every registration.
///
/// Dropping it keeps the callback registered; call [`Unregister::unregister`]
/// to remove it.
pub struct Unregister {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl Unregister {
    pub(crate) fn new<F: ?Sized + Send + Sync + 'static>(
        list: &Arc<CallbackList<F>>,
        id: u64,
    ) -> Self {
        let list: Weak<CallbackList<F>> = Arc::downgrade(list);
        Self {
            remove: Box::new(move || list.upgrade().is_some_and(|list| list.remove(id))),
        }
    }

    /// Remove the callback. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for Unregister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Unregister")
    }
}

/// Something a finished task can hand its outcome to.
pub trait ChainTarget<T>: Send + Sync + 'static {
    /// Force the target into the outcome's terminal state.
    fn settle(&self, outcome: Result<T, TaskError>);
}

/// Something that can be re-run with its last arguments.
pub trait ReloadTarget: Send + Sync + 'static {
    /// Whether the target's last transition was a success.
    fn has_succeeded(&self) -> bool;
    /// Re-run in the background. Failures surface on the target itself.
    fn reload_detached(&self);
}

pub(crate) type HookFn<A, T> = dyn Fn(&Task<A, T>) + Send + Sync;

impl<A: CallArgs, T: TaskOutput> Task<A, T> {
    /// Register a hook fired after every terminal transition.
    pub fn register_hook<F>(&self, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.register_hook_named("hook", hook)
    }

    /// Same as [`Task::register_hook`] with a name used in log events.
    pub fn register_hook_named<F>(&self, name: &str, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.push_hook(name, Arc::new(hook), false)
    }

    /// Register a hook that removes itself before its first invocation.
    pub fn register_hook_once<F>(&self, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.register_hook_once_named("once", hook)
    }

    /// Same as [`Task::register_hook_once`] with a name used in log events.
    pub fn register_hook_once_named<F>(&self, name: &str, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.push_hook(name, Arc::new(hook), true)
    }

    /// Register a hook fired only after successful transitions.
    pub fn register_hook_success<F>(&self, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.register_hook_named("on_success", move |task: &Task<A, T>| {
            if task.was_successful() {
                hook(task);
            }
        })
    }

    /// Register a hook fired only after failed transitions.
    pub fn register_hook_error<F>(&self, hook: F) -> Unregister
    where
        F: Fn(&Task<A, T>) + Send + Sync + 'static,
    {
        self.register_hook_named("on_error", move |task: &Task<A, T>| {
            if task.is_error() {
                hook(task);
            }
        })
    }

    /// Forward this task's successes and failures to `target`.
    pub fn chain<C>(&self, target: &C) -> Unregister
    where
        C: ChainTarget<T> + Clone,
    {
        let target = target.clone();
        self.register_hook_named("chain", move |task: &Task<A, T>| {
            if task.was_successful() {
                if let Some(result) = task.result() {
                    target.settle(Ok(result));
                }
            } else if let Some(error) = task.error() {
                target.settle(Err(error));
            }
        })
    }

    /// Forward this task's successes to `target`.
    pub fn chain_resolve<C>(&self, target: &C) -> Unregister
    where
        C: ChainTarget<T> + Clone,
    {
        let target = target.clone();
        self.register_hook_named("chain_resolve", move |task: &Task<A, T>| {
            if !task.was_successful() {
                return;
            }
            if let Some(result) = task.result() {
                target.settle(Ok(result));
            }
        })
    }

    /// Forward this task's failures to `target`, whatever its result type.
    pub fn chain_reject<C, U>(&self, target: &C) -> Unregister
    where
        C: ChainTarget<U> + Clone,
    {
        let target = target.clone();
        self.register_hook_named("chain_reject", move |task: &Task<A, T>| {
            if !task.is_error() {
                return;
            }
            if let Some(error) = task.error() {
                target.settle(Err(error));
            }
        })
    }

    /// Reload `target` after each success of this task, provided `target`
    /// has itself succeeded before.
    pub fn chain_reload<R>(&self, target: &R) -> Unregister
    where
        R: ReloadTarget + Clone,
    {
        let target = target.clone();
        self.register_hook_named("chain_reload", move |task: &Task<A, T>| {
            if task.was_successful() && target.has_succeeded() {
                target.reload_detached();
            }
        })
    }

    fn push_hook(&self, name: &str, hook: Arc<HookFn<A, T>>, once: bool) -> Unregister {
        let hooks = self.hooks();
        let id = hooks.push(name, hook, once);
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), hook = name, once, "task.hook.register");
        Unregister::new(hooks, id)
    }

    pub(crate) fn trigger_hooks(&self) {
        for (_name, hook) in self.hooks().take_for_trigger() {
            #[cfg(feature = "tracing")]
            tracing::debug!(task = self.name(), hook = %_name, "task.hook");
            hook(self);
        }
        self.context().trigger_hooks(self);
    }
}

impl<A: CallArgs, T: TaskOutput> TaskInfo for Task<A, T> {
    fn name(&self) -> &str {
        Task::name(self)
    }

    fn phase(&self) -> Phase {
        Task::phase(self)
    }

    fn was_successful(&self) -> bool {
        Task::was_successful(self)
    }

    fn is_error(&self) -> bool {
        Task::is_error(self)
    }

    fn error(&self) -> Option<TaskError> {
        Task::error(self)
    }
}

impl<A: CallArgs, T: TaskOutput> ChainTarget<T> for Task<A, T> {
    fn settle(&self, outcome: Result<T, TaskError>) {
        match outcome {
            Ok(result) => self.resolve(result),
            Err(error) => self.reject(error),
        }
    }
}

impl<A: CallArgs, T: TaskOutput> ReloadTarget for Task<A, T> {
    fn has_succeeded(&self) -> bool {
        self.was_successful()
    }

    fn reload_detached(&self) {
        if let Err(_error) = self.reload() {
            #[cfg(feature = "tracing")]
            tracing::warn!(task = self.name(), error = %_error, "task.reload.skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn() -> u32 + Send + Sync;

    #[test]
    fn trigger_snapshot_preserves_order() {
        let list: CallbackList<Callback> = CallbackList::new();
        list.push("a", Arc::new(|| 1), false);
        list.push("b", Arc::new(|| 2), false);

        let values: Vec<u32> = list.take_for_trigger().iter().map(|(_, f)| f()).collect();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn once_entries_are_removed_before_invocation() {
        let list: CallbackList<Callback> = CallbackList::new();
        list.push("once", Arc::new(|| 1), true);
        list.push("always", Arc::new(|| 2), false);

        let first = list.take_for_trigger();
        assert_eq!(first.len(), 2);
        assert_eq!(list.len(), 1);

        let second = list.take_for_trigger();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0.as_ref(), "always");
    }

    #[test]
    fn unregister_removes_once() {
        let list: Arc<CallbackList<Callback>> = Arc::new(CallbackList::new());
        let id = list.push("a", Arc::new(|| 1), false);
        let disposer = Unregister::new(&list, id);
        assert!(disposer.unregister());
        assert_eq!(list.len(), 0);

        let id = list.push("b", Arc::new(|| 2), false);
        let disposer = Unregister::new(&list, id);
        list.clear();
        assert!(!disposer.unregister());
    }
}
