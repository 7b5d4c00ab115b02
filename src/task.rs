//! The execution engine.
//!
//! A [`Task`] wraps an async action and turns each invocation into an
//! observable state transition:
//!
//! ```text
//! Idle ──execute──▶ Executing ──┬──▶ Succeeded ──execute──▶ Executing ...
//!                               └──▶ Failed    ──execute──▶ Executing ...
//! (any) ──reset──▶ Idle
//! ```
//!
//! At most one action invocation is in flight per task. Overlapping calls are
//! either dropped (the caller receives the in-flight [`Execution`]) or, with
//! `queued`, run afterwards in FIFO order. The queue is drained by a single
//! driver spawned on the ambient tokio runtime; a job's reply is sent only
//! after its terminal transition (state, hooks, persistence) is complete.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::cache::{CallRecord, FingerprintCache};
use crate::context::Context;
use crate::error::{TaskError, UsageError};
use crate::hooks::{CallbackList, HookFn, Unregister};
use crate::middleware::{self, Action};
use crate::options::{duration_ms, ResolvedOptions, RetryPolicy, TaskOptions};
use crate::store::{SnapshotStore, StoreError};

/// Bounds required of call arguments. Equality is the cache fingerprint.
pub trait CallArgs:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<X> CallArgs for X where
    X: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of task results.
pub trait TaskOutput:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<X> TaskOutput for X where
    X: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

// ============================================================================
// State
// ============================================================================

/// Coarse execution state, derived from the task's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Never executed, or reset.
    Idle,
    /// An action invocation is running.
    Executing,
    /// The last transition was a success.
    Succeeded,
    /// The last transition was a failure.
    Failed,
}

/// Notification delivered synchronously to subscribers on every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// An action invocation started.
    Executing,
    /// The task transitioned to success.
    Succeeded,
    /// The task transitioned to failure.
    Failed,
    /// The task was reset to idle.
    Reset,
    /// State was restored from a snapshot.
    Restored,
    /// The accumulated page list was cleared.
    ItemsCleared,
    /// Items were appended to the accumulated page list.
    ItemsAppended {
        /// Number of items appended.
        count: usize,
    },
}

/// What kind of call is being made. Only plain and first-page calls use the
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Plain,
    FirstPage,
    NextPage,
}

/// Behaviour attached to a task at construction. Each method is invoked
/// outside the task's state lock.
pub(crate) trait Extension<A, T>: Send + Sync + 'static {
    fn on_begin(&self, _kind: CallKind, _args: Option<&A>) -> Option<StateChange> {
        None
    }

    fn on_success(&self, _result: &T, _args: Option<&A>) -> Option<StateChange> {
        None
    }

    fn on_reset(&self) {}

    fn persist(&self, _extra: &mut Map<String, Value>) -> Result<(), StoreError> {
        Ok(())
    }

    fn restore(&self, _extra: &Map<String, Value>) -> Result<(), StoreError> {
        Ok(())
    }
}

pub(crate) struct NoExtension;

impl<A, T> Extension<A, T> for NoExtension {}

pub(crate) type DeriveArgs<A, T> =
    Box<dyn FnOnce(Option<&T>, Option<&A>) -> Result<A, TaskError> + Send>;

/// Arguments of a job, either known up front or computed when it starts.
pub(crate) enum JobArgs<A, T> {
    Given(A),
    Derived(DeriveArgs<A, T>),
}

struct Job<A, T> {
    args: JobArgs<A, T>,
    kind: CallKind,
    reply: oneshot::Sender<Result<T, TaskError>>,
}

struct State<A, T> {
    result: Option<T>,
    error: Option<TaskError>,
    is_executing: bool,
    is_error: bool,
    was_executed: bool,
    current: Option<CallRecord<A, T>>,
    cache: FingerprintCache<A, T>,
    promise: Option<Execution<T>>,
    running: bool,
    queue: VecDeque<Job<A, T>>,
}

impl<A, T> State<A, T> {
    fn phase(&self) -> Phase {
        if self.is_executing {
            Phase::Executing
        } else if !self.was_executed {
            Phase::Idle
        } else if self.is_error {
            Phase::Failed
        } else {
            Phase::Succeeded
        }
    }

    fn was_successful(&self) -> bool {
        self.was_executed && !self.is_error
    }
}

// ============================================================================
// Execution
// ============================================================================

/// The outcome of one `execute` call, shareable between callers.
///
/// Work starts when `execute` is called; awaiting only observes it.
#[derive(Clone)]
pub struct Execution<T> {
    inner: Shared<BoxFuture<'static, Result<T, TaskError>>>,
}

impl<T> Execution<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn ready(outcome: Result<T, TaskError>) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }

    fn pending(reply: oneshot::Receiver<Result<T, TaskError>>) -> Self {
        Self {
            inner: async move { reply.await.unwrap_or(Err(TaskError::Abandoned)) }
                .boxed()
                .shared(),
        }
    }

    /// The outcome, if it has already been observed by an awaiting caller.
    pub fn peek(&self) -> Option<&Result<T, TaskError>> {
        self.inner.peek()
    }
}

impl<T: Clone> Future for Execution<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution").finish_non_exhaustive()
    }
}

// ============================================================================
// Task
// ============================================================================

pub(crate) type Parser<A, T> = Arc<dyn Fn(T, &A) -> Result<T, TaskError> + Send + Sync>;
pub(crate) type ObserverFn = dyn Fn(&StateChange) + Send + Sync;

struct Inner<A, T> {
    name: Arc<str>,
    raw_action: Action<A, T>,
    action: Action<A, T>,
    parser: Option<Parser<A, T>>,
    options: TaskOptions,
    resolved: ResolvedOptions,
    ctx: Arc<Context>,
    ext: Arc<dyn Extension<A, T>>,
    state: Mutex<State<A, T>>,
    hooks: Arc<CallbackList<HookFn<A, T>>>,
    observers: Arc<CallbackList<ObserverFn>>,
    store: Mutex<Option<Arc<dyn SnapshotStore>>>,
}

/// A managed async action.
///
/// `Task` is a handle: cloning it shares the same engine. Use
/// [`Task::clone_with`] for an independent task with the same action.
pub struct Task<A, T> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Clone for Task<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: CallArgs, T: TaskOutput> fmt::Debug for Task<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<A: CallArgs, T: TaskOutput> Task<A, T> {
    /// Start building a task around `action`.
    pub fn builder<F, Fut, E>(action: F) -> TaskBuilder<A, T>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskBuilder::new(action)
    }

    /// A task with default options and a private context.
    pub fn new<F, Fut, E>(action: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskBuilder::new(action).build()
    }

    /// Task name: log identifier and snapshot key.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The layered options this task was built with.
    pub fn options(&self) -> &TaskOptions {
        &self.inner.options
    }

    /// The context this task belongs to.
    pub fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Invoke the action with `args`.
    ///
    /// Returns immediately; the returned [`Execution`] resolves once the
    /// call's terminal transition (including hooks) is complete. Must be
    /// called within a tokio runtime.
    pub fn execute(&self, args: A) -> Execution<T> {
        self.submit(JobArgs::Given(args), CallKind::Plain)
    }

    /// Re-invoke the action with the arguments of the bound call.
    pub fn reload(&self) -> Result<Execution<T>, UsageError> {
        let args = self.args().ok_or_else(|| {
            #[cfg(feature = "tracing")]
            tracing::error!(task = self.name(), "task.reload.not_executed");
            UsageError::NotExecuted
        })?;
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), "task.reload");
        Ok(self.execute(args))
    }

    /// The most recent execution, for callers that did not keep it.
    pub fn promise(&self) -> Result<Execution<T>, UsageError> {
        self.inner
            .state
            .lock()
            .promise
            .clone()
            .ok_or(UsageError::NotExecuted)
    }

    /// Bind a call record without executing, so [`Task::reload`] and chains
    /// have arguments to work with.
    pub fn with_args(&self, args: A) -> &Self {
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), args = ?args, "task.with_args");
        self.inner.state.lock().current = Some(CallRecord::new(args));
        self
    }

    /// Force a successful transition without running the action.
    pub fn resolve(&self, result: T) {
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), "task.resolve.forced");
        self.settle_forced(Ok(result), CallKind::Plain);
    }

    /// Force a failed transition without running the action.
    pub fn reject(&self, error: TaskError) {
        #[cfg(feature = "tracing")]
        tracing::error!(task = self.name(), error = %error, "task.reject.forced");
        self.settle_forced(Err(error), CallKind::Plain);
    }

    /// Return to idle. Calls queued behind the in-flight one are cancelled
    /// with [`TaskError::Cancelled`]; the in-flight call is not aborted and
    /// its outcome is applied when it lands.
    pub fn reset(&self) -> &Self {
        self.reset_inner(true);
        self
    }

    /// An independent task with the same action, parser and context, and
    /// `overrides` layered over this task's options.
    pub fn clone_with(&self, overrides: TaskOptions) -> Self {
        self.rebuild(overrides).build()
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }

    /// The stored result, regardless of the last transition.
    pub fn result(&self) -> Option<T> {
        self.inner.state.lock().result.clone()
    }

    /// The error of the last failed transition.
    pub fn error(&self) -> Option<TaskError> {
        self.inner.state.lock().error.clone()
    }

    /// Whether an action invocation is running.
    pub fn is_executing(&self) -> bool {
        self.inner.state.lock().is_executing
    }

    /// Whether the last terminal transition was a failure.
    pub fn is_error(&self) -> bool {
        self.inner.state.lock().is_error
    }

    /// Whether any terminal transition has happened since the last reset.
    pub fn was_executed(&self) -> bool {
        self.inner.state.lock().was_executed
    }

    /// Whether the last terminal transition was a success.
    pub fn was_successful(&self) -> bool {
        self.inner.state.lock().was_successful()
    }

    /// Executing for the first time since construction or reset.
    pub fn is_executing_first_time(&self) -> bool {
        let state = self.inner.state.lock();
        state.is_executing && !state.was_executed
    }

    /// Arguments of the bound call record.
    pub fn args(&self) -> Option<A> {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|call| call.args.clone())
    }

    /// Whether the bound call record has exactly these arguments.
    pub fn was_executed_with(&self, args: &A) -> bool {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|call| call.args == *args)
    }

    /// The result if the last transition was a success, `default` otherwise.
    pub fn get_result(&self, default: T) -> T {
        self.get_result_or_else(|| default)
    }

    /// Like [`Task::get_result`] with a lazily computed default.
    pub fn get_result_or_else(&self, default: impl FnOnce() -> T) -> T {
        self.successful_result().unwrap_or_else(default)
    }

    /// Apply `selector` to a successful result, or return `default`.
    pub fn get_result_of<R>(&self, selector: impl FnOnce(&T) -> R, default: R) -> R {
        self.successful_result()
            .map_or(default, |result| selector(&result))
    }

    fn successful_result(&self) -> Option<T> {
        let state = self.inner.state.lock();
        if state.was_successful() {
            state.result.clone()
        } else {
            None
        }
    }

    /// Subscribe to state changes. Callbacks run synchronously on every
    /// mutation and must not block.
    pub fn subscribe<F>(&self, observer: F) -> Unregister
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.inner.observers.push("observer", Arc::new(observer), false);
        Unregister::new(&self.inner.observers, id)
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    /// Whether a live cache entry exists for `args`.
    pub fn is_cached(&self, args: &A) -> bool {
        let now = self.inner.ctx.now_millis();
        self.inner.state.lock().cache.is_cached(args, now)
    }

    /// Clear the whole cache.
    pub fn reset_cache(&self) -> &Self {
        self.invalidate_cache(None)
    }

    /// Clear the cache entry for `args`.
    pub fn reset_cache_for(&self, args: &A) -> &Self {
        self.invalidate_cache(Some(args))
    }

    fn invalidate_cache(&self, args: Option<&A>) -> &Self {
        {
            let mut state = self.inner.state.lock();
            state.cache.invalidate(args);
            let now = self.inner.ctx.now_millis();
            state.cache.evict_expired(now);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), args = ?args, "task.cache.clear");
        self.persist();
        self
    }

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------

    pub(crate) fn submit(&self, args: JobArgs<A, T>, kind: CallKind) -> Execution<T> {
        let mut state = self.inner.state.lock();

        // A first page starts a new session, so it must not overtake a page
        // of the previous session still in flight. It takes the queue and
        // the cache is consulted again when its job starts.
        let bypass = kind != CallKind::FirstPage || !state.running;
        if let (true, JobArgs::Given(args)) = (bypass, &args) {
            let cached = self.cached_result(&state, args, kind);
            if let Some((hit, result)) = cached {
                let outcome = Execution::ready(Ok(result.clone()));
                if !state.running {
                    state.promise = Some(outcome.clone());
                }
                drop(state);
                self.apply_cache_hit(hit, result, kind);
                return outcome;
            }
        }

        if state.running {
            if !self.inner.resolved.queued {
                #[cfg(feature = "tracing")]
                tracing::info!(task = self.name(), "task.skip");
                if let Some(in_flight) = state.promise.clone() {
                    return in_flight;
                }
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(task = self.name(), queued = state.queue.len() + 1, "task.queue");
            let (reply, receiver) = oneshot::channel();
            let execution = Execution::pending(receiver);
            state.queue.push_back(Job { args, kind, reply });
            state.promise = Some(execution.clone());
            return execution;
        }

        let (reply, receiver) = oneshot::channel();
        let execution = Execution::pending(receiver);
        state.running = true;
        state.promise = Some(execution.clone());
        drop(state);

        let task = self.clone();
        tokio::spawn(task.drive(Job { args, kind, reply }));
        execution
    }

    async fn drive(self, first: Job<A, T>) {
        let mut job = first;
        loop {
            let kind = job.kind;
            let outcome = AssertUnwindSafe(self.run(job.args, kind))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| self.recover(panic_message(payload.as_ref()), kind));

            // Release the slot before replying so a caller resuming on the
            // reply never sees a stale in-flight call.
            let next = {
                let mut state = self.inner.state.lock();
                let next = state.queue.pop_front();
                state.running = next.is_some();
                next
            };
            let _ = job.reply.send(outcome);
            match next {
                Some(next) => job = next,
                None => return,
            }
        }
    }

    async fn run(&self, args: JobArgs<A, T>, kind: CallKind) -> Result<T, TaskError> {
        let args = match args {
            JobArgs::Given(args) => args,
            JobArgs::Derived(derive) => {
                let (last, previous) = {
                    let state = self.inner.state.lock();
                    (
                        state.result.clone(),
                        state.current.as_ref().map(|call| call.args.clone()),
                    )
                };
                derive(last.as_ref(), previous.as_ref())?
            }
        };

        let hit = {
            let mut state = self.inner.state.lock();
            match self.cached_result(&state, &args, kind) {
                Some(hit) => Some(hit),
                None => {
                    if self.caches(kind) {
                        let now = self.inner.ctx.now_millis();
                        state.cache.insert(args.clone(), now);
                    }
                    state.current = Some(CallRecord::new(args.clone()));
                    state.is_executing = true;
                    None
                }
            }
        };
        if let Some((hit, result)) = hit {
            self.apply_cache_hit(hit, result.clone(), kind);
            return Ok(result);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(task = self.name(), args = ?args, "task.begin");
        if let Some(change) = self.inner.ext.on_begin(kind, Some(&args)) {
            self.notify(&change);
        }
        self.notify(&StateChange::Executing);

        let outcome = (self.inner.action)(args.clone())
            .await
            .and_then(|result| self.parse(result, &args));

        match outcome {
            Ok(result) => {
                self.succeed(result.clone(), Some(args), kind, true);
                Ok(result)
            }
            Err(error) => {
                self.fail(error.clone(), Some(args), kind);
                Err(error)
            }
        }
    }

    /// Settle a call whose future panicked. Hooks and subscribers are not
    /// run, since one of them may be what panicked.
    fn recover(&self, message: String, kind: CallKind) -> Result<T, TaskError> {
        let error = TaskError::Panicked(message);
        #[cfg(feature = "tracing")]
        tracing::error!(task = self.name(), error = %error, "task.panic");
        let mut state = self.inner.state.lock();
        if self.caches(kind) {
            if let Some(args) = state.current.as_ref().map(|call| call.args.clone()) {
                state.cache.invalidate(Some(&args));
            }
        }
        state.error = Some(error.clone());
        state.is_executing = false;
        state.is_error = true;
        state.was_executed = true;
        Err(error)
    }

    fn parse(&self, result: T, args: &A) -> Result<T, TaskError> {
        let Some(parser) = &self.inner.parser else {
            return Ok(result);
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), "task.parse");
        parser(result, args).map_err(|error| {
            #[cfg(feature = "tracing")]
            tracing::error!(task = self.name(), error = %error, "task.parse.failed");
            error
        })
    }

    fn cached_result(
        &self,
        state: &State<A, T>,
        args: &A,
        kind: CallKind,
    ) -> Option<(CallRecord<A, T>, T)> {
        if !self.caches(kind) {
            return None;
        }
        let hit = state.cache.hit(args, self.inner.ctx.now_millis())?;
        let result = hit.result.clone()?;
        Some((hit.clone(), result))
    }

    fn apply_cache_hit(&self, hit: CallRecord<A, T>, result: T, kind: CallKind) {
        #[cfg(feature = "tracing")]
        tracing::info!(task = self.name(), args = ?hit.args, "task.cache_hit");
        if let Some(change) = self.inner.ext.on_begin(kind, Some(&hit.args)) {
            self.notify(&change);
        }
        self.succeed(result, Some(hit.args), kind, false);
    }

    pub(crate) fn settle_forced(&self, outcome: Result<T, TaskError>, kind: CallKind) {
        match outcome {
            Ok(result) => {
                if let Some(change) = self.inner.ext.on_begin(kind, None) {
                    self.notify(&change);
                }
                self.succeed(result, None, kind, true);
            }
            Err(error) => self.fail(error, None, kind),
        }
    }

    /// Apply a successful transition for the call made with `args`, or for
    /// the bound call when `args` is `None`. `fresh` is false for cache
    /// hits: no cache fill, no persistence, and a call in flight keeps the
    /// executing flag.
    fn succeed(&self, result: T, args: Option<A>, kind: CallKind, fresh: bool) {
        let args = {
            let mut state = self.inner.state.lock();
            if let Some(args) = args {
                state.current = Some(CallRecord::new(args));
            }
            let args = state.current.as_ref().map(|call| call.args.clone());
            if let Some(call) = state.current.as_mut() {
                call.result = Some(result.clone());
            }
            if fresh {
                if let (true, Some(args)) = (self.caches(kind), &args) {
                    state.cache.fill(args, result.clone());
                }
                state.is_executing = false;
            }
            state.result = Some(result.clone());
            state.error = None;
            state.is_error = false;
            state.was_executed = true;
            args
        };

        #[cfg(feature = "tracing")]
        tracing::info!(task = self.name(), result = ?result, "task.success");
        if let Some(change) = self.inner.ext.on_success(&result, args.as_ref()) {
            self.notify(&change);
        }
        self.notify(&StateChange::Succeeded);
        self.trigger_hooks();
        if fresh {
            self.persist();
        }
    }

    fn fail(&self, error: TaskError, args: Option<A>, kind: CallKind) {
        {
            let mut state = self.inner.state.lock();
            if let Some(args) = args {
                state.current = Some(CallRecord::new(args));
            }
            if self.caches(kind) {
                if let Some(args) = state.current.as_ref().map(|call| call.args.clone()) {
                    state.cache.invalidate(Some(&args));
                }
            }
            state.error = Some(error.clone());
            state.is_executing = false;
            state.is_error = true;
            state.was_executed = true;
        }

        #[cfg(feature = "tracing")]
        tracing::error!(task = self.name(), error = %error, "task.error");
        self.notify(&StateChange::Failed);
        self.trigger_hooks();
        self.persist();
    }

    pub(crate) fn reset_inner(&self, persist: bool) {
        let cancelled: Vec<Job<A, T>> = {
            let mut state = self.inner.state.lock();
            state.result = None;
            state.error = None;
            state.is_executing = false;
            state.is_error = false;
            state.was_executed = false;
            state.current = None;
            state.queue.drain(..).collect()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(task = self.name(), cancelled = cancelled.len(), "task.reset");
        for job in cancelled {
            let _ = job.reply.send(Err(TaskError::Cancelled));
        }
        self.inner.ext.on_reset();
        self.notify(&StateChange::Reset);
        if persist {
            self.persist();
        }
    }

    fn caches(&self, kind: CallKind) -> bool {
        self.inner.resolved.cached && kind != CallKind::NextPage
    }

    pub(crate) fn notify(&self, change: &StateChange) {
        for (_, observer) in self.inner.observers.take_for_trigger() {
            observer(change);
        }
    }

    pub(crate) fn hooks(&self) -> &Arc<CallbackList<HookFn<A, T>>> {
        &self.inner.hooks
    }

    /// A builder for an independent copy. The name is not inherited unless
    /// `overrides` sets one, so the copy gets its own snapshot key.
    pub(crate) fn rebuild(&self, overrides: TaskOptions) -> TaskBuilder<A, T> {
        let mut base = self.inner.options.clone();
        base.name = None;
        TaskBuilder {
            action: self.inner.raw_action.clone(),
            options: overrides.layered_over(&base),
            parser: self.inner.parser.clone(),
            ctx: Some(self.inner.ctx.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot plumbing (see store.rs)
    // ------------------------------------------------------------------

    pub(crate) fn store(&self) -> Option<Arc<dyn SnapshotStore>> {
        self.inner.store.lock().clone()
    }

    pub(crate) fn set_store(&self, store: Arc<dyn SnapshotStore>) {
        *self.inner.store.lock() = Some(store);
    }

    pub(crate) fn extension(&self) -> &Arc<dyn Extension<A, T>> {
        &self.inner.ext
    }

    pub(crate) fn resolved(&self) -> &ResolvedOptions {
        &self.inner.resolved
    }

    /// Successful args/result, the live cache entries and the phase flags.
    pub(crate) fn terminal_view(&self, now: u64) -> TerminalView<A, T> {
        let state = self.inner.state.lock();
        let successful = state.was_successful();
        TerminalView {
            args: successful
                .then(|| state.current.as_ref().map(|call| call.args.clone()))
                .flatten(),
            data: successful.then(|| state.result.clone()).flatten(),
            calls: self.inner.resolved.cached.then(|| state.cache.live(now)),
        }
    }

    pub(crate) fn apply_restore(
        &self,
        args: Option<A>,
        data: Option<T>,
        calls: Option<Vec<CallRecord<A, T>>>,
    ) {
        let mut state = self.inner.state.lock();
        if let Some(data) = data {
            state.result = Some(data);
            state.error = None;
            state.is_error = false;
            state.was_executed = true;
        }
        if let Some(args) = args {
            let result = state.result.clone();
            state.current = Some(CallRecord {
                args,
                result,
                expires: None,
            });
        }
        if self.inner.resolved.cached {
            if let Some(calls) = calls {
                state.cache.replace(calls);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// The parts of a task's state that snapshots carry.
pub(crate) struct TerminalView<A, T> {
    pub(crate) args: Option<A>,
    pub(crate) data: Option<T>,
    pub(crate) calls: Option<Vec<CallRecord<A, T>>>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Task`].
///
/// Explicit setter calls win over [`TaskBuilder::options`], which wins over
/// the context defaults.
pub struct TaskBuilder<A, T> {
    action: Action<A, T>,
    options: TaskOptions,
    parser: Option<Parser<A, T>>,
    ctx: Option<Arc<Context>>,
}

impl<A: CallArgs, T: TaskOutput> TaskBuilder<A, T> {
    /// Start from an action.
    pub fn new<F, Fut, E>(action: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            action: middleware::erase(action),
            options: TaskOptions::default(),
            parser: None,
            ctx: None,
        }
    }

    /// Layer `options` under the setters already applied.
    pub fn options(mut self, options: TaskOptions) -> Self {
        self.options = self.options.layered_over(&options);
        self
    }

    /// Task name, used in logs and as the snapshot key.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Queue overlapping calls instead of dropping them.
    pub fn queued(mut self, queued: bool) -> Self {
        self.options.queued = Some(queued);
        self
    }

    /// Enable the argument-keyed cache.
    pub fn cached(mut self, cached: bool) -> Self {
        self.options.cached = Some(cached);
        self
    }

    /// Sleep before each invocation.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.options.delay = Some(duration_ms(delay));
        self
    }

    /// Pad each invocation to at least this duration.
    pub fn fill(mut self, fill: Duration) -> Self {
        self.options.fill = Some(duration_ms(fill));
        self
    }

    /// Fail invocations that take longer than this.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(duration_ms(timeout));
        self
    }

    /// Message of the timeout error.
    pub fn timeout_message(mut self, message: impl Into<String>) -> Self {
        self.options.timeout_message = Some(message.into());
        self
    }

    /// Time-to-live of cache entries and snapshots.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.options.expires_in = Some(duration_ms(ttl));
        self
    }

    /// Retry action failures.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    /// Post-process each raw result. An error fails the call.
    pub fn parser<P, E>(mut self, parser: P) -> Self
    where
        P: Fn(T, &A) -> Result<T, E> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(move |result: T, args: &A| {
            parser(result, args).map_err(TaskError::parse)
        }));
        self
    }

    /// Attach the task to a shared context.
    pub fn context(mut self, ctx: &Arc<Context>) -> Self {
        self.ctx = Some(ctx.clone());
        self
    }

    /// Build the task.
    pub fn build(self) -> Task<A, T> {
        self.build_with(Arc::new(NoExtension))
    }

    pub(crate) fn build_with(self, ext: Arc<dyn Extension<A, T>>) -> Task<A, T> {
        let ctx = self.ctx.unwrap_or_else(Context::new);
        let mut options = self.options.layered_over(&ctx.defaults());
        let name: Arc<str> = options
            .name
            .get_or_insert_with(|| ctx.generate_name())
            .as_str()
            .into();
        let resolved = options.resolve();
        let action = middleware::stack(self.action.clone(), &resolved, name.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(task = %name, options = ?options, "task.build");

        Task {
            inner: Arc::new(Inner {
                name,
                raw_action: self.action,
                action,
                parser: self.parser,
                options,
                state: Mutex::new(State {
                    result: None,
                    error: None,
                    is_executing: false,
                    is_error: false,
                    was_executed: false,
                    current: None,
                    cache: FingerprintCache::new(resolved.expires_in),
                    promise: None,
                    running: false,
                    queue: VecDeque::new(),
                }),
                resolved,
                ctx,
                ext,
                hooks: Arc::new(CallbackList::new()),
                observers: Arc::new(CallbackList::new()),
                store: Mutex::new(None),
            }),
        }
    }
}
