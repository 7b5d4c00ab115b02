//! Pagination accumulator.
//!
//! [`Paged`] runs the same engine as [`Task`] and keeps an ordered list of
//! items across pages. A [`PageResolver`] says how to extract items from a
//! page and how to compute the next page's arguments.
//!
//! `execute` starts a new session (clears the list, records the first
//! arguments), `execute_next` appends. Only first pages are cached.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::{TaskError, UsageError};
use crate::hooks::{ChainTarget, ReloadTarget};
use crate::options::TaskOptions;
use crate::store::{Hydrate, SnapshotStore, StoreError};
use crate::task::{
    CallArgs, CallKind, DeriveArgs, Execution, Extension, JobArgs, StateChange, Task, TaskBuilder,
    TaskOutput,
};

/// Describes how a paged action's results are split into items.
pub trait PageResolver<A, T>: Send + Sync + 'static {
    /// Item type accumulated across pages.
    type Item: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Extract this page's items.
    fn resolve(&self, result: &T, args: Option<&A>) -> Vec<Self::Item>;

    /// Arguments for the page after `result`, which was fetched with
    /// `previous`. `None` means the resolver cannot continue, which fails
    /// the next-page call.
    fn next_args(&self, result: &T, previous: &A) -> Option<A>;

    /// Whether more pages exist. `None` falls back to "the page was not
    /// empty".
    fn has_more(&self, _result: &T, _args: Option<&A>) -> Option<bool> {
        None
    }

    /// Total number of items, if the result reports it.
    fn total_count(&self, _result: &T) -> Option<u64> {
        None
    }

    /// Total number of pages, if the result reports it.
    fn total_pages(&self, _result: &T) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone)]
struct PageState<A, I> {
    items: Vec<I>,
    has_more: bool,
    total_items: u64,
    total_pages: u64,
    first_call_args: Option<A>,
}

impl<A, I> Default for PageState<A, I> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            has_more: true,
            total_items: 0,
            total_pages: 0,
            first_call_args: None,
        }
    }
}

struct Accumulator<A, R, I> {
    resolver: Arc<R>,
    pages: Arc<Mutex<PageState<A, I>>>,
}

impl<A, T, R> Extension<A, T> for Accumulator<A, R, R::Item>
where
    A: CallArgs,
    T: TaskOutput,
    R: PageResolver<A, T>,
{
    fn on_begin(&self, kind: CallKind, args: Option<&A>) -> Option<StateChange> {
        if kind == CallKind::NextPage {
            return None;
        }
        let mut pages = self.pages.lock();
        pages.items.clear();
        if let Some(args) = args {
            pages.first_call_args = Some(args.clone());
        }
        Some(StateChange::ItemsCleared)
    }

    fn on_success(&self, result: &T, args: Option<&A>) -> Option<StateChange> {
        let items = self.resolver.resolve(result, args);
        let count = items.len();
        let has_more = self
            .resolver
            .has_more(result, args)
            .unwrap_or(count > 0);
        let total_items = self.resolver.total_count(result);
        let total_pages = self.resolver.total_pages(result);

        #[cfg(feature = "tracing")]
        tracing::debug!(count, has_more, ?total_items, ?total_pages, "page.resolve");

        let mut pages = self.pages.lock();
        pages.has_more = has_more;
        if let Some(total) = total_items {
            pages.total_items = total;
        }
        if let Some(total) = total_pages {
            pages.total_pages = total;
        }
        pages.items.extend(items);
        Some(StateChange::ItemsAppended { count })
    }

    fn on_reset(&self) {
        *self.pages.lock() = PageState::default();
    }

    fn persist(&self, extra: &mut Map<String, Value>) -> Result<(), StoreError> {
        let pages = self.pages.lock();
        let encode = |error: serde_json::Error| StoreError::Encode(error.to_string());
        if let Some(args) = &pages.first_call_args {
            extra.insert("firstArgs".into(), serde_json::to_value(args).map_err(encode)?);
        }
        extra.insert(
            "resultArray".into(),
            serde_json::to_value(&pages.items).map_err(encode)?,
        );
        extra.insert("hasMore".into(), Value::Bool(pages.has_more));
        if pages.total_items > 0 {
            extra.insert("totalItems".into(), pages.total_items.into());
        }
        if pages.total_pages > 0 {
            extra.insert("totalPages".into(), pages.total_pages.into());
        }
        Ok(())
    }

    fn restore(&self, extra: &Map<String, Value>) -> Result<(), StoreError> {
        let first_args: Option<A> = decode_field(extra, "firstArgs")?;
        let items: Option<Vec<R::Item>> = decode_field(extra, "resultArray")?;
        let has_more: Option<bool> = decode_field(extra, "hasMore")?;
        let total_items: Option<u64> = decode_field(extra, "totalItems")?;
        let total_pages: Option<u64> = decode_field(extra, "totalPages")?;

        let mut pages = self.pages.lock();
        if first_args.is_some() {
            pages.first_call_args = first_args;
        }
        if let Some(items) = items {
            pages.items = items;
        }
        if let Some(has_more) = has_more {
            pages.has_more = has_more;
        }
        if let Some(total) = total_items {
            pages.total_items = total;
        }
        if let Some(total) = total_pages {
            pages.total_pages = total;
        }
        Ok(())
    }
}

fn decode_field<V: DeserializeOwned>(
    extra: &Map<String, Value>,
    field: &str,
) -> Result<Option<V>, StoreError> {
    match extra.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|error| StoreError::Decode {
                key: field.to_string(),
                reason: error.to_string(),
            }),
    }
}

/// A task that accumulates items across pages.
///
/// Derefs to the underlying [`Task`] for state, hooks, cache and snapshot
/// access.
pub struct Paged<A, T, R: PageResolver<A, T>> {
    task: Task<A, T>,
    resolver: Arc<R>,
    pages: Arc<Mutex<PageState<A, R::Item>>>,
}

impl<A, T, R: PageResolver<A, T>> Clone for Paged<A, T, R> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            resolver: self.resolver.clone(),
            pages: self.pages.clone(),
        }
    }
}

impl<A, T, R: PageResolver<A, T>> Deref for Paged<A, T, R> {
    type Target = Task<A, T>;

    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

impl<A: CallArgs, T: TaskOutput, R: PageResolver<A, T>> fmt::Debug for Paged<A, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pages = self.pages.lock();
        f.debug_struct("Paged")
            .field("task", &self.task)
            .field("items", &pages.items.len())
            .field("has_more", &pages.has_more)
            .finish()
    }
}

impl<A: CallArgs, T: TaskOutput> TaskBuilder<A, T> {
    /// Build a paged task driven by `resolver`.
    pub fn paged<R: PageResolver<A, T>>(self, resolver: R) -> Paged<A, T, R> {
        Paged::build(self, Arc::new(resolver))
    }
}

impl<A: CallArgs, T: TaskOutput, R: PageResolver<A, T>> Paged<A, T, R> {
    fn build(builder: TaskBuilder<A, T>, resolver: Arc<R>) -> Self {
        let pages = Arc::new(Mutex::new(PageState::default()));
        let ext = Accumulator {
            resolver: resolver.clone(),
            pages: pages.clone(),
        };
        Self {
            task: builder.build_with(Arc::new(ext)),
            resolver,
            pages,
        }
    }

    /// The underlying task handle.
    pub fn task(&self) -> &Task<A, T> {
        &self.task
    }

    /// Start a new session with the first page at `args`.
    pub fn execute(&self, args: A) -> Execution<T> {
        self.task.submit(JobArgs::Given(args), CallKind::FirstPage)
    }

    /// Fetch the page after the last one, with arguments computed by the
    /// resolver when the call starts.
    pub fn execute_next(&self) -> Execution<T> {
        let resolver = self.resolver.clone();
        let derive: DeriveArgs<A, T> = Box::new(move |last, previous| {
            let (Some(last), Some(previous)) = (last, previous) else {
                return Err(TaskError::from(UsageError::NotExecuted));
            };
            resolver
                .next_args(last, previous)
                .ok_or(TaskError::Usage(UsageError::NextArgsNotEmitted))
        });
        self.task.submit(JobArgs::Derived(derive), CallKind::NextPage)
    }

    /// Fetch a next page with explicit arguments.
    pub fn execute_next_with(&self, args: A) -> Execution<T> {
        self.task.submit(JobArgs::Given(args), CallKind::NextPage)
    }

    /// Restart the session from the first page's arguments.
    pub fn reload(&self) -> Result<Execution<T>, UsageError> {
        let args = self.first_args().ok_or(UsageError::NotExecuted)?;
        Ok(self.execute(args))
    }

    /// Inject `result` as a new first page.
    pub fn resolve(&self, result: T) {
        self.task.settle_forced(Ok(result), CallKind::FirstPage);
    }

    /// Force a failed transition. The accumulated list is kept.
    pub fn reject(&self, error: TaskError) {
        self.task.settle_forced(Err(error), CallKind::FirstPage);
    }

    /// Return to idle and clear the list.
    pub fn reset(&self) -> &Self {
        self.task.reset();
        self
    }

    /// An independent paged task with the same action and resolver.
    pub fn clone_with(&self, overrides: TaskOptions) -> Self {
        Self::build(self.task.rebuild(overrides), self.resolver.clone())
    }

    /// The accumulated items.
    pub fn list(&self) -> Vec<R::Item> {
        self.pages.lock().items.clone()
    }

    /// The accumulated items if the last transition was a success,
    /// `default` otherwise.
    pub fn get_list(&self, default: Vec<R::Item>) -> Vec<R::Item> {
        if self.task.was_successful() {
            self.list()
        } else {
            default
        }
    }

    /// Whether the resolver reported more pages.
    pub fn has_more(&self) -> bool {
        self.pages.lock().has_more
    }

    /// Total item count reported by the resolver, 0 if unknown.
    pub fn total_items(&self) -> u64 {
        self.pages.lock().total_items
    }

    /// Total page count reported by the resolver, 0 if unknown.
    pub fn total_pages(&self) -> u64 {
        self.pages.lock().total_pages
    }

    /// Arguments of the current session's first page.
    pub fn first_args(&self) -> Option<A> {
        self.pages.lock().first_call_args.clone()
    }
}

impl<A: CallArgs, T: TaskOutput, R: PageResolver<A, T>> Hydrate for Paged<A, T, R> {
    fn snapshot_key(&self) -> &str {
        self.task.name()
    }

    fn hydrate_from(&self, store: Arc<dyn SnapshotStore>) -> Result<bool, StoreError> {
        self.task.hydrate_from(store)
    }
}

impl<A: CallArgs, T: TaskOutput, R: PageResolver<A, T>> ChainTarget<T> for Paged<A, T, R> {
    fn settle(&self, outcome: Result<T, TaskError>) {
        match outcome {
            Ok(result) => self.resolve(result),
            Err(error) => self.reject(error),
        }
    }
}

impl<A: CallArgs, T: TaskOutput, R: PageResolver<A, T>> ReloadTarget for Paged<A, T, R> {
    fn has_succeeded(&self) -> bool {
        self.task.was_successful()
    }

    fn reload_detached(&self) {
        if let Err(_error) = self.reload() {
            #[cfg(feature = "tracing")]
            tracing::warn!(task = self.task.name(), error = %_error, "task.reload.skipped");
        }
    }
}
