//! Common fixtures for tests.
//!
//! This module contains:
//! - `FetchError`: error type returned by the fixture actions
//! - `Counter`: counts action invocations
//! - `Journal`: records events across actions, hooks and observers
//! - Task builders: `doubler`, `flaky`, `explosive`, `pages`
//! - `OffsetResolver`: page resolver over `(offset, count)` arguments

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{PageResolver, TaskBuilder};

// ============================================================================
// Error Type
// ============================================================================

/// Errors returned by fixture actions.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum FetchError {
    /// Failure that goes away after a few attempts.
    #[error("transient")]
    Transient,

    /// The requested value does not exist.
    #[error("not found: {0}")]
    NotFound(u32),
}

// ============================================================================
// Recorders
// ============================================================================

/// Shared invocation counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ordered log of events.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// `n -> n * 2` after `latency`. Fails with `NotFound` for 0.
pub fn doubler(calls: &Counter, latency: Duration) -> TaskBuilder<u32, u32> {
    let calls = calls.clone();
    TaskBuilder::new(move |n: u32| {
        let calls = calls.clone();
        async move {
            calls.bump();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if n == 0 {
                return Err(FetchError::NotFound(n));
            }
            Ok(n * 2)
        }
    })
}

/// Fails with `Transient` for the first `failures` calls, then echoes.
pub fn flaky(calls: &Counter, failures: u32) -> TaskBuilder<u32, u32> {
    let calls = calls.clone();
    TaskBuilder::new(move |n: u32| {
        let calls = calls.clone();
        async move {
            if calls.bump() < failures {
                Err(FetchError::Transient)
            } else {
                Ok(n)
            }
        }
    })
}

/// `n -> n * 2`, panicking for 0.
pub fn explosive(calls: &Counter) -> TaskBuilder<u32, u32> {
    let calls = calls.clone();
    TaskBuilder::new(move |n: u32| {
        let calls = calls.clone();
        async move {
            calls.bump();
            if n == 0 {
                panic!("cannot handle zero");
            }
            Ok::<_, FetchError>(n * 2)
        }
    })
}

/// The numbers `1..=9`, sliced by `(offset, count)`.
pub fn pages(calls: &Counter) -> TaskBuilder<(usize, usize), Vec<u32>> {
    let calls = calls.clone();
    TaskBuilder::new(move |(offset, count): (usize, usize)| {
        let calls = calls.clone();
        async move {
            calls.bump();
            let items: Vec<u32> = (1..=9).skip(offset).take(count).collect();
            Ok::<_, FetchError>(items)
        }
    })
}

// ============================================================================
// Resolvers
// ============================================================================

/// Advances the offset by the page size. Optionally reports totals.
pub struct OffsetResolver {
    pub totals: bool,
}

impl PageResolver<(usize, usize), Vec<u32>> for OffsetResolver {
    type Item = u32;

    fn resolve(&self, result: &Vec<u32>, _args: Option<&(usize, usize)>) -> Vec<u32> {
        result.clone()
    }

    fn next_args(&self, _result: &Vec<u32>, previous: &(usize, usize)) -> Option<(usize, usize)> {
        let (offset, count) = *previous;
        Some((offset + count, count))
    }

    fn total_count(&self, _result: &Vec<u32>) -> Option<u64> {
        self.totals.then_some(9)
    }

    fn total_pages(&self, _result: &Vec<u32>) -> Option<u64> {
        self.totals.then_some(3)
    }
}

/// Never produces next-page arguments.
pub struct SinglePage;

impl PageResolver<(usize, usize), Vec<u32>> for SinglePage {
    type Item = u32;

    fn resolve(&self, result: &Vec<u32>, _args: Option<&(usize, usize)>) -> Vec<u32> {
        result.clone()
    }

    fn next_args(&self, _result: &Vec<u32>, _previous: &(usize, usize)) -> Option<(usize, usize)> {
        None
    }
}
