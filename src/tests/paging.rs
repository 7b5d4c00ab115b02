//! Pagination tests.
//!
//! All tests page over the numbers `1..=9` with `(offset, count)`
//! arguments.

use std::time::Duration;

use crate::{Phase, StateChange, TaskError, TaskOptions, UsageError};

use super::common::{pages, Counter, Journal, OffsetResolver, SinglePage};

fn resolver() -> OffsetResolver {
    OffsetResolver { totals: false }
}

/// Test accumulation across pages and the reset on a fresh first page.
///
/// Verifies:
/// - `execute((0, 3))` yields `[1, 2, 3]`
/// - `execute_next()` derives `(3, 3)` and appends `[4, 5, 6]`
/// - A new `execute((0, 3))` starts over at `[1, 2, 3]`
#[tokio::test]
async fn pages_accumulate_and_fresh_execute_resets() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());

    paged.execute((0, 3)).await.expect("first page should load");
    assert_eq!(paged.list(), vec![1, 2, 3]);
    assert_eq!(paged.first_args(), Some((0, 3)));

    paged.execute_next().await.expect("second page should load");
    assert_eq!(paged.list(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(paged.args(), Some((3, 3)));
    assert_eq!(paged.result(), Some(vec![4, 5, 6]));

    paged.execute((0, 3)).await.expect("first page should reload");
    assert_eq!(paged.list(), vec![1, 2, 3]);
    assert_eq!(calls.get(), 3);
}

/// Test that `has_more` turns false on the first empty page.
#[tokio::test]
async fn has_more_defaults_to_non_empty_page() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());

    paged.execute((0, 3)).await.expect("page 1");
    while paged.has_more() {
        paged.execute_next().await.expect("next page");
    }

    assert_eq!(paged.list(), (1..=9).collect::<Vec<u32>>());
    assert_eq!(paged.args(), Some((9, 3)));
    assert_eq!(calls.get(), 4);
}

/// Test totals reported by the resolver.
#[tokio::test]
async fn totals_come_from_resolver() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(OffsetResolver { totals: true });
    assert_eq!(paged.total_items(), 0);

    paged.execute((0, 3)).await.expect("first page should load");

    assert_eq!(paged.total_items(), 9);
    assert_eq!(paged.total_pages(), 3);
}

/// Test the usage errors of next-page calls.
///
/// Verifies:
/// - `execute_next` before any page fails with `NotExecuted`
/// - A resolver that cannot continue fails with `NextArgsNotEmitted`
/// - Neither error runs the action
#[tokio::test]
async fn next_page_usage_errors() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(SinglePage);

    let error = paged.execute_next().await.expect_err("no page yet");
    assert!(matches!(error, TaskError::Usage(UsageError::NotExecuted)));

    paged.execute((0, 3)).await.expect("first page should load");
    let error = paged.execute_next().await.expect_err("resolver stops");
    assert!(matches!(error, TaskError::Usage(UsageError::NextArgsNotEmitted)));

    assert_eq!(calls.get(), 1);
    assert_eq!(paged.list(), vec![1, 2, 3]);
    assert!(paged.was_successful());
}

/// Test explicit next-page arguments.
#[tokio::test]
async fn execute_next_with_explicit_args() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());

    paged.execute((0, 2)).await.expect("first page should load");
    paged
        .execute_next_with((6, 3))
        .await
        .expect("explicit page should load");

    assert_eq!(paged.list(), vec![1, 2, 7, 8, 9]);
    assert_eq!(paged.first_args(), Some((0, 2)));
}

/// Test that reload restarts from the first page's arguments.
#[tokio::test]
async fn reload_restarts_session() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());
    assert_eq!(paged.reload().err(), Some(UsageError::NotExecuted));

    paged.execute((0, 3)).await.expect("first page should load");
    paged.execute_next().await.expect("second page should load");

    paged
        .reload()
        .expect("first args are known")
        .await
        .expect("reload should succeed");

    assert_eq!(paged.list(), vec![1, 2, 3]);
    assert_eq!(paged.args(), Some((0, 3)));
}

/// Test that only first pages are served from the cache.
#[tokio::test]
async fn only_first_page_is_cached() {
    let calls = Counter::default();
    let paged = pages(&calls)
        .options(TaskOptions {
            cached: Some(true),
            ..Default::default()
        })
        .paged(resolver());

    paged.execute((0, 3)).await.expect("page 1");
    paged.execute_next().await.expect("page 2");
    assert_eq!(calls.get(), 2);
    assert!(!paged.is_cached(&(3, 3)));

    paged.execute((0, 3)).await.expect("cached page 1");
    assert_eq!(calls.get(), 2);
    assert_eq!(paged.list(), vec![1, 2, 3]);

    paged.execute_next().await.expect("page 2 again");
    assert_eq!(calls.get(), 3);
    assert_eq!(paged.list(), vec![1, 2, 3, 4, 5, 6]);
}

/// Test forced transitions and reset on a paged task.
///
/// Verifies:
/// - `resolve` injects a new first page
/// - `reject` keeps the list but `get_list` falls back to the default
/// - `reset` clears the list and restores `has_more`
#[tokio::test]
async fn forced_transitions_and_reset() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());
    paged.execute((0, 3)).await.expect("first page should load");

    paged.resolve(vec![7, 8]);
    assert_eq!(paged.list(), vec![7, 8]);
    assert_eq!(paged.get_list(Vec::new()), vec![7, 8]);

    paged.reject(TaskError::Cancelled);
    assert_eq!(paged.list(), vec![7, 8]);
    assert_eq!(paged.get_list(vec![0]), vec![0]);

    paged.resolve(Vec::new());
    assert!(!paged.has_more());

    paged.reset();
    assert!(paged.list().is_empty());
    assert!(paged.has_more());
    assert_eq!(paged.first_args(), None);
    assert_eq!(paged.phase(), Phase::Idle);
    assert_eq!(calls.get(), 1);
}

/// Test that subscribers see list changes.
#[tokio::test]
async fn subscribers_see_list_changes() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());
    let journal = Journal::default();
    let seen = journal.clone();
    let _subscription = paged.subscribe(move |change| {
        if let StateChange::ItemsAppended { count } = change {
            seen.push(format!("+{count}"));
        } else if *change == StateChange::ItemsCleared {
            seen.push("clear");
        }
    });

    paged.execute((0, 3)).await.expect("page 1");
    paged.execute_next().await.expect("page 2");

    assert_eq!(journal.entries(), vec!["clear", "+3", "+3"]);
}

/// Test chaining a plain task into a paged one.
#[tokio::test]
async fn chain_into_paged_task() {
    let calls = Counter::default();
    let source = pages(&calls).build();
    let paged = pages(&calls).paged(resolver());
    let _chain = source.chain(&paged);

    source.execute((2, 2)).await.expect("source should succeed");

    assert_eq!(paged.list(), vec![3, 4]);
    assert!(paged.was_successful());
}

/// Test that `clone_with` keeps the resolver but not the state.
#[tokio::test]
async fn clone_with_keeps_resolver() {
    let calls = Counter::default();
    let paged = pages(&calls).paged(resolver());
    paged.execute((0, 3)).await.expect("first page should load");

    let copy = paged.clone_with(TaskOptions::default());
    assert!(copy.list().is_empty());

    copy.execute((3, 3)).await.expect("copy should load");
    copy.execute_next().await.expect("copy should continue");
    assert_eq!(copy.list(), vec![4, 5, 6, 7, 8, 9]);
    assert_eq!(paged.list(), vec![1, 2, 3]);
}

/// Test that a cached first page waits for a page of the previous session
/// still in flight, so that page never lands in the new session.
///
/// Verifies:
/// - The in-flight page completes the old session
/// - The first page is then served from the cache and starts over
/// - The next derived page continues from the first page
#[tokio::test(start_paused = true)]
async fn cached_first_page_waits_for_in_flight_page() {
    let calls = Counter::default();
    let paged = pages(&calls)
        .cached(true)
        .queued(true)
        .delay(Duration::from_millis(50))
        .paged(resolver());
    paged.execute((0, 3)).await.expect("page 1");
    paged.execute_next().await.expect("page 2");

    let in_flight = paged.execute_next();
    let restart = paged.execute((0, 3));
    assert_eq!(paged.list(), (1..=6).collect::<Vec<u32>>());

    assert_eq!(in_flight.await.ok(), Some(vec![7, 8, 9]));
    assert_eq!(restart.await.ok(), Some(vec![1, 2, 3]));
    assert_eq!(paged.list(), vec![1, 2, 3]);
    assert_eq!(calls.get(), 3);

    paged.execute_next().await.expect("page 2 again");
    assert_eq!(paged.list(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(calls.get(), 4);
}
