//! Tests for observable tasks.
//!
//! ## Test Organization
//!
//! - `common`: Shared fixtures, error type, actions and resolvers
//! - `basic`: State transitions, forced transitions, accessors, observers
//! - `queue`: Queued execution and cancellation
//! - `cache`: Argument-keyed cache and TTL expiry
//! - `hooks`: Hook ordering and chaining
//! - `middleware`: Timeout, retry, delay/fill and option layering
//! - `paging`: Page accumulation
//! - `persist`: Snapshots and hydration
//!
//! ## Fixtures
//!
//! Most tests use a `doubler` action (`n -> n * 2`, failing for `0`) or a
//! `pages` action slicing `1..=9` by `(offset, count)`.

mod common;

mod paging;
