//! Argument-keyed result cache.
//!
//! Entries are identified by structural equality of their call arguments.
//! An entry is created before the action runs (its `result` is `None` while
//! the call is in flight) and filled once the call succeeds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::options::duration_ms;

/// One invocation of a task: its arguments, outcome and optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord<A, T> {
    /// Arguments the action was called with.
    pub args: A,
    /// Last computed result, `None` until the call succeeds.
    pub result: Option<T>,
    /// Absolute expiry (Unix millis). `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl<A, T> CallRecord<A, T> {
    /// A fresh record with no result and no expiry.
    pub fn new(args: A) -> Self {
        Self {
            args,
            result: None,
            expires: None,
        }
    }

    /// Returns `true` if the record has not expired at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        self.expires.map_or(true, |expires| expires > now)
    }
}

/// Call records keyed by argument equality, with optional time-to-live.
#[derive(Debug, Clone)]
pub struct FingerprintCache<A, T> {
    records: Vec<CallRecord<A, T>>,
    ttl: Option<Duration>,
}

impl<A, T> FingerprintCache<A, T>
where
    A: PartialEq + Clone,
    T: Clone,
{
    /// Create an empty cache. Entries expire `ttl` after insertion.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: Vec::new(),
            ttl,
        }
    }

    /// The live entry for `args`, filled or still in flight.
    pub fn find(&self, args: &A, now: u64) -> Option<&CallRecord<A, T>> {
        self.records
            .iter()
            .find(|record| record.args == *args && record.is_live(now))
    }

    /// The cached result for `args`, if a live entry has one.
    pub fn hit(&self, args: &A, now: u64) -> Option<&CallRecord<A, T>> {
        self.find(args, now).filter(|record| record.result.is_some())
    }

    /// Create an in-flight entry for `args`, replacing any previous one.
    pub fn insert(&mut self, args: A, now: u64) -> &CallRecord<A, T> {
        self.records
            .retain(|record| record.args != args && record.is_live(now));
        let expires = self.ttl.map(|ttl| now.saturating_add(duration_ms(ttl)));
        self.records.push(CallRecord {
            args,
            result: None,
            expires,
        });
        &self.records[self.records.len() - 1]
    }

    /// Store `result` in the entry for `args`. Returns `false` if the entry
    /// was invalidated while the call was in flight.
    pub fn fill(&mut self, args: &A, result: T) -> bool {
        match self.records.iter_mut().find(|record| record.args == *args) {
            Some(record) => {
                record.result = Some(result);
                true
            }
            None => false,
        }
    }

    /// Drop every entry, or only the one matching `args`.
    pub fn invalidate(&mut self, args: Option<&A>) {
        match args {
            Some(args) => self.records.retain(|record| record.args != *args),
            None => self.records.clear(),
        }
    }

    /// Whether a live entry exists for `args`.
    pub fn is_cached(&self, args: &A, now: u64) -> bool {
        self.find(args, now).is_some()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn evict_expired(&mut self, now: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|record| record.is_live(now));
        before - self.records.len()
    }

    /// Copies of all live entries.
    pub fn live(&self, now: u64) -> Vec<CallRecord<A, T>> {
        self.records
            .iter()
            .filter(|record| record.is_live(now))
            .cloned()
            .collect()
    }

    /// Replace the contents, e.g. when restoring a snapshot.
    pub fn replace(&mut self, records: Vec<CallRecord<A, T>>) {
        self.records = records;
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
