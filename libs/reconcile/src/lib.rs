//! Reconciliation loop primitives.
//!
//! This library provides the bookkeeping that periodic reconciliation loops
//! keep between ticks. Key concepts:
//!
//! - **Ground truth**: lives in the external declarative store, never here.
//! - **Caches**: everything in this crate is a cache rebuilt or pruned from
//!   ground truth every tick. Losing it (process restart, loop restart) must
//!   never corrupt state, only cost a little repeated work.
//! - **Edge triggering**: a [`PropagationLedger`] turns a level-triggered loop
//!   into an edge-triggered one for operations that are not safe to repeat.
//!
//! # Invariants
//!
//! - Ledger membership is only ever added after the guarded side effect
//!   succeeded.
//! - Pruning is driven by the caller's view of ground truth.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

/// Idempotency table for side effects that must happen once per key.
///
/// Keys are typically `(request id, resource handle)` pairs. A key is
/// recorded once the side effect succeeded; the loop skips recorded keys
/// even if the target later diverges again.
#[derive(Debug, Clone)]
pub struct PropagationLedger<K: Ord> {
    entries: BTreeSet<K>,
}

impl<K: Ord> Default for PropagationLedger<K> {
    fn default() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }
}

impl<K: Ord> PropagationLedger<K> {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the side effect for this key already happened.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Record a completed side effect.
    ///
    /// Returns false if the key was already present.
    pub fn record(&mut self, key: K) -> bool {
        self.entries.insert(key)
    }

    /// Keep only the entries for which `keep` returns true.
    ///
    /// Returns the number of entries removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|k| keep(k));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A set of markers stamped with the time they were first set.
///
/// Used for "already processed" and "already reported" bookkeeping that must
/// expire after a TTL so identically-named future work is not skipped.
#[derive(Debug, Clone)]
pub struct TrackingSet<K: Ord> {
    markers: BTreeMap<K, DateTime<Utc>>,
}

impl<K: Ord> Default for TrackingSet<K> {
    fn default() -> Self {
        Self {
            markers: BTreeMap::new(),
        }
    }
}

impl<K: Ord> TrackingSet<K> {
    /// Create an empty tracking set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a marker. An existing marker keeps its original timestamp.
    ///
    /// Returns true if the marker is new.
    pub fn mark(&mut self, key: K, at: DateTime<Utc>) -> bool {
        if self.markers.contains_key(&key) {
            return false;
        }
        self.markers.insert(key, at);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.markers.contains_key(key)
    }

    /// When the marker was first set.
    pub fn marked_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.markers.get(key).copied()
    }

    /// Remove a single marker.
    pub fn clear(&mut self, key: &K) -> bool {
        self.markers.remove(key).is_some()
    }

    /// Keep only the markers for which `keep` returns true.
    ///
    /// Returns the number of markers removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K, DateTime<Utc>) -> bool,
    {
        let before = self.markers.len();
        self.markers.retain(|k, at| keep(k, *at));
        before - self.markers.len()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per key.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded for a key within the current window.
    pub fn failure_count(&self, key: &str) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if Instant::now().duration_since(*first) <= self.window => *count,
            _ => 0,
        }
    }

    /// Check if retries are exhausted for a key.
    pub fn is_exhausted(&self, key: &str) -> bool {
        self.failure_count(key) > self.max_retries
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            delay * self.jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Default restart ceiling per supervised loop.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(5 * 60);
