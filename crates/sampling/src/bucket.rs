// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Token bucket with continuous refill.
//!
//! Admission control for sampling decisions: the bucket refills at
//! `rate_per_sec` up to `capacity` and every admission costs one token.
//! The per-decision counters feed the request counters of the metric
//! reports and are flushed on every reporting cycle.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Snapshot of bucket counters taken by [`TokenBucket::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounters {
    /// Decisions that consulted this bucket.
    pub requested: u64,
    /// Root-span decisions (no upstream parent).
    pub sampled: u64,
    /// Decisions refused because the bucket was empty.
    pub limited: u64,
    /// Decisions admitted.
    pub traced: u64,
    /// Admitted decisions that continued an upstream trace.
    pub through: u64,
    /// Admitted operator-requested trigger traces.
    pub triggered: u64,
}

#[derive(Debug)]
struct BucketState {
    rate_per_sec: f64,
    capacity: f64,
    available: f64,
    last_refill: Instant,
}

/// A rate limiter with continuous refill and flushable counters.
///
/// The refill state lives under a bucket-local mutex; counters are plain
/// atomics so `flush` never contends with the decision path.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    requested: AtomicU64,
    sampled: AtomicU64,
    limited: AtomicU64,
    traced: AtomicU64,
    through: AtomicU64,
    triggered: AtomicU64,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    pub fn new(rate_per_sec: f64, capacity: f64) -> TokenBucket {
        let rate_per_sec = rate_per_sec.max(0.0);
        let capacity = capacity.max(0.0);
        TokenBucket {
            state: Mutex::new(BucketState {
                rate_per_sec,
                capacity,
                available: capacity,
                last_refill: Instant::now(),
            }),
            requested: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            limited: AtomicU64::new(0),
            traced: AtomicU64::new(0),
            through: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
        }
    }

    /// Assigns a new rate and capacity, clamping the available tokens to
    /// the new capacity. Negative inputs are treated as zero.
    pub fn set_rate_cap(&self, rate_per_sec: f64, capacity: f64) {
        let mut state = self.state.lock();
        state.rate_per_sec = rate_per_sec.max(0.0);
        state.capacity = capacity.max(0.0);
        if state.available > state.capacity {
            state.available = state.capacity;
        }
    }

    /// The current (rate, capacity) pair.
    pub fn rate_cap(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.rate_per_sec, state.capacity)
    }

    /// Counts a decision through the bucket.
    ///
    /// `sampled` is the outcome the caller wants to admit; `has_parent`
    /// marks continuations of an upstream trace; `rate_limit` spends a
    /// token on admission. Returns whether the decision is admitted.
    pub fn count(&self, sampled: bool, has_parent: bool, rate_limit: bool) -> bool {
        let _ = self.requested.fetch_add(1, Ordering::Relaxed);
        if !has_parent {
            let _ = self.sampled.fetch_add(1, Ordering::Relaxed);
        }
        if !sampled {
            return false;
        }
        if rate_limit && !self.consume(1.0) {
            let _ = self.limited.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if has_parent {
            let _ = self.through.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.traced.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Records an admitted trigger trace for the request counters.
    pub fn count_triggered(&self) {
        let _ = self.triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Refills by elapsed time, then takes `tokens` if available.
    fn consume(&self, tokens: f64) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.available = (state.available + state.rate_per_sec * elapsed).min(state.capacity);
        if state.available >= tokens {
            state.available -= tokens;
            true
        } else {
            false
        }
    }

    /// Atomically snapshots and zeroes the counters.
    pub fn flush(&self) -> BucketCounters {
        BucketCounters {
            requested: self.requested.swap(0, Ordering::Relaxed),
            sampled: self.sampled.swap(0, Ordering::Relaxed),
            limited: self.limited.swap(0, Ordering::Relaxed),
            traced: self.traced.swap(0, Ordering::Relaxed),
            through: self.through.swap(0, Ordering::Relaxed),
            triggered: self.triggered.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        // Zero refill rate: only the initial capacity is spendable.
        let bucket = TokenBucket::new(0.0, 2.0);
        assert!(bucket.count(true, false, true));
        assert!(bucket.count(true, false, true));
        assert!(!bucket.count(true, false, true));

        let counters = bucket.flush();
        assert_eq!(counters.requested, 3);
        assert_eq!(counters.traced, 2);
        assert_eq!(counters.limited, 1);
    }

    #[test]
    fn unsampled_decisions_never_spend_tokens() {
        let bucket = TokenBucket::new(0.0, 1.0);
        assert!(!bucket.count(false, false, true));
        // The token is still there for a sampled decision.
        assert!(bucket.count(true, false, true));
    }

    #[test]
    fn no_rate_limit_skips_the_bucket() {
        let bucket = TokenBucket::new(0.0, 0.0);
        assert!(bucket.count(true, false, false));
        let counters = bucket.flush();
        assert_eq!(counters.limited, 0);
        assert_eq!(counters.traced, 1);
    }

    #[test]
    fn parent_decisions_count_through() {
        let bucket = TokenBucket::new(0.0, 1.0);
        assert!(bucket.count(true, true, false));
        let counters = bucket.flush();
        assert_eq!(counters.through, 1);
        // Continuations do not count toward the root-span counter.
        assert_eq!(counters.sampled, 0);
    }

    #[test]
    fn set_rate_cap_clamps_available() {
        let bucket = TokenBucket::new(0.0, 5.0);
        bucket.set_rate_cap(0.0, 1.0);
        assert!(bucket.count(true, false, true));
        assert!(!bucket.count(true, false, true));
    }

    #[test]
    fn negative_inputs_are_clamped() {
        let bucket = TokenBucket::new(-3.0, -1.0);
        assert_eq!(bucket.rate_cap(), (0.0, 0.0));
        assert!(!bucket.count(true, false, true));
    }

    #[test]
    fn flush_zeroes_counters() {
        let bucket = TokenBucket::new(0.0, 1.0);
        let _ = bucket.count(true, false, true);
        let _ = bucket.flush();
        assert_eq!(bucket.flush(), BucketCounters::default());
    }
}
