// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Keyed measurement counters with a transaction-name cap.
//!
//! A measurement is keyed by `(name, report_sum, sorted tags)` and
//! accumulates a count and an optional sum. The container enforces a cap
//! on distinct transaction names per reporting cycle: once the cap is hit,
//! new names overflow into the synthetic `other` transaction and the
//! overflow flag surfaces in the next report. The cap itself is
//! server-controlled and staged: `set_cap` takes effect at the next reset.

use std::collections::{HashMap, HashSet};

/// The synthetic transaction that absorbs measurements past the cap.
pub const OTHER_TRANSACTION: &str = "other";

/// One accumulated measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Metric name.
    pub name: String,
    /// Number of recordings.
    pub count: u64,
    /// Accumulated sum; meaningful only when `report_sum` is set.
    pub sum: f64,
    /// Whether the sum is reported alongside the count.
    pub report_sum: bool,
    /// Sorted tag pairs.
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MeasurementKey {
    name: String,
    report_sum: bool,
    tags: Vec<(String, String)>,
}

/// Measurement container with the staged transaction-name cap.
#[derive(Debug)]
pub struct Measurements {
    measurements: HashMap<MeasurementKey, Measurement>,
    transactions: HashSet<String>,
    cap_current: usize,
    cap_next: usize,
    overflowed: bool,
}

/// Everything drained by one reporting cycle.
#[derive(Debug, Clone)]
pub struct MeasurementsSnapshot {
    /// The accumulated measurements.
    pub measurements: Vec<Measurement>,
    /// True when the transaction cap was hit during the cycle.
    pub overflowed: bool,
}

impl Measurements {
    /// Creates an empty container with the given transaction cap.
    pub fn new(cap: usize) -> Measurements {
        Measurements {
            measurements: HashMap::new(),
            transactions: HashSet::new(),
            cap_current: cap,
            cap_next: cap,
            overflowed: false,
        }
    }

    /// Stages a new cap; it becomes effective at the next [`reset`].
    ///
    /// [`reset`]: Measurements::reset
    pub fn set_cap(&mut self, cap: usize) {
        self.cap_next = cap;
    }

    /// The cap in effect for the current cycle.
    pub fn cap(&self) -> usize {
        self.cap_current
    }

    /// Admits a transaction name under the cap. Known names are always
    /// admitted; a new name is admitted while there is room, otherwise the
    /// overflow flag is raised and the caller must file under
    /// [`OTHER_TRANSACTION`].
    pub fn is_within_limit(&mut self, name: &str) -> bool {
        if self.transactions.contains(name) {
            return true;
        }
        if self.transactions.len() < self.cap_current {
            let _ = self.transactions.insert(name.to_owned());
            return true;
        }
        self.overflowed = true;
        false
    }

    /// Upserts a measurement, adding `count` and, when present, `sum`.
    pub fn record(&mut self, name: &str, tags: &[(String, String)], count: u64, sum: Option<f64>) {
        let mut sorted = tags.to_vec();
        sorted.sort();
        let key = MeasurementKey {
            name: name.to_owned(),
            report_sum: sum.is_some(),
            tags: sorted.clone(),
        };
        let entry = self.measurements.entry(key).or_insert_with(|| Measurement {
            name: name.to_owned(),
            count: 0,
            sum: 0.0,
            report_sum: sum.is_some(),
            tags: sorted,
        });
        entry.count += count;
        if let Some(sum) = sum {
            entry.sum += sum;
        }
    }

    /// True once a new transaction name was refused this cycle.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of distinct measurement keys currently held.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// True when nothing has been recorded this cycle.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Drains the container for one report: returns the measurements and
    /// the overflow flag, promotes the staged cap and clears all state.
    pub fn reset(&mut self) -> MeasurementsSnapshot {
        let snapshot = MeasurementsSnapshot {
            measurements: self.measurements.drain().map(|(_, m)| m).collect(),
            overflowed: self.overflowed,
        };
        self.transactions.clear();
        self.overflowed = false;
        self.cap_current = self.cap_next;
        snapshot
    }
}
