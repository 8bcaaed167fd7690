// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! HDR response-time histograms.
//!
//! One global histogram plus one per transaction name, all configured for
//! durations between one microsecond and one hour at three significant
//! figures. Out-of-range durations are logged and dropped rather than
//! clamped so a misbehaving clock cannot skew the distribution.

use crate::error::Error;
use hdrhistogram::Histogram;
use hdrhistogram::serialization::{Serializer, V2DeflateSerializer};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Lowest recordable duration, in microseconds.
pub const HIST_MIN_MICROS: u64 = 1;

/// Highest recordable duration: one hour, in microseconds.
pub const HIST_MAX_MICROS: u64 = 3_600_000_000;

/// Significant figures kept by the histograms.
pub const HIST_SIGFIGS: u8 = 3;

/// A single HDR histogram bound to a transaction name; the empty name is
/// the global histogram.
pub struct ResponseTimeHistogram {
    inner: Histogram<u64>,
}

impl ResponseTimeHistogram {
    /// Creates an empty histogram with the standard bounds.
    pub fn new() -> ResponseTimeHistogram {
        ResponseTimeHistogram {
            inner: Histogram::new_with_bounds(HIST_MIN_MICROS, HIST_MAX_MICROS, HIST_SIGFIGS)
                .expect("histogram bounds are constants within the supported range"),
        }
    }

    /// Records a duration in microseconds. Returns false (after logging)
    /// when the value is outside the histogram bounds.
    pub fn record(&mut self, micros: u64) -> bool {
        match self.inner.record(micros) {
            Ok(()) => true,
            Err(err) => {
                warn!(micros, %err, "dropping out-of-range response time");
                false
            }
        }
    }

    /// Number of recorded values.
    pub fn count(&self) -> u64 {
        self.inner.len()
    }

    /// Serialises the histogram into the compressed V2 wire payload.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        let mut serializer = V2DeflateSerializer::new();
        let _ = serializer
            .serialize(&self.inner, &mut buf)
            .map_err(|e| Error::HistogramSerialize {
                details: e.to_string(),
            })?;
        Ok(buf)
    }
}

impl Default for ResponseTimeHistogram {
    fn default() -> Self {
        ResponseTimeHistogram::new()
    }
}

/// A serialised histogram ready for the report builder.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// The transaction name; empty for the global histogram.
    pub transaction: String,
    /// Number of recorded values.
    pub count: u64,
    /// Compressed HDR payload.
    pub payload: Vec<u8>,
}

/// The global histogram plus the per-transaction set.
#[derive(Default)]
pub struct HistogramRegistry {
    inner: Mutex<Histograms>,
}

#[derive(Default)]
struct Histograms {
    global: ResponseTimeHistogram,
    by_transaction: HashMap<String, ResponseTimeHistogram>,
}

impl HistogramRegistry {
    /// Creates an empty registry.
    pub fn new() -> HistogramRegistry {
        HistogramRegistry::default()
    }

    /// Records into the global histogram.
    pub fn record_global(&self, micros: u64) {
        let _ = self.inner.lock().global.record(micros);
    }

    /// Records into a transaction's histogram, creating it lazily.
    pub fn record_transaction(&self, transaction: &str, micros: u64) {
        let mut inner = self.inner.lock();
        let _ = inner
            .by_transaction
            .entry(transaction.to_owned())
            .or_default()
            .record(micros);
    }

    /// Serialises every non-empty histogram and resets the registry.
    /// Histograms that fail to serialise are logged and skipped.
    pub fn flush(&self) -> Vec<HistogramSnapshot> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(1 + inner.by_transaction.len());

        let global = std::mem::take(&mut inner.global);
        if global.count() > 0 {
            match global.encode() {
                Ok(payload) => out.push(HistogramSnapshot {
                    transaction: String::new(),
                    count: global.count(),
                    payload,
                }),
                Err(err) => warn!(%err, "skipping global histogram"),
            }
        }

        for (transaction, histogram) in inner.by_transaction.drain() {
            if histogram.count() == 0 {
                continue;
            }
            match histogram.encode() {
                Ok(payload) => out.push(HistogramSnapshot {
                    count: histogram.count(),
                    transaction,
                    payload,
                }),
                Err(err) => warn!(%err, "skipping transaction histogram"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_range_values() {
        let mut hist = ResponseTimeHistogram::new();
        assert!(hist.record(1));
        assert!(hist.record(1_000));
        assert!(hist.record(HIST_MAX_MICROS));
        assert_eq!(hist.count(), 3);
    }

    #[test]
    fn drops_out_of_range_values() {
        let mut hist = ResponseTimeHistogram::new();
        assert!(!hist.record(HIST_MAX_MICROS * 2));
        assert_eq!(hist.count(), 0);
    }

    #[test]
    fn encodes_a_non_empty_payload() {
        let mut hist = ResponseTimeHistogram::new();
        let _ = hist.record(42);
        let payload = hist.encode().expect("should serialise");
        assert!(!payload.is_empty());
    }

    #[test]
    fn registry_flush_returns_and_resets() {
        let registry = HistogramRegistry::new();
        registry.record_global(100);
        registry.record_transaction("/orders", 100);
        registry.record_transaction("/orders", 200);

        let snapshots = registry.flush();
        assert_eq!(snapshots.len(), 2);
        let global = snapshots
            .iter()
            .find(|s| s.transaction.is_empty())
            .expect("global snapshot");
        assert_eq!(global.count, 1);
        let orders = snapshots
            .iter()
            .find(|s| s.transaction == "/orders")
            .expect("transaction snapshot");
        assert_eq!(orders.count, 2);

        // Flushed state is gone.
        assert!(registry.flush().is_empty());
    }

    #[test]
    fn empty_histograms_are_not_reported() {
        let registry = HistogramRegistry::new();
        assert!(registry.flush().is_empty());
    }
}
