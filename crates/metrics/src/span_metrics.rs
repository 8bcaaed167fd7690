// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Span-end metric recording.
//!
//! Every finished entry span contributes one response-time recording to
//! the global histogram, a set of measurements keyed by its transaction
//! name, and (while the transaction cap holds) a per-transaction
//! histogram. Two tag schemas exist: the native combined-tag form and a
//! legacy triple kept for older collectors.

use crate::error::Error;
use crate::histogram::{HistogramRegistry, HistogramSnapshot};
use crate::measurements::{
    Measurements, MeasurementsSnapshot, OTHER_TRANSACTION,
};
use parking_lot::Mutex;
use std::time::Duration;

/// Native response-time metric name.
pub const RESPONSE_TIME_METRIC: &str = "ResponseTime";
/// Legacy response-time metric name.
pub const LEGACY_RESPONSE_TIME_METRIC: &str = "TransactionResponseTime";

/// Native tag: transaction name.
pub const TAG_TRANSACTION: &str = "sw.transaction";
/// Native tag: whether the span ended in error.
pub const TAG_IS_ERROR: &str = "sw.is_error";
/// Native tag: HTTP request method.
pub const TAG_METHOD: &str = "http.method";
/// Native tag: HTTP response status code.
pub const TAG_STATUS: &str = "http.status_code";

/// Legacy tag: transaction name.
pub const LEGACY_TAG_TRANSACTION: &str = "TransactionName";
/// Legacy tag: HTTP request method.
pub const LEGACY_TAG_METHOD: &str = "HttpMethod";
/// Legacy tag: HTTP response status code.
pub const LEGACY_TAG_STATUS: &str = "HttpStatus";

/// What span-end processing derived from a finished entry span.
#[derive(Debug, Clone)]
pub struct SpanSummary {
    /// Wall duration of the span.
    pub duration: Duration,
    /// Whether the span ended in error.
    pub is_error: bool,
    /// HTTP request method, when the span served HTTP.
    pub method: Option<String>,
    /// HTTP response status code, when known.
    pub status_code: Option<u16>,
    /// The derived transaction name.
    pub transaction: String,
}

/// Aggregates histograms, built-in measurements and custom metrics for
/// one service.
pub struct MetricsRegistry {
    histograms: HistogramRegistry,
    measurements: Mutex<Measurements>,
    custom: Mutex<Measurements>,
    legacy: bool,
}

impl MetricsRegistry {
    /// Creates a registry with the given caps and tag schema.
    pub fn new(max_transactions: usize, max_custom_metrics: usize, legacy: bool) -> MetricsRegistry {
        MetricsRegistry {
            histograms: HistogramRegistry::new(),
            measurements: Mutex::new(Measurements::new(max_transactions)),
            custom: Mutex::new(Measurements::new(max_custom_metrics)),
            legacy,
        }
    }

    /// Stages a new transaction-name cap for the next cycle.
    pub fn set_max_transactions(&self, cap: usize) {
        self.measurements.lock().set_cap(cap);
    }

    /// Stages a new custom-metrics cap for the next cycle.
    pub fn set_max_custom_metrics(&self, cap: usize) {
        self.custom.lock().set_cap(cap);
    }

    /// Records a finished entry span.
    pub fn record_span(&self, span: &SpanSummary) {
        let micros = duration_micros(span.duration);

        // The global histogram sees every span, capped or not.
        self.histograms.record_global(micros);

        let within_limit = {
            let mut measurements = self.measurements.lock();
            let within_limit = measurements.is_within_limit(&span.transaction);
            let transaction = if within_limit {
                span.transaction.as_str()
            } else {
                OTHER_TRANSACTION
            };
            // Tag lists are built after the overflow decision so a
            // redirected span regenerates them under "other".
            if self.legacy {
                record_legacy(&mut measurements, span, transaction, micros);
            } else {
                record_native(&mut measurements, span, transaction, micros);
            }
            within_limit
        };

        if within_limit {
            self.histograms.record_transaction(&span.transaction, micros);
        }
    }

    /// Increments a custom counter metric.
    pub fn custom_increment(&self, name: &str, tags: &[(String, String)]) -> Result<(), Error> {
        let mut custom = self.custom.lock();
        if !custom.is_within_limit(name) {
            return Err(Error::ExceedsMetricsCountLimit {
                name: name.to_owned(),
            });
        }
        custom.record(name, tags, 1, None);
        Ok(())
    }

    /// Records a custom summary metric value.
    pub fn custom_summary(
        &self,
        name: &str,
        value: f64,
        tags: &[(String, String)],
    ) -> Result<(), Error> {
        let mut custom = self.custom.lock();
        if !custom.is_within_limit(name) {
            return Err(Error::ExceedsMetricsCountLimit {
                name: name.to_owned(),
            });
        }
        custom.record(name, tags, 1, Some(value));
        Ok(())
    }

    /// Drains the built-in measurements and histograms for one report.
    pub fn flush_builtin(&self) -> (MeasurementsSnapshot, Vec<HistogramSnapshot>) {
        let snapshot = self.measurements.lock().reset();
        let histograms = self.histograms.flush();
        (snapshot, histograms)
    }

    /// Drains the custom metrics for one report.
    pub fn flush_custom(&self) -> MeasurementsSnapshot {
        self.custom.lock().reset()
    }
}

fn record_native(
    measurements: &mut Measurements,
    span: &SpanSummary,
    transaction: &str,
    micros: u64,
) {
    let mut tags = vec![
        (TAG_TRANSACTION.to_owned(), transaction.to_owned()),
        (TAG_IS_ERROR.to_owned(), span.is_error.to_string()),
    ];
    if let Some(method) = span.method.as_deref() {
        tags.push((TAG_METHOD.to_owned(), method.to_owned()));
    }
    if let Some(status) = span.status_code {
        tags.push((TAG_STATUS.to_owned(), status.to_string()));
    }
    measurements.record(RESPONSE_TIME_METRIC, &tags, 1, Some(micros as f64));
}

fn record_legacy(
    measurements: &mut Measurements,
    span: &SpanSummary,
    transaction: &str,
    micros: u64,
) {
    let name_only = vec![(LEGACY_TAG_TRANSACTION.to_owned(), transaction.to_owned())];
    measurements.record(LEGACY_RESPONSE_TIME_METRIC, &name_only, 1, Some(micros as f64));

    if let Some(method) = span.method.as_deref() {
        let tags = vec![
            (LEGACY_TAG_TRANSACTION.to_owned(), transaction.to_owned()),
            (LEGACY_TAG_METHOD.to_owned(), method.to_owned()),
        ];
        measurements.record(LEGACY_RESPONSE_TIME_METRIC, &tags, 1, Some(micros as f64));
    }
    if let Some(status) = span.status_code {
        let tags = vec![
            (LEGACY_TAG_TRANSACTION.to_owned(), transaction.to_owned()),
            (LEGACY_TAG_STATUS.to_owned(), status.to_string()),
        ];
        measurements.record(LEGACY_RESPONSE_TIME_METRIC, &tags, 1, Some(micros as f64));
    }
}

fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
