// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-service metrics aggregation for the APM agent core.
//!
//! Finished entry spans feed HDR response-time histograms and keyed
//! measurement counters; a server-supplied cap bounds the number of
//! distinct transaction names per reporting cycle, with an `other`
//! overflow bucket. The periodic flush drains everything into encoded
//! reports for the dispatcher.

pub mod error;
pub mod histogram;
pub mod measurements;
pub mod report;
pub mod span_metrics;

pub use histogram::{HistogramRegistry, HistogramSnapshot};
pub use measurements::{Measurement, Measurements, MeasurementsSnapshot, OTHER_TRANSACTION};
pub use report::{
    CborReportEncoder, Gauge, HostId, MetricsReport, QueueStats, ReportBuilder, ReportEncoder,
    RequestCounters,
};
pub use span_metrics::{MetricsRegistry, SpanSummary};
