// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Metric report assembly.
//!
//! A report bundles host identity, measurements, compressed histograms,
//! queue statistics and the sampling request counters into one document.
//! The binary container format belongs to the collector protocol, so the
//! report model only requires a [`ReportEncoder`]; the in-tree default
//! encodes CBOR.

use crate::error::Error;
use crate::histogram::HistogramSnapshot;
use crate::measurements::{Measurement, MeasurementsSnapshot};
use crate::span_metrics::{LEGACY_RESPONSE_TIME_METRIC, LEGACY_TAG_TRANSACTION};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest reported tag key; longer keys are truncated.
pub const MAX_TAG_KEY_LEN: usize = 64;

/// Longest reported tag value; longer values are truncated.
pub const MAX_TAG_VALUE_LEN: usize = 255;

/// Identity of the reporting host.
#[derive(Debug, Clone, Serialize)]
pub struct HostId {
    /// Hostname, or the configured alias.
    pub hostname: String,
    /// Process id.
    pub pid: u32,
}

/// Event-queue statistics for one reporting cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Events successfully handed to the collector.
    pub sent: u64,
    /// Events dropped because the queue was full.
    pub overflowed: u64,
    /// Events that failed to send.
    pub failed: u64,
    /// Total events queued.
    pub total: u64,
    /// Largest batch shipped.
    pub largest: u64,
}

/// Sampling request counters, summed over a setting's buckets.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RequestCounters {
    /// Decisions requested.
    #[serde(rename = "RequestCount")]
    pub request_count: u64,
    /// Decisions admitted.
    #[serde(rename = "TraceCount")]
    pub trace_count: u64,
    /// Decisions refused by an empty bucket.
    #[serde(rename = "TokenBucketExhaustionCount")]
    pub token_bucket_exhaustion_count: u64,
    /// Root-span decisions.
    #[serde(rename = "SampleCount")]
    pub sample_count: u64,
    /// Admitted continuations of upstream traces.
    #[serde(rename = "ThroughTraceCount")]
    pub through_trace_count: u64,
    /// Admitted trigger traces.
    #[serde(rename = "TriggeredTraceCount")]
    pub triggered_trace_count: u64,
}

impl RequestCounters {
    /// Folds one bucket's counters into the totals.
    pub fn add(&mut self, counters: apm_agent_sampling::BucketCounters) {
        self.request_count += counters.requested;
        self.trace_count += counters.traced;
        self.token_bucket_exhaustion_count += counters.limited;
        self.sample_count += counters.sampled;
        self.through_trace_count += counters.through;
        self.triggered_trace_count += counters.triggered;
    }
}

/// A named gauge reported alongside the measurements.
#[derive(Debug, Clone, Serialize)]
pub struct Gauge {
    /// Gauge name.
    pub name: String,
    /// Gauge value.
    pub value: f64,
}

/// One measurement in wire form.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMeasurement {
    /// Metric name.
    pub name: String,
    /// Number of recordings.
    pub count: u64,
    /// Accumulated sum, when the measurement reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    /// Tags, truncated to the wire limits.
    pub tags: BTreeMap<String, String>,
}

impl From<Measurement> for ReportMeasurement {
    fn from(m: Measurement) -> Self {
        let tags = m
            .tags
            .into_iter()
            .map(|(k, v)| (truncate(k, MAX_TAG_KEY_LEN), truncate(v, MAX_TAG_VALUE_LEN)))
            .collect();
        ReportMeasurement {
            name: m.name,
            count: m.count,
            sum: m.report_sum.then_some(m.sum),
            tags,
        }
    }
}

/// One histogram entry in wire form.
#[derive(Debug, Clone, Serialize)]
pub struct ReportHistogram {
    /// Metric name.
    pub name: String,
    /// Compressed HDR payload.
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
    /// Tags; the global histogram carries none.
    pub tags: BTreeMap<String, String>,
}

/// A complete metric report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// Reporting host identity.
    pub host: HostId,
    /// Microseconds since the Unix epoch at build time.
    pub timestamp_micros: u64,
    /// Seconds covered by this report.
    pub flush_interval_secs: u64,
    /// Accumulated measurements.
    pub measurements: Vec<ReportMeasurement>,
    /// Compressed histograms.
    pub histograms: Vec<ReportHistogram>,
    /// Event-queue statistics, present in builtin reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_stats: Option<QueueStats>,
    /// Sampling request counters, present in builtin reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<RequestCounters>,
    /// Host and runtime gauges.
    pub gauges: Vec<Gauge>,
    /// True when the transaction-name cap was hit during the cycle.
    #[serde(rename = "TransactionNameOverflow")]
    pub transaction_name_overflow: bool,
}

/// Serialises reports into the collector's container encoding.
pub trait ReportEncoder: Send + Sync {
    /// Encodes one report into bytes.
    fn encode(&self, report: &MetricsReport) -> Result<Vec<u8>, Error>;
}

/// The default CBOR container encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborReportEncoder;

impl ReportEncoder for CborReportEncoder {
    fn encode(&self, report: &MetricsReport) -> Result<Vec<u8>, Error> {
        Ok(serde_cbor::to_vec(report)?)
    }
}

/// Assembles reports from flushed registry state.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    host: HostId,
}

impl ReportBuilder {
    /// Creates a builder reporting under the given host identity.
    pub fn new(host: HostId) -> ReportBuilder {
        ReportBuilder { host }
    }

    /// Builds the builtin report: span measurements, histograms, queue
    /// stats and request counters.
    pub fn build_builtin(
        &self,
        snapshot: MeasurementsSnapshot,
        histograms: Vec<HistogramSnapshot>,
        counters: RequestCounters,
        queue_stats: QueueStats,
        gauges: Vec<Gauge>,
        flush_interval_secs: u64,
    ) -> MetricsReport {
        let histograms = histograms
            .into_iter()
            .map(|h| {
                let mut tags = BTreeMap::new();
                if !h.transaction.is_empty() {
                    let _ = tags.insert(
                        LEGACY_TAG_TRANSACTION.to_owned(),
                        truncate(h.transaction, MAX_TAG_VALUE_LEN),
                    );
                }
                ReportHistogram {
                    name: LEGACY_RESPONSE_TIME_METRIC.to_owned(),
                    payload: h.payload,
                    tags,
                }
            })
            .collect();

        MetricsReport {
            host: self.host.clone(),
            timestamp_micros: unix_micros(),
            flush_interval_secs,
            measurements: snapshot.measurements.into_iter().map(Into::into).collect(),
            histograms,
            queue_stats: Some(queue_stats),
            counters: Some(counters),
            gauges,
            transaction_name_overflow: snapshot.overflowed,
        }
    }

    /// Builds the custom-metrics report.
    pub fn build_custom(
        &self,
        snapshot: MeasurementsSnapshot,
        flush_interval_secs: u64,
    ) -> MetricsReport {
        MetricsReport {
            host: self.host.clone(),
            timestamp_micros: unix_micros(),
            flush_interval_secs,
            measurements: snapshot.measurements.into_iter().map(Into::into).collect(),
            histograms: Vec::new(),
            queue_stats: None,
            counters: None,
            gauges: Vec::new(),
            transaction_name_overflow: snapshot.overflowed,
        }
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// Histogram payloads serialise as byte strings, not integer arrays.
fn serialize_payload<S: serde::Serializer>(
    bytes: &[u8],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_bytes(bytes)
}
