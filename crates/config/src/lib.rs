// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration schema for the APM agent core.
//!
//! The schema is explicit: every knob is a typed field with a validator and
//! a default, loaded either from a deserialized document or from the
//! `APM_*` environment variables. No reflection is involved; adding a knob
//! means adding a field, a validator and a default here.
//!
//! Invalid service keys and collector addresses fail loading outright since
//! nothing useful can run without them. Any other invalid value is logged
//! and replaced by its default so a typo in one variable does not take the
//! whole agent down.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub mod error;
pub mod filters;
pub mod service_key;

use error::Error;
use filters::{TransactionFilter, TransactionFilters};
use service_key::ServiceKey;

/// Default collector endpoint (`host:port`).
pub const DEFAULT_COLLECTOR: &str = "apm.collector.example.com:443";

/// Default interval between event-batch flushes.
pub const DEFAULT_EVENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Default interval between metric report builds.
pub const DEFAULT_METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on a single outbound RPC request, in bytes.
pub const DEFAULT_MAX_REQUEST_BYTES: u64 = 6_000_000;

/// Default cap on distinct transaction names per reporting cycle.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 200;

/// Default cap on distinct custom-metric names per reporting cycle.
pub const DEFAULT_MAX_CUSTOM_METRICS: usize = 500;

/// Upper bound of the sample-rate scale (samples-per-million).
pub const MAX_SAMPLE_RATE: u32 = 1_000_000;

/// Whether tracing is on for this process or a matched URL.
///
/// The historical spellings `always` and `never` normalise to `enabled` and
/// `disabled` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingMode {
    /// Spans may be sampled and exported.
    #[serde(alias = "always")]
    Enabled,
    /// Nothing is sampled; settings flags are masked off.
    #[serde(alias = "never")]
    Disabled,
}

impl FromStr for TracingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enabled" | "always" => Ok(TracingMode::Enabled),
            "disabled" | "never" => Ok(TracingMode::Disabled),
            other => Err(format!("unknown tracing mode {other:?}")),
        }
    }
}

/// Verbosity of the agent's own diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Full debug output.
    Debug,
}

impl FromStr for DebugLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(DebugLevel::Error),
            "warn" | "warning" => Ok(DebugLevel::Warn),
            "info" => Ok(DebugLevel::Info),
            "debug" => Ok(DebugLevel::Debug),
            other => Err(format!("unknown debug level {other:?}")),
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Collector credential; the agent stays disabled without one.
    #[serde(skip)]
    pub service_key: Option<ServiceKey>,

    /// Collector endpoint as `host:port`.
    pub collector: String,

    /// Path to a trusted certificate bundle for the collector connection.
    pub trusted_cert_path: Option<PathBuf>,

    /// Process-wide tracing mode.
    pub tracing_mode: TracingMode,

    /// Locally configured sample rate in samples-per-million, if any.
    /// Presence marks sampling as "explicitly configured" for the local
    /// merge of remote settings.
    pub sample_rate: Option<u32>,

    /// Local override of the default token-bucket capacity.
    pub bucket_capacity: Option<f64>,

    /// Local override of the default token-bucket refill rate.
    pub bucket_rate: Option<f64>,

    /// Whether operator-requested trigger traces are honoured.
    pub trigger_trace: bool,

    /// Operator-supplied transaction name, honoured only inside a
    /// recognised function-as-a-service environment.
    pub transaction_name: Option<String>,

    /// Alternate hostname reported in host identity.
    pub hostname_alias: Option<String>,

    /// Diagnostics verbosity.
    pub debug_level: DebugLevel,

    /// Interval between event-batch flushes. Server settings may override.
    #[serde(with = "humantime_serde")]
    pub events_flush_interval: Duration,

    /// Interval between metric report builds. Server settings may override.
    #[serde(with = "humantime_serde")]
    pub metrics_flush_interval: Duration,

    /// Largest outbound RPC request the reporter will attempt.
    pub max_request_bytes: u64,

    /// Cap on distinct transaction names per reporting cycle.
    pub max_transactions: usize,

    /// Cap on distinct custom-metric names per reporting cycle.
    pub max_custom_metrics: usize,

    /// Emit the legacy per-method/per-status metric triple instead of the
    /// single combined response-time measurement.
    pub legacy_metrics: bool,

    /// Per-URL tracing overrides, first match wins.
    #[serde(deserialize_with = "deserialize_filters")]
    pub filters: TransactionFilters,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            service_key: None,
            collector: DEFAULT_COLLECTOR.to_owned(),
            trusted_cert_path: None,
            tracing_mode: TracingMode::Enabled,
            sample_rate: None,
            bucket_capacity: None,
            bucket_rate: None,
            trigger_trace: true,
            transaction_name: None,
            hostname_alias: None,
            debug_level: DebugLevel::default(),
            events_flush_interval: DEFAULT_EVENTS_FLUSH_INTERVAL,
            metrics_flush_interval: DEFAULT_METRICS_FLUSH_INTERVAL,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            max_custom_metrics: DEFAULT_MAX_CUSTOM_METRICS,
            legacy_metrics: false,
            filters: TransactionFilters::default(),
        }
    }
}

fn deserialize_filters<'de, D>(deserializer: D) -> Result<TransactionFilters, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries = Vec::<TransactionFilter>::deserialize(deserializer)?;
    TransactionFilters::compile(&entries).map_err(serde::de::Error::custom)
}

impl AgentConfig {
    /// Loads configuration from the `APM_*` environment variables, applying
    /// defaults for anything unset.
    ///
    /// An unparseable service key or collector address is an error; any
    /// other invalid value is logged and falls back to its default.
    pub fn from_env() -> Result<Self, Error> {
        let mut cfg = AgentConfig::default();

        if let Some(raw) = read_env("APM_SERVICE_KEY") {
            cfg.service_key = Some(raw.parse::<ServiceKey>()?);
        }
        if let Some(raw) = read_env("APM_COLLECTOR") {
            validate_collector(&raw)?;
            cfg.collector = raw;
        }
        if let Some(raw) = read_env("APM_TRUSTED_PATH") {
            cfg.trusted_cert_path = Some(PathBuf::from(raw));
        }

        parse_into(&mut cfg.tracing_mode, "APM_TRACING_MODE");
        parse_into(&mut cfg.debug_level, "APM_DEBUG_LEVEL");

        if let Some(raw) = read_env("APM_SAMPLE_RATE") {
            match raw.parse::<u32>() {
                Ok(rate) if rate <= MAX_SAMPLE_RATE => cfg.sample_rate = Some(rate),
                _ => warn_invalid("APM_SAMPLE_RATE", &raw, "expected integer in [0, 1000000]"),
            }
        }
        if let Some(raw) = read_env("APM_TOKEN_BUCKET_CAPACITY") {
            match raw.parse::<f64>() {
                Ok(cap) if cap >= 0.0 => cfg.bucket_capacity = Some(cap),
                _ => warn_invalid("APM_TOKEN_BUCKET_CAPACITY", &raw, "expected number >= 0"),
            }
        }
        if let Some(raw) = read_env("APM_TOKEN_BUCKET_RATE") {
            match raw.parse::<f64>() {
                Ok(rate) if rate >= 0.0 => cfg.bucket_rate = Some(rate),
                _ => warn_invalid("APM_TOKEN_BUCKET_RATE", &raw, "expected number >= 0"),
            }
        }
        if let Some(raw) = read_env("APM_TRIGGER_TRACE") {
            match parse_bool(&raw) {
                Some(v) => cfg.trigger_trace = v,
                None => warn_invalid("APM_TRIGGER_TRACE", &raw, "expected true or false"),
            }
        }
        if let Some(raw) = read_env("APM_TRANSACTION_NAME") {
            cfg.transaction_name = Some(raw);
        }
        if let Some(raw) = read_env("APM_HOSTNAME_ALIAS") {
            cfg.hostname_alias = Some(raw);
        }
        if let Some(raw) = read_env("APM_EVENTS_FLUSH_INTERVAL") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.events_flush_interval = Duration::from_secs(secs),
                _ => warn_invalid("APM_EVENTS_FLUSH_INTERVAL", &raw, "expected seconds > 0"),
            }
        }
        if let Some(raw) = read_env("APM_METRICS_FLUSH_INTERVAL") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.metrics_flush_interval = Duration::from_secs(secs),
                _ => warn_invalid("APM_METRICS_FLUSH_INTERVAL", &raw, "expected seconds > 0"),
            }
        }
        if let Some(raw) = read_env("APM_MAX_REQUEST_BYTES") {
            match raw.parse::<u64>() {
                Ok(bytes) if bytes > 0 => cfg.max_request_bytes = bytes,
                _ => warn_invalid("APM_MAX_REQUEST_BYTES", &raw, "expected bytes > 0"),
            }
        }

        Ok(cfg)
    }

    /// True when sampling behaviour was explicitly configured locally,
    /// which makes the local values participate in the remote merge.
    pub fn has_local_sampling(&self) -> bool {
        self.sample_rate.is_some() || self.tracing_mode == TracingMode::Disabled
    }
}

/// True when the process runs inside a recognised function-as-a-service
/// environment. Both markers must be present; either alone can be set by
/// lookalike container environments.
pub fn in_faas_environment() -> bool {
    env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some() && env::var_os("LAMBDA_TASK_ROOT").is_some()
}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_into<T: FromStr>(slot: &mut T, var: &str) {
    if let Some(raw) = read_env(var) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn_invalid(var, &raw, "unrecognised value"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn warn_invalid(var: &str, value: &str, reason: &str) {
    warn!(var, value, reason, "ignoring invalid configuration value");
}

fn validate_collector(address: &str) -> Result<(), Error> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidCollector {
            address: address.to_owned(),
            reason: "expected host:port".into(),
        })?;
    if host.is_empty() {
        return Err(Error::InvalidCollector {
            address: address.to_owned(),
            reason: "empty host".into(),
        });
    }
    if port.parse::<u16>().is_err() {
        return Err(Error::InvalidCollector {
            address: address.to_owned(),
            reason: format!("bad port {port:?}"),
        });
    }
    Ok(())
}
