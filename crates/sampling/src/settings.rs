// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Remote sampling settings and the store that holds them.
//!
//! Settings are pushed by the collector, merged with local configuration
//! and expire after their TTL. The store keeps one entry per
//! `(type, layer)` key; the sampler only ever consults the default entry.
//! Each entry owns its three token buckets, which survive setting updates
//! so refill state is not reset by every push.

use crate::bucket::TokenBucket;
use crate::flags::{SampleSource, SettingFlags};
use apm_agent_config::{AgentConfig, MAX_SAMPLE_RATE, TracingMode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Argument key: default bucket capacity (little-endian f64).
pub const ARG_BUCKET_CAPACITY: &str = "BucketCapacity";
/// Argument key: default bucket refill rate (little-endian f64).
pub const ARG_BUCKET_RATE: &str = "BucketRate";
/// Argument key: relaxed trigger-trace bucket capacity.
pub const ARG_TRIGGER_RELAXED_CAPACITY: &str = "TriggerRelaxedBucketCapacity";
/// Argument key: relaxed trigger-trace bucket refill rate.
pub const ARG_TRIGGER_RELAXED_RATE: &str = "TriggerRelaxedBucketRate";
/// Argument key: strict trigger-trace bucket capacity.
pub const ARG_TRIGGER_STRICT_CAPACITY: &str = "TriggerStrictBucketCapacity";
/// Argument key: strict trigger-trace bucket refill rate.
pub const ARG_TRIGGER_STRICT_RATE: &str = "TriggerStrictBucketRate";
/// Argument key: HMAC key for trigger-trace signatures.
pub const ARG_SIGNATURE_KEY: &str = "SignatureKey";
/// Argument key: server-controlled metrics flush interval (LE i32 seconds).
pub const ARG_METRICS_FLUSH_INTERVAL: &str = "MetricsFlushInterval";
/// Argument key: server-controlled events flush interval (LE i32 seconds).
pub const ARG_EVENTS_FLUSH_INTERVAL: &str = "EventsFlushInterval";
/// Argument key: server-controlled transaction-name cap (LE i32).
pub const ARG_MAX_TRANSACTIONS: &str = "MaxTransactions";
/// Argument key: server-controlled custom-metrics cap (LE i32).
pub const ARG_MAX_CUSTOM_METRICS: &str = "MaxCustomMetrics";

/// Decodes a little-endian IEEE-754 double argument value.
pub fn decode_f64(bytes: &[u8]) -> Option<f64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(f64::from_le_bytes(arr))
}

/// Decodes a little-endian 32-bit integer argument value.
pub fn decode_i32(bytes: &[u8]) -> Option<i32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(i32::from_le_bytes(arr))
}

/// Which of a setting's buckets a decision draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Regular sampling decisions.
    Default,
    /// Trigger-trace requests with a valid signature.
    TriggerRelaxed,
    /// Trigger-trace requests without a signature.
    TriggerStrict,
}

/// The kind of settings entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingType {
    /// The process-wide default setting.
    Default,
    /// A layer-scoped setting.
    Layer,
}

impl SettingType {
    /// Maps the wire integer to a setting type.
    pub fn from_wire(value: i32) -> Option<SettingType> {
        match value {
            0 => Some(SettingType::Default),
            1 => Some(SettingType::Layer),
            _ => None,
        }
    }
}

/// A settings entry as received and merged.
#[derive(Clone)]
pub struct Setting {
    /// When the entry was received.
    pub timestamp: Instant,
    /// Effective flags after the local merge.
    pub flags: SettingFlags,
    /// Flags exactly as received.
    pub original_flags: SettingFlags,
    /// Effective sample rate in samples-per-million.
    pub value: u32,
    /// Provenance of the effective rate.
    pub source: SampleSource,
    /// Lifetime of the entry.
    pub ttl: Duration,
    /// HMAC key for trigger-trace signature validation; empty when the
    /// collector supplied none.
    pub trigger_token: Arc<[u8]>,
    bucket_default: Arc<TokenBucket>,
    bucket_trigger_relaxed: Arc<TokenBucket>,
    bucket_trigger_strict: Arc<TokenBucket>,
}

impl Setting {
    /// True once the TTL has elapsed.
    pub fn expired(&self, now: Instant) -> bool {
        now > self.timestamp + self.ttl
    }

    /// The bucket backing `kind`.
    pub fn bucket(&self, kind: BucketKind) -> &Arc<TokenBucket> {
        match kind {
            BucketKind::Default => &self.bucket_default,
            BucketKind::TriggerRelaxed => &self.bucket_trigger_relaxed,
            BucketKind::TriggerStrict => &self.bucket_trigger_strict,
        }
    }
}

/// One settings entry from a collector response, pre-merge.
#[derive(Debug, Clone)]
pub struct SettingsUpdate {
    /// Entry kind.
    pub setting_type: SettingType,
    /// Layer the entry scopes to; empty for the default entry.
    pub layer: String,
    /// Flags as received.
    pub flags: SettingFlags,
    /// Sample rate as received; clamped into `[0, 1_000_000]`.
    pub value: i64,
    /// Entry lifetime in seconds.
    pub ttl: Duration,
    /// Byte-encoded argument map.
    pub arguments: HashMap<String, Vec<u8>>,
}

/// The locally configured sampling inputs that participate in the merge.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Process-wide tracing mode.
    pub tracing_mode: TracingMode,
    /// Explicit local sample rate, if any.
    pub sample_rate: Option<u32>,
    /// Whether trigger traces are allowed locally.
    pub trigger_trace: bool,
    /// Local override of the default bucket capacity.
    pub bucket_capacity: Option<f64>,
    /// Local override of the default bucket rate.
    pub bucket_rate: Option<f64>,
}

impl LocalSettings {
    /// True when sampling is explicitly configured locally.
    pub fn is_explicit(&self) -> bool {
        self.sample_rate.is_some() || self.tracing_mode == TracingMode::Disabled
    }
}

impl From<&AgentConfig> for LocalSettings {
    fn from(cfg: &AgentConfig) -> Self {
        LocalSettings {
            tracing_mode: cfg.tracing_mode,
            sample_rate: cfg.sample_rate,
            trigger_trace: cfg.trigger_trace,
            bucket_capacity: cfg.bucket_capacity,
            bucket_rate: cfg.bucket_rate,
        }
    }
}

/// Holds the current settings entries and applies the local merge.
pub struct SettingsStore {
    local: LocalSettings,
    entries: RwLock<HashMap<(SettingType, String), Setting>>,
}

impl SettingsStore {
    /// Creates an empty store with the given local configuration.
    pub fn new(local: LocalSettings) -> SettingsStore {
        SettingsStore {
            local,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Applies one settings entry from a collector response: decodes the
    /// bucket and signature arguments, merges local configuration and
    /// atomically replaces the keyed entry. Buckets of an existing entry
    /// are retained so refill state carries over.
    pub fn update(&self, update: SettingsUpdate) {
        let (value, flags, source) = self.merge_local(update.value, update.flags);

        let trigger_token: Arc<[u8]> = update
            .arguments
            .get(ARG_SIGNATURE_KEY)
            .map(|v| Arc::from(v.as_slice()))
            .unwrap_or_else(|| Arc::from(&[][..]));

        let key = (update.setting_type, update.layer);
        let mut entries = self.entries.write();

        let (bucket_default, bucket_trigger_relaxed, bucket_trigger_strict) =
            match entries.get(&key) {
                Some(existing) => (
                    Arc::clone(&existing.bucket_default),
                    Arc::clone(&existing.bucket_trigger_relaxed),
                    Arc::clone(&existing.bucket_trigger_strict),
                ),
                None => (
                    Arc::new(TokenBucket::new(0.0, 0.0)),
                    Arc::new(TokenBucket::new(0.0, 0.0)),
                    Arc::new(TokenBucket::new(0.0, 0.0)),
                ),
            };

        let arg_f64 = |name: &str| update.arguments.get(name).and_then(|v| decode_f64(v));

        // Local bucket overrides beat the server-supplied default bucket.
        let default_cap = self
            .local
            .bucket_capacity
            .or_else(|| arg_f64(ARG_BUCKET_CAPACITY))
            .unwrap_or(0.0);
        let default_rate = self
            .local
            .bucket_rate
            .or_else(|| arg_f64(ARG_BUCKET_RATE))
            .unwrap_or(0.0);
        bucket_default.set_rate_cap(default_rate, default_cap);
        bucket_trigger_relaxed.set_rate_cap(
            arg_f64(ARG_TRIGGER_RELAXED_RATE).unwrap_or(0.0),
            arg_f64(ARG_TRIGGER_RELAXED_CAPACITY).unwrap_or(0.0),
        );
        bucket_trigger_strict.set_rate_cap(
            arg_f64(ARG_TRIGGER_STRICT_RATE).unwrap_or(0.0),
            arg_f64(ARG_TRIGGER_STRICT_CAPACITY).unwrap_or(0.0),
        );

        let setting = Setting {
            timestamp: Instant::now(),
            flags,
            original_flags: update.flags,
            value,
            source,
            ttl: update.ttl,
            trigger_token,
            bucket_default,
            bucket_trigger_relaxed,
            bucket_trigger_strict,
        };

        debug!(
            value = setting.value,
            flags = ?setting.flags,
            ttl_secs = setting.ttl.as_secs(),
            "applied settings update"
        );
        let _ = entries.insert(key, setting);
    }

    /// Drops expired entries. Returns true while a default entry remains.
    pub fn check_timeout(&self) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, setting| {
            let keep = !setting.expired(now);
            if !keep {
                debug!("settings entry expired");
            }
            keep
        });
        entries.contains_key(&(SettingType::Default, String::new()))
    }

    /// Snapshot of the default setting, if one is active.
    pub fn get(&self) -> Option<Setting> {
        self.entries
            .read()
            .get(&(SettingType::Default, String::new()))
            .cloned()
    }

    /// True while a default setting is present (regardless of expiry;
    /// expiry is applied by the periodic timeout check).
    pub fn has_default(&self) -> bool {
        self.entries
            .read()
            .contains_key(&(SettingType::Default, String::new()))
    }

    /// Merges the received value and flags with local configuration.
    fn merge_local(&self, value: i64, remote: SettingFlags) -> (u32, SettingFlags, SampleSource) {
        let clamped = clamp_rate(value);
        let local_rate = self.local.sample_rate.unwrap_or(MAX_SAMPLE_RATE);

        let (mut value, mut flags, source) =
            if remote.contains(SettingFlags::OVERRIDE) && self.local.is_explicit() {
                (
                    clamped.min(local_rate),
                    remote & SettingFlags::local_mask(self.local.tracing_mode),
                    SampleSource::Default,
                )
            } else if self.local.is_explicit() {
                (
                    local_rate,
                    SettingFlags::local_flags(self.local.tracing_mode),
                    SampleSource::File,
                )
            } else {
                (clamped, remote, SampleSource::Default)
            };

        if !self.local.trigger_trace {
            flags.remove(SettingFlags::TRIGGER_TRACE);
        }
        value = value.min(MAX_SAMPLE_RATE);
        (value, flags, source)
    }
}

fn clamp_rate(value: i64) -> u32 {
    value.clamp(0, i64::from(MAX_SAMPLE_RATE)) as u32
}
