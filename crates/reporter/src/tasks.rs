// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Periodic reporter tasks.
//!
//! Four loops drive the agent: the settings fetch (30 s), the settings TTL
//! check (10 s), the aligned metrics flush (60 s by default, server
//! controllable) and the keep-alive ping (after 20 s idle). Each loop runs
//! its work inline before sleeping again, so a slow cycle coalesces
//! overlapping ticks instead of piling them up. All loops exit when the
//! connection's shutdown token fires.

use crate::channel::{Connection, RpcRequest};
use crate::events::{QueueStatsTracker, ReporterKnobs};
use apm_agent_metrics::report::{ReportBuilder, ReportEncoder, RequestCounters};
use apm_agent_metrics::span_metrics::MetricsRegistry;
use apm_agent_sampling::flags::SettingFlags;
use apm_agent_sampling::settings::{
    ARG_EVENTS_FLUSH_INTERVAL, ARG_MAX_CUSTOM_METRICS, ARG_MAX_TRANSACTIONS,
    ARG_METRICS_FLUSH_INTERVAL, BucketKind, SettingType, SettingsStore, SettingsUpdate,
    decode_i32,
};
use crate::proto::RemoteSetting;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interval between settings fetches.
pub const SETTINGS_FETCH_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between settings TTL checks.
pub const SETTINGS_TTL_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Idle time after which a keep-alive ping is sent.
pub const PING_IDLE_THRESHOLD: Duration = Duration::from_secs(20);

/// How often the ping loop samples the idle time.
const PING_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The periodic task driver.
pub struct PeriodicTasks {
    conn: Arc<Connection>,
    settings: Arc<SettingsStore>,
    metrics: Arc<MetricsRegistry>,
    builder: ReportBuilder,
    encoder: Arc<dyn ReportEncoder>,
    knobs: Arc<ReporterKnobs>,
    queue_stats: Arc<QueueStatsTracker>,
    client_version: String,
    ready: watch::Sender<bool>,
}

impl PeriodicTasks {
    /// Creates the driver; `ready` flips true once a default setting is
    /// live and false when it expires.
    pub fn new(
        conn: Arc<Connection>,
        settings: Arc<SettingsStore>,
        metrics: Arc<MetricsRegistry>,
        builder: ReportBuilder,
        encoder: Arc<dyn ReportEncoder>,
        knobs: Arc<ReporterKnobs>,
        queue_stats: Arc<QueueStatsTracker>,
        client_version: String,
    ) -> PeriodicTasks {
        let (ready, _) = watch::channel(false);
        PeriodicTasks {
            conn,
            settings,
            metrics,
            builder,
            encoder,
            knobs,
            queue_stats,
            client_version,
            ready,
        }
    }

    /// A receiver observing the process "ready" flag.
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Spawns all four loops.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self).settings_loop()),
            tokio::spawn(Arc::clone(&self).ttl_loop()),
            tokio::spawn(Arc::clone(&self).metrics_loop()),
            tokio::spawn(self.ping_loop()),
        ]
    }

    async fn settings_loop(self: Arc<Self>) {
        // Fetch immediately on startup, then on the interval.
        loop {
            self.fetch_settings().await;
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => return,
                _ = tokio::time::sleep(SETTINGS_FETCH_INTERVAL) => {}
            }
        }
    }

    async fn fetch_settings(&self) {
        let request = RpcRequest::Settings(self.conn.settings_request(&self.client_version));
        let reply = match self.conn.invoke_rpc(request).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%err, "settings fetch failed");
                return;
            }
        };
        let Some(result) = reply.into_settings() else {
            return;
        };

        for setting in result.settings {
            let Some(update) = to_update(&setting) else {
                debug!(setting_type = setting.r#type, "skipping unknown setting type");
                continue;
            };
            self.apply_server_knobs(&setting.arguments);
            self.settings.update(update);
        }
        if self.settings.has_default() {
            let _ = self.ready.send_replace(true);
        }
    }

    /// Applies the server-controlled knobs carried in setting arguments.
    fn apply_server_knobs(&self, arguments: &HashMap<String, Vec<u8>>) {
        let arg_secs = |name: &str| {
            arguments
                .get(name)
                .and_then(|v| decode_i32(v))
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64))
        };
        if let Some(interval) = arg_secs(ARG_EVENTS_FLUSH_INTERVAL) {
            self.knobs.set_events_flush_interval(interval);
        }
        if let Some(interval) = arg_secs(ARG_METRICS_FLUSH_INTERVAL) {
            self.knobs.set_metrics_flush_interval(interval);
        }
        if let Some(cap) = arguments
            .get(ARG_MAX_TRANSACTIONS)
            .and_then(|v| decode_i32(v))
            .filter(|cap| *cap > 0)
        {
            self.metrics.set_max_transactions(cap as usize);
        }
        if let Some(cap) = arguments
            .get(ARG_MAX_CUSTOM_METRICS)
            .and_then(|v| decode_i32(v))
            .filter(|cap| *cap > 0)
        {
            self.metrics.set_max_custom_metrics(cap as usize);
        }
    }

    async fn ttl_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => return,
                _ = tokio::time::sleep(SETTINGS_TTL_CHECK_INTERVAL) => {}
            }
            let has_default = self.settings.check_timeout();
            let _ = self.ready.send_replace(has_default);
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        loop {
            let interval = self.knobs.metrics_flush_interval();
            let delay = next_flush_delay(unix_millis(), interval);
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.flush_metrics(interval).await;
        }
    }

    async fn flush_metrics(&self, interval: Duration) {
        let (snapshot, histograms) = self.metrics.flush_builtin();
        let counters = self.flush_request_counters();
        let queue_stats = self.queue_stats.snapshot_reset();

        let builtin = self.builder.build_builtin(
            snapshot,
            histograms,
            counters,
            queue_stats,
            Vec::new(),
            interval.as_secs(),
        );
        let mut messages = match self.encoder.encode(&builtin) {
            Ok(bytes) => vec![bytes],
            Err(err) => {
                warn!(%err, "builtin metric report was not encoded");
                return;
            }
        };

        let custom = self.metrics.flush_custom();
        if !custom.measurements.is_empty() {
            match self
                .encoder
                .encode(&self.builder.build_custom(custom, interval.as_secs()))
            {
                Ok(bytes) => messages.push(bytes),
                Err(err) => warn!(%err, "custom metric report was not encoded"),
            }
        }

        let request = RpcRequest::Metrics(self.conn.message_request(messages));
        if let Err(err) = self.conn.invoke_rpc(request).await {
            warn!(%err, "metric report was not delivered");
        }
    }

    /// Sums and resets the request counters over the setting's buckets.
    fn flush_request_counters(&self) -> RequestCounters {
        let mut counters = RequestCounters::default();
        if let Some(setting) = self.settings.get() {
            for kind in [
                BucketKind::Default,
                BucketKind::TriggerRelaxed,
                BucketKind::TriggerStrict,
            ] {
                counters.add(setting.bucket(kind).flush());
            }
        }
        counters
    }

    async fn ping_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => return,
                _ = tokio::time::sleep(PING_CHECK_INTERVAL) => {}
            }
            if self.conn.idle_for() < PING_IDLE_THRESHOLD {
                continue;
            }
            let request = RpcRequest::Ping(self.conn.ping_request());
            // Ping is not retried; INVALID_API_KEY cancels the shutdown
            // token inside invoke_rpc, anything else just logs.
            if let Err(err) = self.conn.invoke_rpc(request).await {
                debug!(%err, "keep-alive ping failed");
            }
        }
    }
}

/// Converts a wire settings entry into a store update.
fn to_update(setting: &RemoteSetting) -> Option<SettingsUpdate> {
    let setting_type = SettingType::from_wire(setting.r#type)?;
    Some(SettingsUpdate {
        setting_type,
        layer: setting.layer.clone(),
        flags: SettingFlags::from_wire(&setting.flags),
        value: setting.value,
        ttl: Duration::from_secs(setting.ttl.max(0) as u64),
        arguments: setting.arguments.clone(),
    })
}

/// Time until the next aligned flush boundary:
/// `floor(now / interval + 1) * interval`.
fn next_flush_delay(now_millis: u64, interval: Duration) -> Duration {
    let interval_millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
    let next = (now_millis / interval_millis + 1) * interval_millis;
    Duration::from_millis(next - now_millis)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_is_aligned_to_the_interval() {
        let interval = Duration::from_secs(60);
        // 10 s past a boundary: 50 s to the next one.
        assert_eq!(
            next_flush_delay(10_000, interval),
            Duration::from_secs(50)
        );
        // Exactly on a boundary: a full interval to the next.
        assert_eq!(
            next_flush_delay(120_000, interval),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn wire_settings_convert_to_updates() {
        let mut setting = RemoteSetting {
            r#type: 0,
            flags: "SAMPLE_START,TRIGGER_TRACE".into(),
            timestamp: 0,
            value: 500_000,
            layer: String::new(),
            arguments: HashMap::new(),
            ttl: 120,
        };
        let _ = setting
            .arguments
            .insert("BucketCapacity".into(), 4.0f64.to_le_bytes().to_vec());

        let update = to_update(&setting).expect("should convert");
        assert_eq!(update.setting_type, SettingType::Default);
        assert_eq!(update.value, 500_000);
        assert_eq!(update.ttl, Duration::from_secs(120));
        assert!(update.flags.contains(SettingFlags::SAMPLE_START));
        assert!(update.flags.contains(SettingFlags::TRIGGER_TRACE));
        assert!(!update.flags.contains(SettingFlags::SAMPLE_THROUGH));
    }

    #[test]
    fn unknown_setting_types_are_skipped() {
        let setting = RemoteSetting {
            r#type: 42,
            flags: String::new(),
            timestamp: 0,
            value: 0,
            layer: String::new(),
            arguments: HashMap::new(),
            ttl: 0,
        };
        assert!(to_update(&setting).is_none());
    }

    #[test]
    fn negative_ttl_clamps_to_zero() {
        let setting = RemoteSetting {
            r#type: 0,
            flags: String::new(),
            timestamp: 0,
            value: 0,
            layer: String::new(),
            arguments: HashMap::new(),
            ttl: -5,
        };
        let update = to_update(&setting).expect("should convert");
        assert_eq!(update.ttl, Duration::ZERO);
    }
}
