// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The APM agent core: trace sampling and telemetry export.
//!
//! The [`Agent`] is the process-wide root object. It owns the settings
//! store, the entry-span registry, the metrics registry and the reporter,
//! and wires them into the sampler and the span-end hooks the surrounding
//! SDK calls. Construct it once per process; tests build their own
//! fixture instead of sharing it.
//!
//! ```no_run
//! use apm_agent::Agent;
//! use apm_agent_config::AgentConfig;
//!
//! # async fn run() -> Result<(), apm_agent::error::Error> {
//! let config = AgentConfig::from_env()?;
//! let agent = Agent::start(config)?;
//! if agent.wait_until_ready(std::time::Duration::from_secs(5)).await {
//!     // sampling settings are live; decisions will use them
//! }
//! # Ok(())
//! # }
//! ```

use apm_agent_config::{AgentConfig, in_faas_environment};
use apm_agent_metrics::report::{CborReportEncoder, HostId, ReportBuilder};
use apm_agent_metrics::span_metrics::{MetricsRegistry, SpanSummary};
use apm_agent_reporter::channel::Connection;
use apm_agent_reporter::events::{EventQueue, EventSender, ReporterKnobs, StatusSender, event_queues};
use apm_agent_reporter::init::build_init_message;
use apm_agent_reporter::proto;
use apm_agent_reporter::tasks::PeriodicTasks;
use apm_agent_sampling::entry_spans::EntrySpanRegistry;
use apm_agent_sampling::ids::{SpanId, TraceId};
use apm_agent_sampling::sampler::{SampleRequest, SampleResult, Sampler};
use apm_agent_sampling::settings::{LocalSettings, SettingsStore};
use apm_agent_sampling::txn_name::{self, NameSources};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod error;

pub use apm_agent_config as config;
pub use apm_agent_metrics as metrics;
pub use apm_agent_reporter as reporter;
pub use apm_agent_sampling as sampling;

use error::Error;

/// The agent version reported to the collector.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period granted to the senders to drain on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The process-wide agent root object.
pub struct Agent {
    config: AgentConfig,
    settings: Arc<SettingsStore>,
    entry_spans: Arc<EntrySpanRegistry>,
    metrics: Arc<MetricsRegistry>,
    sampler: Sampler,
    queue: EventQueue,
    conn: Arc<Connection>,
    shutdown: CancellationToken,
    ready: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Builds the agent and spawns the reporter tasks.
    ///
    /// Must be called within a Tokio runtime. Fails when no service key is
    /// configured; everything after that is best-effort and recovers
    /// internally.
    pub fn start(config: AgentConfig) -> Result<Agent, Error> {
        let service_key = config
            .service_key
            .clone()
            .ok_or(Error::MissingServiceKey)?;

        let hostname = config
            .hostname_alias
            .clone()
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "unknown".to_owned());
        let pid = process::id();

        let shutdown = CancellationToken::new();
        let conn = Arc::new(Connection::new(
            config.collector.clone(),
            config.trusted_cert_path.clone(),
            service_key.as_wire(),
            proto::HostId {
                hostname: hostname.clone(),
                pid: pid as i32,
            },
            usize::try_from(config.max_request_bytes).unwrap_or(usize::MAX),
            shutdown.clone(),
        ));

        let settings = Arc::new(SettingsStore::new(LocalSettings::from(&config)));
        let entry_spans = Arc::new(EntrySpanRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new(
            config.max_transactions,
            config.max_custom_metrics,
            config.legacy_metrics,
        ));
        let sampler = Sampler::new(Arc::clone(&settings), config.filters.clone());

        let knobs = Arc::new(ReporterKnobs::new(
            config.events_flush_interval,
            config.metrics_flush_interval,
        ));
        let (queue, event_rx, status_rx) = event_queues();

        let host = HostId {
            hostname,
            pid,
        };
        let tasks = Arc::new(PeriodicTasks::new(
            Arc::clone(&conn),
            Arc::clone(&settings),
            Arc::clone(&metrics),
            ReportBuilder::new(host.clone()),
            Arc::new(CborReportEncoder),
            Arc::clone(&knobs),
            Arc::clone(queue.stats()),
            AGENT_VERSION.to_owned(),
        ));
        let ready = tasks.ready_receiver();

        let mut handles = tasks.spawn();
        conn.retain();
        handles.push(tokio::spawn(
            EventSender::new(
                Arc::clone(&conn),
                event_rx,
                knobs,
                Arc::clone(queue.stats()),
                SHUTDOWN_GRACE,
            )
            .run(),
        ));
        conn.retain();
        handles.push(tokio::spawn(
            StatusSender::new(Arc::clone(&conn), status_rx, SHUTDOWN_GRACE).run(),
        ));

        // One-time init event; a failure here is logged and ignored.
        match build_init_message(&host, AGENT_VERSION) {
            Some(message) => {
                if let Err(err) = queue.push_status(message) {
                    debug!(%err, "init message was not queued");
                }
            }
            None => debug!("init message was not encoded"),
        }

        info!(version = AGENT_VERSION, "agent started");
        Ok(Agent {
            config,
            settings,
            entry_spans,
            metrics,
            sampler,
            queue,
            conn,
            shutdown,
            ready,
            handles,
        })
    }

    /// The sampler making per-span decisions.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// The settings store (exposed for tests and diagnostics).
    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// The per-trace entry-span registry.
    pub fn entry_spans(&self) -> &Arc<EntrySpanRegistry> {
        &self.entry_spans
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The producer-side event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Makes the sampling decision for a new span and, for entry spans,
    /// registers it with the entry-span registry.
    pub fn on_span_start(&self, request: &SampleRequest<'_>) -> SampleResult {
        let result = self.sampler.should_sample(request);
        let is_entry = request
            .parent
            .as_ref()
            .map(|p| p.remote)
            .unwrap_or(true);
        if is_entry {
            self.entry_spans.push(request.trace_id, request.span_id);
        }
        result
    }

    /// Derives the transaction name for a finishing entry span, letting a
    /// name attached via the registry and the operator override take
    /// their precedence.
    pub fn transaction_name(&self, trace_id: TraceId, sources: &NameSources<'_>) -> String {
        let attached = self.entry_spans.transaction_name(trace_id);
        let merged = NameSources {
            attached: attached.as_deref().or(sources.attached),
            configured: self
                .config
                .transaction_name
                .as_deref()
                .or(sources.configured),
            in_faas: sources.in_faas || in_faas_environment(),
            ..*sources
        };
        txn_name::derive(&merged)
    }

    /// Records a finished entry span: metrics, the optional serialised
    /// event, and the mandatory registry delete.
    pub fn on_span_end(
        &self,
        trace_id: TraceId,
        span_id: SpanId,
        summary: &SpanSummary,
        event: Option<Vec<u8>>,
    ) {
        self.metrics.record_span(summary);
        if let Some(event) = event {
            if let Err(err) = self.queue.push_event(event) {
                debug!(%err, "span event was not queued");
            }
        }
        if let Err(err) = self.entry_spans.delete(trace_id, span_id) {
            debug!(%err, "entry span was not registered");
        }
    }

    /// Waits until a default sampling setting is live, or the timeout
    /// expires. Returns the ready state.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        if *self.ready.borrow() {
            return true;
        }
        let mut ready = self.ready.clone();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        )
    }

    /// Shuts the agent down: signals every task, lets the senders drain
    /// within their grace period and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        self.conn.release().await;
        info!("agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_agent_sampling::flags::SettingFlags;
    use apm_agent_sampling::settings::{
        ARG_BUCKET_CAPACITY, ARG_BUCKET_RATE, SettingType, SettingsUpdate,
    };
    use std::collections::HashMap;

    fn test_config() -> AgentConfig {
        AgentConfig {
            service_key: Some(
                format!("{}:test-service", "a".repeat(64))
                    .parse()
                    .expect("key should parse"),
            ),
            // Port 1 refuses connections; background RPCs fail fast.
            collector: "localhost:1".to_owned(),
            ..AgentConfig::default()
        }
    }

    fn push_default_setting(agent: &Agent) {
        let mut arguments = HashMap::new();
        let _ = arguments.insert(
            ARG_BUCKET_CAPACITY.to_owned(),
            10.0f64.to_le_bytes().to_vec(),
        );
        let _ = arguments.insert(ARG_BUCKET_RATE.to_owned(), 5.0f64.to_le_bytes().to_vec());
        agent.settings().update(SettingsUpdate {
            setting_type: SettingType::Default,
            layer: String::new(),
            flags: SettingFlags::SAMPLE_START
                | SettingFlags::SAMPLE_THROUGH_ALWAYS
                | SettingFlags::TRIGGER_TRACE,
            value: 1_000_000,
            ttl: Duration::from_secs(120),
            arguments,
        });
    }

    #[tokio::test]
    async fn starts_and_shuts_down() {
        let agent = Agent::start(test_config()).expect("agent should start");
        assert!(!agent.wait_until_ready(Duration::from_millis(20)).await);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn refuses_to_start_without_a_service_key() {
        let config = AgentConfig {
            service_key: None,
            ..test_config()
        };
        assert!(matches!(
            Agent::start(config),
            Err(Error::MissingServiceKey)
        ));
    }

    #[tokio::test]
    async fn span_lifecycle_flows_through_the_agent() {
        let agent = Agent::start(test_config()).expect("agent should start");
        push_default_setting(&agent);

        let trace_id = TraceId([0x11; 16]);
        let span_id = SpanId([0x22; 8]);
        let request = SampleRequest {
            parent: None,
            trace_id,
            span_id,
            xtrace_options: None,
            xtrace_signature: None,
            url: "",
        };
        let result = agent.on_span_start(&request);
        assert!(result.decision.trace);
        assert_eq!(agent.entry_spans().current(trace_id), Some(span_id));

        agent
            .entry_spans()
            .set_transaction_name(trace_id, "checkout")
            .expect("should set name");
        let name = agent.transaction_name(
            trace_id,
            &NameSources {
                span_name: "GET",
                ..NameSources::default()
            },
        );
        assert_eq!(name, "checkout");

        agent.on_span_end(
            trace_id,
            span_id,
            &SpanSummary {
                duration: Duration::from_millis(3),
                is_error: false,
                method: Some("GET".into()),
                status_code: Some(200),
                transaction: name,
            },
            Some(vec![1, 2, 3]),
        );
        assert_eq!(agent.entry_spans().current(trace_id), None);

        let (snapshot, _) = agent.metrics().flush_builtin();
        assert_eq!(snapshot.measurements.len(), 1);

        agent.shutdown().await;
    }
}
