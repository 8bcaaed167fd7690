// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Event and status queues with the byte-bucket batching policy.
//!
//! Producers enqueue serialised event bytes onto a bounded channel and
//! never block: overflow is counted and surfaced as `queue full`. A single
//! sender task drains the channel into batches bounded by a server
//! controllable high-water mark and flush interval, then ships each batch
//! in order through the dispatch channel. Status events use a smaller
//! queue and are sent one at a time, in order.

use crate::channel::{Connection, RpcRequest};
use crate::error::Error;
use apm_agent_metrics::QueueStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capacity of the event byte queue, in events.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Capacity of the status queue, in events.
pub const STATUS_QUEUE_CAPACITY: usize = 100;

/// Default batch high-water mark, in bytes.
pub const DEFAULT_EVENTS_HWM_BYTES: usize = 2_000_000;

/// Server-controllable reporter knobs, shared across tasks.
#[derive(Debug)]
pub struct ReporterKnobs {
    events_hwm_bytes: AtomicUsize,
    events_flush_interval_ms: AtomicU64,
    metrics_flush_interval_ms: AtomicU64,
}

impl ReporterKnobs {
    /// Creates knobs with the given initial intervals.
    pub fn new(events_flush_interval: Duration, metrics_flush_interval: Duration) -> ReporterKnobs {
        ReporterKnobs {
            events_hwm_bytes: AtomicUsize::new(DEFAULT_EVENTS_HWM_BYTES),
            events_flush_interval_ms: AtomicU64::new(as_millis(events_flush_interval)),
            metrics_flush_interval_ms: AtomicU64::new(as_millis(metrics_flush_interval)),
        }
    }

    /// Current batch high-water mark.
    pub fn events_hwm(&self) -> usize {
        self.events_hwm_bytes.load(Ordering::Relaxed)
    }

    /// Updates the batch high-water mark.
    pub fn set_events_hwm(&self, bytes: usize) {
        self.events_hwm_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Current event flush interval.
    pub fn events_flush_interval(&self) -> Duration {
        Duration::from_millis(self.events_flush_interval_ms.load(Ordering::Relaxed))
    }

    /// Updates the event flush interval.
    pub fn set_events_flush_interval(&self, interval: Duration) {
        self.events_flush_interval_ms
            .store(as_millis(interval), Ordering::Relaxed);
    }

    /// Current metrics flush interval.
    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_flush_interval_ms.load(Ordering::Relaxed))
    }

    /// Updates the metrics flush interval.
    pub fn set_metrics_flush_interval(&self, interval: Duration) {
        self.metrics_flush_interval_ms
            .store(as_millis(interval), Ordering::Relaxed);
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Queue counters reported in the builtin metric report.
#[derive(Debug, Default)]
pub struct QueueStatsTracker {
    sent: AtomicU64,
    overflowed: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
    largest: AtomicU64,
}

impl QueueStatsTracker {
    fn record_queued(&self) {
        let _ = self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_overflow(&self) {
        let _ = self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sent(&self, events: u64) {
        let _ = self.sent.fetch_add(events, Ordering::Relaxed);
    }

    fn record_failed(&self, events: u64) {
        let _ = self.failed.fetch_add(events, Ordering::Relaxed);
    }

    fn observe_batch(&self, events: u64) {
        let _ = self.largest.fetch_max(events, Ordering::Relaxed);
    }

    /// Snapshots and zeroes the counters for one report.
    pub fn snapshot_reset(&self) -> QueueStats {
        QueueStats {
            sent: self.sent.swap(0, Ordering::Relaxed),
            overflowed: self.overflowed.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            total: self.total.swap(0, Ordering::Relaxed),
            largest: self.largest.swap(0, Ordering::Relaxed),
        }
    }
}

/// Producer-side handle to the event and status queues.
#[derive(Clone)]
pub struct EventQueue {
    event_tx: mpsc::Sender<Vec<u8>>,
    status_tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<QueueStatsTracker>,
}

impl EventQueue {
    /// Enqueues one serialised span event. Never blocks; a full queue is
    /// counted and reported back as [`Error::QueueFull`].
    pub fn push_event(&self, event: Vec<u8>) -> Result<(), Error> {
        self.stats.record_queued();
        self.event_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.stats.record_overflow();
                Error::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    /// Enqueues one status event.
    pub fn push_status(&self, event: Vec<u8>) -> Result<(), Error> {
        self.status_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    /// The shared queue counters.
    pub fn stats(&self) -> &Arc<QueueStatsTracker> {
        &self.stats
    }
}

/// Builds the queue pair and the receivers for the sender tasks.
pub fn event_queues() -> (EventQueue, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
    let queue = EventQueue {
        event_tx,
        status_tx,
        stats: Arc::new(QueueStatsTracker::default()),
    };
    (queue, event_rx, status_rx)
}

enum BatchEnd {
    /// The flush interval or high-water mark was reached.
    Flush,
    /// Shutdown was requested or the producers went away.
    Shutdown,
}

/// The single sender task draining the event queue into `PostEvents`
/// batches.
pub struct EventSender {
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Vec<u8>>,
    knobs: Arc<ReporterKnobs>,
    stats: Arc<QueueStatsTracker>,
    shutdown_grace: Duration,
}

impl EventSender {
    /// Creates the sender over the dispatch channel.
    pub fn new(
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Vec<u8>>,
        knobs: Arc<ReporterKnobs>,
        stats: Arc<QueueStatsTracker>,
        shutdown_grace: Duration,
    ) -> EventSender {
        EventSender {
            conn,
            rx,
            knobs,
            stats,
            shutdown_grace,
        }
    }

    /// Runs until shutdown, then drains once more if a grace period
    /// remains.
    pub async fn run(mut self) {
        loop {
            let (batch, end) = self.collect_batch().await;
            if !batch.is_empty() {
                self.send(batch).await;
            }
            if matches!(end, BatchEnd::Shutdown) {
                if !self.shutdown_grace.is_zero() {
                    self.drain(Instant::now() + self.shutdown_grace).await;
                }
                debug!("event sender exiting");
                return;
            }
        }
    }

    /// Fills one batch until the high-water mark or the flush interval.
    async fn collect_batch(&mut self) -> (Vec<Vec<u8>>, BatchEnd) {
        let hwm = self.knobs.events_hwm();
        let deadline = Instant::now() + self.knobs.events_flush_interval();
        let mut batch = Vec::new();
        let mut size = 0usize;

        loop {
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => return (batch, BatchEnd::Shutdown),
                _ = tokio::time::sleep_until(deadline) => return (batch, BatchEnd::Flush),
                received = self.rx.recv() => match received {
                    None => return (batch, BatchEnd::Shutdown),
                    Some(event) => {
                        if event.len() > hwm {
                            self.stats.record_overflow();
                            warn!(bytes = event.len(), "dropping oversize event");
                            continue;
                        }
                        size += event.len();
                        batch.push(event);
                        if size >= hwm {
                            return (batch, BatchEnd::Flush);
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, batch: Vec<Vec<u8>>) {
        let events = batch.len() as u64;
        self.stats.observe_batch(events);
        let request = RpcRequest::Events(self.conn.message_request(batch));
        match self.conn.invoke_rpc(request).await {
            Ok(_) => self.stats.record_sent(events),
            Err(err) => {
                self.stats.record_failed(events);
                warn!(%err, "event batch was not delivered");
            }
        }
    }

    /// Final drain after shutdown: ship whatever is already buffered,
    /// bounded by the grace deadline.
    async fn drain(&mut self, deadline: Instant) {
        let hwm = self.knobs.events_hwm();
        loop {
            let mut batch = Vec::new();
            let mut size = 0usize;
            while let Ok(event) = self.rx.try_recv() {
                if event.len() > hwm {
                    self.stats.record_overflow();
                    continue;
                }
                size += event.len();
                batch.push(event);
                if size >= hwm {
                    break;
                }
            }
            if batch.is_empty() || Instant::now() >= deadline {
                return;
            }
            if tokio::time::timeout_at(deadline, self.send(batch)).await.is_err() {
                return;
            }
        }
    }
}

/// The status sender: one event per `PostStatus`, in order.
pub struct StatusSender {
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Vec<u8>>,
    shutdown_grace: Duration,
}

impl StatusSender {
    /// Creates the status sender.
    pub fn new(
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Vec<u8>>,
        shutdown_grace: Duration,
    ) -> StatusSender {
        StatusSender {
            conn,
            rx,
            shutdown_grace,
        }
    }

    /// Runs until shutdown, then drains once more if a grace period
    /// remains.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.conn.shutdown_token().cancelled() => break,
                received = self.rx.recv() => match received {
                    None => break,
                    Some(event) => self.send(event).await,
                }
            }
        }
        if !self.shutdown_grace.is_zero() {
            let deadline = Instant::now() + self.shutdown_grace;
            while let Ok(event) = self.rx.try_recv() {
                if Instant::now() >= deadline {
                    break;
                }
                if tokio::time::timeout_at(deadline, self.send(event)).await.is_err() {
                    break;
                }
            }
        }
        debug!("status sender exiting");
    }

    async fn send(&self, event: Vec<u8>) {
        let request = RpcRequest::Status(self.conn.message_request(vec![event]));
        if let Err(err) = self.conn.invoke_rpc(request).await {
            warn!(%err, "status event was not delivered");
        }
    }
}
