// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Telemetry dispatch for the APM agent core.
//!
//! The reporter owns the gRPC channel to the collector and everything
//! scheduled on top of it: event batching under a high-water-mark policy,
//! status uploads, the settings control loop with TTL expiry, the aligned
//! metrics flush, and the keep-alive ping. Delivery is best effort with
//! bounded buffering; the only failure that stops the reporter is a
//! rejected service key.

pub mod backoff;
pub mod channel;
pub mod client;
pub mod error;
pub mod events;
pub mod init;
pub mod proto;
pub mod tasks;

pub use channel::{Connection, RpcReply, RpcRequest};
pub use client::{CollectorClient, EndpointConfig};
pub use events::{EventQueue, EventSender, ReporterKnobs, StatusSender, event_queues};
pub use proto::RpcMethod;
pub use tasks::PeriodicTasks;
