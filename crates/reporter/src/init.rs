// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The one-time startup status event.

use apm_agent_metrics::report::HostId;
use serde::Serialize;

/// Payload of the init status event.
#[derive(Debug, Serialize)]
struct InitMessage<'a> {
    #[serde(rename = "__Init")]
    init: bool,
    #[serde(rename = "Hostname")]
    hostname: &'a str,
    #[serde(rename = "PID")]
    pid: u32,
    #[serde(rename = "Version")]
    version: &'a str,
}

/// Serialises the init event announcing this agent to the collector.
/// Returns `None` when encoding fails; the caller logs and moves on.
pub fn build_init_message(host: &HostId, version: &str) -> Option<Vec<u8>> {
    serde_cbor::to_vec(&InitMessage {
        init: true,
        hostname: &host.hostname,
        pid: host.pid,
        version,
    })
    .ok()
}
