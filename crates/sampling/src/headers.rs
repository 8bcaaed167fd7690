// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP response header composition.
//!
//! The HTTP layer around the SDK exposes the sampling decision to callers
//! through two response headers. The values are composed here so the
//! middleware stays a thin passthrough.

use crate::ids::{FLAG_SAMPLED, SpanId, TraceId};
use crate::trace_state::{OPTIONS_RESPONSE_KEY, TraceState, unescape_options_response};

/// Response header carrying the trace context of the entry span.
pub const XTRACE_HEADER: &str = "X-Trace";

/// Response header answering a request's `X-Trace-Options`.
pub const XTRACE_OPTIONS_RESPONSE_HEADER: &str = "X-Trace-Options-Response";

/// Value for `Access-Control-Expose-Headers` so browsers can read both.
pub const EXPOSE_HEADERS: &str = "X-Trace, X-Trace-Options-Response";

/// Composes the `X-Trace` value: the W3C `traceparent` form with the
/// entry span's id and sampled flag.
pub fn x_trace_value(trace_id: TraceId, span_id: SpanId, sampled: bool) -> String {
    let flags = if sampled { FLAG_SAMPLED } else { 0 };
    format!("00-{trace_id}-{span_id}-{flags:02x}")
}

/// Extracts the `X-Trace-Options-Response` value carried in the internal
/// trace-state slot, undoing the grammar escaping.
pub fn options_response_value(trace_state: &TraceState) -> Option<String> {
    trace_state
        .get(OPTIONS_RESPONSE_KEY)
        .map(unescape_options_response)
}
