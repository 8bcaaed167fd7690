// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the sampling crate.

use crate::ids::{SpanId, TraceId};

/// Errors reported by the entry-span registry.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No entry-span stack exists for the trace.
    #[error("unknown trace {trace_id}")]
    UnknownTrace {
        /// The trace that has no live entry spans.
        trace_id: TraceId,
    },

    /// The trace is known but the span is not on its stack.
    #[error("unknown span {span_id} in trace {trace_id}")]
    UnknownSpan {
        /// The trace whose stack was searched.
        trace_id: TraceId,
        /// The span that was not found.
        span_id: SpanId,
    },
}
