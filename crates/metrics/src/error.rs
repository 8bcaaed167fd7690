// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the metrics crate.

/// Errors that can occur while recording or reporting metrics.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The distinct-name cap was reached and the name is not yet tracked.
    #[error("metric count limit exceeded for {name:?}")]
    ExceedsMetricsCountLimit {
        /// The name that did not fit.
        name: String,
    },

    /// The report could not be serialised into its container encoding.
    #[error("metric report encoding failed: {0}")]
    Encode(#[from] serde_cbor::Error),

    /// A histogram payload could not be serialised.
    #[error("histogram serialization failed: {details}")]
    HistogramSerialize {
        /// A description of the serializer failure.
        details: String,
    },
}
