// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the reporter crate.
//!
//! Most transport failures are retried internally; what surfaces here is
//! either terminal (an invalid service key, retries exhausted) or a
//! producer-visible condition such as a full queue.

use crate::proto::RpcMethod;

/// Errors raised by the dispatch channel and the event pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request exceeds the configured size cap; never retried.
    #[error("{method} request of {size} bytes exceeds the {max}-byte cap")]
    RequestTooBig {
        /// The method whose request was oversized.
        method: RpcMethod,
        /// Size of the encoded request.
        size: usize,
        /// The configured cap.
        max: usize,
    },

    /// The collector rejected the service key. Terminal: the reporter
    /// shuts down.
    #[error("collector rejected the service key")]
    InvalidApiKey,

    /// All retry attempts were exhausted.
    #[error("{method} gave up after {attempts} attempts: {last_error}")]
    GiveUpAfterRetries {
        /// The method that kept failing.
        method: RpcMethod,
        /// Number of attempts made.
        attempts: u32,
        /// The last transport or server error observed.
        last_error: String,
    },

    /// The redirect cap was exceeded within one invocation.
    #[error("{method} exceeded the redirect limit")]
    RedirectLimit {
        /// The method being redirected.
        method: RpcMethod,
    },

    /// A non-retryable method failed.
    #[error("{method} failed: {details}")]
    Transport {
        /// The method that failed.
        method: RpcMethod,
        /// The transport error.
        details: String,
    },

    /// The bounded queue is full; the caller may drop or retry.
    #[error("queue full")]
    QueueFull,

    /// The reporter is shutting down.
    #[error("reporter is shutting down")]
    ShuttingDown,

    /// The collector endpoint could not be constructed.
    #[error("endpoint configuration error: {details}")]
    Endpoint {
        /// What went wrong while building the endpoint.
        details: String,
    },

    /// Reading the trusted certificate bundle failed.
    #[error("trusted certificate error: {0}")]
    TrustedCert(#[from] std::io::Error),
}
