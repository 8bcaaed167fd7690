// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the agent configuration crate.

/// Errors that can occur while parsing or validating the agent configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The service key does not match the `<token>:<service-name>` shape.
    #[error("invalid service key: {reason}")]
    InvalidServiceKey {
        /// Why the key was rejected. The key itself is never echoed back.
        reason: String,
    },

    /// An environment variable held a value the schema rejects.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnvValue {
        /// Name of the offending environment variable.
        var: String,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A transaction filter entry is malformed.
    #[error("invalid transaction filter: {reason}")]
    InvalidFilter {
        /// Why the filter was rejected.
        reason: String,
    },

    /// The collector address could not be parsed as `host:port`.
    #[error("invalid collector address {address:?}: {reason}")]
    InvalidCollector {
        /// The rejected address.
        address: String,
        /// Why the address was rejected.
        reason: String,
    },
}
