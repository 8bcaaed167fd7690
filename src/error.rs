// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the agent root object.

/// Errors that can occur while starting the agent.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] apm_agent_config::error::Error),

    /// No service key was configured; the agent cannot report.
    #[error("no service key configured")]
    MissingServiceKey,

    /// The reporter could not be constructed.
    #[error(transparent)]
    Reporter(#[from] apm_agent_reporter::error::Error),
}
