// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff for collector RPC retries.

use std::time::Duration;

/// Attempts before an invocation gives up.
pub const MAX_RETRIES: u32 = 20;

/// Delay before the first retry.
pub const INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Growth factor between consecutive delays.
pub const MULTIPLIER: f64 = 1.5;

/// Ceiling on any single delay.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// The delay before retry `attempt` (1-based):
/// `min(MAX_DELAY, INITIAL_DELAY * MULTIPLIER^(attempt - 1))`.
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = MULTIPLIER.powi(attempt.saturating_sub(1) as i32);
    let delay = INITIAL_DELAY.mul_f64(factor.min(1e6));
    delay.min(MAX_DELAY)
}
