// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Service key parsing and sanitisation.
//!
//! A service key is the credential attached to every outbound collector RPC.
//! It has the shape `<token>:<service-name>` where the token is a 64 or 71
//! character API token and the service name identifies the instrumented
//! service. The name portion is normalised so the collector sees a single
//! canonical spelling regardless of how operators typed it.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Accepted token lengths. Plain API tokens are 64 characters; tokens that
/// embed a region qualifier are 71.
const TOKEN_LENGTHS: [usize; 2] = [64, 71];

/// Maximum length of the service-name portion before sanitisation.
const MAX_NAME_LEN: usize = 255;

/// A validated `<token>:<service-name>` credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceKey {
    token: String,
    name: String,
}

impl ServiceKey {
    /// The token portion of the key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The sanitised service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full credential in wire form, `<token>:<name>`.
    pub fn as_wire(&self) -> String {
        format!("{}:{}", self.token, self.name)
    }
}

// The token is a secret; keep it out of Debug output and logs.
impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKey")
            .field("token", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

impl FromStr for ServiceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, name) = s.split_once(':').ok_or_else(|| Error::InvalidServiceKey {
            reason: "expected <token>:<service-name>".into(),
        })?;

        if !TOKEN_LENGTHS.contains(&token.len()) {
            return Err(Error::InvalidServiceKey {
                reason: format!("token must be 64 or 71 characters, got {}", token.len()),
            });
        }
        if name.is_empty() {
            return Err(Error::InvalidServiceKey {
                reason: "service name is empty".into(),
            });
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidServiceKey {
                reason: format!("service name exceeds {MAX_NAME_LEN} characters"),
            });
        }

        let sanitised = sanitise_name(name);
        if sanitised.is_empty() {
            return Err(Error::InvalidServiceKey {
                reason: "service name has no valid characters".into(),
            });
        }

        Ok(ServiceKey {
            token: token.to_owned(),
            name: sanitised,
        })
    }
}

/// Normalises a service name: lowercase, spaces become hyphens, anything
/// outside `[a-z0-9.:_-]` is stripped.
fn sanitise_name(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | ':' | '_' | '-'))
        .collect()
}
