// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! X-Trace-Options parsing and trigger-trace authentication.
//!
//! Operators can force a sample of a single request by sending an
//! `X-Trace-Options` header, optionally signed with an HMAC over the raw
//! header value. Parsing never rejects the header: unrecognised or
//! malformed tokens are collected and echoed back as `ignored`.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Signed requests must carry a timestamp within this many seconds of the
/// agent clock. The bound is exclusive: exactly five minutes off fails.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Parsed `X-Trace-Options` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XTraceOptions {
    /// The `trigger-trace` token was present.
    pub trigger_trace: bool,
    /// Value of `sw-keys`, if present.
    pub sw_keys: Option<String>,
    /// `custom-*` entries in header order.
    pub custom: Vec<(String, String)>,
    /// Parsed `ts` value, if present and numeric.
    pub timestamp: Option<i64>,
    /// `pf-*` entries passed through untouched.
    pub pass_through: Vec<(String, String)>,
    /// Keys that were not recognised or were malformed.
    pub ignored: Vec<String>,
}

impl XTraceOptions {
    /// Parses a semicolon-separated `key[=value]` list.
    pub fn parse(header: &str) -> XTraceOptions {
        let mut options = XTraceOptions::default();
        for token in header.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (token, None),
            };
            match (key, value) {
                ("trigger-trace", None) => options.trigger_trace = true,
                // trigger-trace takes no value; one present voids the token.
                ("trigger-trace", Some(_)) => options.ignored.push(key.to_owned()),
                ("sw-keys", Some(v)) => options.sw_keys = Some(v.to_owned()),
                ("ts", Some(v)) => match v.parse::<i64>() {
                    Ok(ts) => options.timestamp = Some(ts),
                    Err(_) => options.ignored.push(key.to_owned()),
                },
                (k, Some(v)) if k.starts_with("custom-") => {
                    options.custom.push((k.to_owned(), v.to_owned()));
                }
                (k, Some(v)) if k.starts_with("pf-") => {
                    options.pass_through.push((k.to_owned(), v.to_owned()));
                }
                _ => options.ignored.push(key.to_owned()),
            }
        }
        options
    }
}

/// Outcome of validating an `X-Trace-Options-Signature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// The signature is valid.
    Ok,
    /// The `ts` option is missing, unparseable or outside the skew bound.
    BadTimestamp,
    /// The current setting carries no signature key.
    NoSignatureKey,
    /// The HMAC did not match.
    BadSignature,
}

impl AuthStatus {
    /// The wire spelling used in the response header.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Ok => "ok",
            AuthStatus::BadTimestamp => "bad-timestamp",
            AuthStatus::NoSignatureKey => "no-signature-key",
            AuthStatus::BadSignature => "bad-signature",
        }
    }

    /// True for [`AuthStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, AuthStatus::Ok)
    }
}

/// Validates a signature over the raw options string.
///
/// `timestamp` is the parsed `ts` option; `now_unix` the agent clock in
/// Unix seconds. Checks run in order: timestamp, key presence, HMAC.
pub fn authenticate(
    options: &str,
    signature: &str,
    token: &[u8],
    timestamp: Option<i64>,
    now_unix: i64,
) -> AuthStatus {
    let Some(ts) = timestamp else {
        return AuthStatus::BadTimestamp;
    };
    if (now_unix - ts).abs() >= MAX_TIMESTAMP_SKEW_SECS {
        return AuthStatus::BadTimestamp;
    }
    if token.is_empty() {
        return AuthStatus::NoSignatureKey;
    }
    let Ok(expected) = hex::decode(signature) else {
        return AuthStatus::BadSignature;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(token) else {
        return AuthStatus::BadSignature;
    };
    mac.update(options.as_bytes());
    if mac.verify_slice(&expected).is_ok() {
        AuthStatus::Ok
    } else {
        AuthStatus::BadSignature
    }
}

/// Signs an options string, returning the lowercase hex digest.
pub fn sign(options: &str, token: &[u8]) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(token).ok()?;
    mac.update(options.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// How the trigger-trace request relates to its signature state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// No trigger trace was requested.
    NotPresent,
    /// The signature failed validation; the whole request is refused.
    Invalid,
    /// Valid signature: the relaxed bucket applies.
    Relaxed,
    /// No signature: the strict bucket applies.
    Strict,
}

impl TriggerMode {
    /// Derives the mode from the parsed options and the signature outcome
    /// (`None` when no signature header was sent).
    pub fn derive(options: &XTraceOptions, auth: Option<AuthStatus>) -> TriggerMode {
        match auth {
            Some(status) if !status.is_ok() => TriggerMode::Invalid,
            _ if !options.trigger_trace => TriggerMode::NotPresent,
            Some(_) => TriggerMode::Relaxed,
            None => TriggerMode::Strict,
        }
    }

    /// True when the decision must take the trigger-trace path.
    pub fn requested(&self) -> bool {
        !matches!(self, TriggerMode::NotPresent)
    }
}

/// Composes the `X-Trace-Options-Response` value.
///
/// An invalid signature yields only the auth segment; otherwise the
/// trigger-trace segment is present, prefixed by `auth=ok` when a valid
/// signature was supplied. Ignored keys are echoed back last.
pub fn compose_response(
    auth: Option<AuthStatus>,
    trigger_trace: &str,
    ignored: &[String],
) -> String {
    let mut out = String::new();
    match auth {
        Some(status) if !status.is_ok() => {
            out.push_str("auth=");
            out.push_str(status.as_str());
            return out;
        }
        Some(status) => {
            out.push_str("auth=");
            out.push_str(status.as_str());
            out.push(';');
        }
        None => {}
    }
    out.push_str("trigger-trace=");
    out.push_str(trigger_trace);
    if !ignored.is_empty() {
        out.push_str(";ignored=");
        out.push_str(&ignored.join(","));
    }
    out
}
