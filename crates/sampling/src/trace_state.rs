// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! W3C `tracestate` round-tripping and the `sw` vendor entry.
//!
//! The sampler carries its decision downstream as an `sw` vendor entry of
//! the form `<16-hex-span-id>-<2-hex-flags>`. A second, process-internal
//! slot transports the composed X-Trace-Options response between the
//! sampler and the HTTP layer; its value is escaped so it stays inside the
//! tracestate value grammar.

use crate::ids::SpanId;
use std::fmt;

/// The vendor key carrying the upstream sampling decision.
pub const VENDOR_KEY: &str = "sw";

/// Internal slot carrying the X-Trace-Options response during in-process
/// propagation. Never emitted to foreign services.
pub const OPTIONS_RESPONSE_KEY: &str = "xtrace_options_response";

/// Hard cap on list members per the tracestate grammar.
const MAX_ENTRIES: usize = 32;

/// Cap on the serialised length the agent will propagate.
const MAX_LEN: usize = 256;

/// An ordered `key=value` list modelling the `tracestate` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceState {
    entries: Vec<(String, String)>,
}

impl TraceState {
    /// Parses a `tracestate` header value. Malformed list members are
    /// skipped; the rest of the header is kept.
    pub fn parse(header: &str) -> TraceState {
        let mut entries = Vec::new();
        for member in header.split(',') {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            if let Some((key, value)) = member.split_once('=') {
                if is_valid_key(key) && !value.is_empty() && entries.len() < MAX_ENTRIES {
                    entries.push((key.to_owned(), value.to_owned()));
                }
            }
        }
        TraceState { entries }
    }

    /// The value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Inserts or replaces `key`, moving it to the front as the most
    /// recently mutated entry. Overflowing entries are evicted from the
    /// tail; the freshly inserted entry is never evicted.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.insert(0, (key.to_owned(), value.to_owned()));
        self.entries.truncate(MAX_ENTRIES);
        while self.entries.len() > 1 && self.serialized_len() > MAX_LEN {
            let _ = self.entries.pop();
        }
    }

    /// Removes `key` if present.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialises every entry except the given keys, preserving order.
    /// Used to capture foreign vendor entries into a span attribute.
    pub fn others_except(&self, excluded: &[&str]) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            if excluded.contains(&k.as_str()) {
                continue;
            }
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    fn serialized_len(&self) -> usize {
        let kv: usize = self.entries.iter().map(|(k, v)| k.len() + v.len() + 1).sum();
        kv + self.entries.len().saturating_sub(1)
    }
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// The parsed `sw` vendor entry: upstream span id and trace flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwEntry {
    /// Span id of the upstream entry span.
    pub span_id: SpanId,
    /// Trace flags; only bit 0 (sampled) is consumed.
    pub flags: u8,
}

impl SwEntry {
    /// Parses the `<16-hex>-<2-hex>` vendor value; anything else is the
    /// sentinel "invalid" (`None`).
    pub fn parse(value: &str) -> Option<SwEntry> {
        let (id_part, flag_part) = value.split_once('-')?;
        if id_part.len() != 16 || flag_part.len() != 2 {
            return None;
        }
        if !is_lower_hex(id_part) || !is_lower_hex(flag_part) {
            return None;
        }
        let span_id = SpanId::from_hex(id_part)?;
        let mut flag_byte = [0u8; 1];
        hex::decode_to_slice(flag_part, &mut flag_byte).ok()?;
        Some(SwEntry {
            span_id,
            flags: flag_byte[0],
        })
    }

    /// True when the upstream decision was "sampled".
    pub fn sampled(&self) -> bool {
        self.flags & crate::ids::FLAG_SAMPLED != 0
    }
}

impl fmt::Display for SwEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02x}", self.span_id, self.flags)
    }
}

/// Escapes an X-Trace-Options response for transport inside a tracestate
/// value, where `=` and `,` are reserved by the grammar.
pub fn escape_options_response(response: &str) -> String {
    response.replace('=', "####").replace(',', "....")
}

/// Reverses [`escape_options_response`].
pub fn unescape_options_response(value: &str) -> String {
    value.replace("####", "=").replace("....", ",")
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 256
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"_-*/@".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sw_entry_round_trip() {
        let entry = SwEntry::parse("2222222222222222-01").expect("should parse");
        assert_eq!(entry.span_id, SpanId([0x22; 8]));
        assert!(entry.sampled());
        assert_eq!(entry.to_string(), "2222222222222222-01");
    }

    #[test]
    fn sw_entry_unsampled() {
        let entry = SwEntry::parse("2222222222222222-00").expect("should parse");
        assert!(!entry.sampled());
    }

    #[test]
    fn sw_entry_rejects_malformed_values() {
        for bad in [
            "",
            "2222222222222222",
            "2222222222222222-1",
            "2222222222222222-001",
            "222222222222222G-01",
            "2222222222222222-0G",
            "2222222222222222_01",
            "AAAAAAAAAAAAAAAA-01", // uppercase hex is outside the grammar
        ] {
            assert_eq!(SwEntry::parse(bad), None, "should reject {bad:?}");
        }
    }

    #[test]
    fn parse_and_display_round_trip() {
        let ts = TraceState::parse("sw=2222222222222222-01,other=abc");
        assert_eq!(ts.get("sw"), Some("2222222222222222-01"));
        assert_eq!(ts.get("other"), Some("abc"));
        assert_eq!(ts.to_string(), "sw=2222222222222222-01,other=abc");
    }

    #[test]
    fn malformed_members_are_skipped() {
        let ts = TraceState::parse("bogus,, also bad ,ok=1");
        assert_eq!(ts.to_string(), "ok=1");
    }

    #[test]
    fn insert_moves_key_to_front() {
        let mut ts = TraceState::parse("a=1,sw=2222222222222222-00");
        ts.insert("sw", "3333333333333333-01");
        assert_eq!(ts.to_string(), "sw=3333333333333333-01,a=1");
    }

    #[test]
    fn entry_cap_is_enforced() {
        let header = (0..40)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join(",");
        let mut ts = TraceState::parse(&header);
        ts.insert("sw", "2222222222222222-01");
        assert_eq!(ts.get("sw"), Some("2222222222222222-01"));
        assert!(ts.to_string().split(',').count() <= 32);
    }

    #[test]
    fn length_cap_evicts_from_the_tail() {
        let long = "v".repeat(200);
        let mut ts = TraceState::parse(&format!("a={long},b={long}"));
        ts.insert("sw", "2222222222222222-01");
        assert!(ts.to_string().len() <= 256);
        assert_eq!(ts.get("sw"), Some("2222222222222222-01"));
    }

    #[test]
    fn others_except_skips_internal_keys() {
        let ts = TraceState::parse("sw=2222222222222222-01,congo=t61rcWkgMzE,rojo=00f067aa0ba902b7");
        assert_eq!(
            ts.others_except(&[VENDOR_KEY, OPTIONS_RESPONSE_KEY]),
            "congo=t61rcWkgMzE,rojo=00f067aa0ba902b7"
        );
    }

    #[test]
    fn options_response_escaping_round_trip() {
        let response = "auth=ok;trigger-trace=rate-exceeded,ignored=a";
        let escaped = escape_options_response(response);
        assert!(!escaped.contains('='));
        assert!(!escaped.contains(','));
        assert_eq!(unescape_options_response(&escaped), response);
    }
}
