// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-URL transaction filters.
//!
//! Filters let operators turn tracing off (or back on) for individual
//! request URLs before the sampler consults the remote settings. Each entry
//! matches either a regular expression over the full URL or a set of file
//! extensions; the first matching entry wins.

use crate::TracingMode;
use crate::error::Error;
use regex::Regex;
use serde::Deserialize;

/// How a single filter entry matches request URLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMatcher {
    /// Matches when the regular expression matches anywhere in the URL.
    Regex(String),
    /// Matches when the URL path ends in one of these extensions
    /// (compared without the leading dot).
    Extensions(Vec<String>),
}

/// A single URL filter entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionFilter {
    /// URL matcher for this entry.
    #[serde(flatten)]
    pub matcher: FilterMatcher,
    /// Tracing mode applied when the matcher hits.
    pub mode: TracingMode,
}

/// An ordered list of URL filters; first match wins.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilters {
    entries: Vec<CompiledFilter>,
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    matcher: CompiledMatcher,
    mode: TracingMode,
}

#[derive(Debug, Clone)]
enum CompiledMatcher {
    Regex(Regex),
    Extensions(Vec<String>),
}

impl TransactionFilters {
    /// Compiles filter entries, rejecting invalid regular expressions.
    pub fn compile(entries: &[TransactionFilter]) -> Result<Self, Error> {
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            let matcher = match &entry.matcher {
                FilterMatcher::Regex(pattern) => {
                    let re = Regex::new(pattern).map_err(|e| Error::InvalidFilter {
                        reason: format!("bad regex {pattern:?}: {e}"),
                    })?;
                    CompiledMatcher::Regex(re)
                }
                FilterMatcher::Extensions(exts) => {
                    if exts.is_empty() {
                        return Err(Error::InvalidFilter {
                            reason: "extensions list is empty".into(),
                        });
                    }
                    CompiledMatcher::Extensions(
                        exts.iter()
                            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                            .collect(),
                    )
                }
            };
            compiled.push(CompiledFilter {
                matcher,
                mode: entry.mode,
            });
        }
        Ok(TransactionFilters { entries: compiled })
    }

    /// Returns the tracing mode of the first matching filter, if any.
    pub fn mode_for(&self, url: &str) -> Option<TracingMode> {
        if url.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|f| f.matcher.matches(url))
            .map(|f| f.mode)
    }

    /// True when no filters are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CompiledMatcher {
    fn matches(&self, url: &str) -> bool {
        match self {
            CompiledMatcher::Regex(re) => re.is_match(url),
            CompiledMatcher::Extensions(exts) => {
                // Strip query and fragment before looking at the extension.
                let path = url.split(['?', '#']).next().unwrap_or(url);
                match path.rsplit_once('.') {
                    Some((_, ext)) => exts.iter().any(|e| e.eq_ignore_ascii_case(ext)),
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(entries: Vec<TransactionFilter>) -> TransactionFilters {
        TransactionFilters::compile(&entries).expect("filters should compile")
    }

    #[test]
    fn regex_filter_matches() {
        let f = filters(vec![TransactionFilter {
            matcher: FilterMatcher::Regex("^/health".into()),
            mode: TracingMode::Disabled,
        }]);
        assert_eq!(f.mode_for("/healthz"), Some(TracingMode::Disabled));
        assert_eq!(f.mode_for("/orders"), None);
    }

    #[test]
    fn extension_filter_ignores_query() {
        let f = filters(vec![TransactionFilter {
            matcher: FilterMatcher::Extensions(vec!["png".into(), ".css".into()]),
            mode: TracingMode::Disabled,
        }]);
        assert_eq!(f.mode_for("/static/app.css?v=3"), Some(TracingMode::Disabled));
        assert_eq!(f.mode_for("/static/app.js"), None);
    }

    #[test]
    fn first_match_wins() {
        let f = filters(vec![
            TransactionFilter {
                matcher: FilterMatcher::Regex("/admin/health".into()),
                mode: TracingMode::Enabled,
            },
            TransactionFilter {
                matcher: FilterMatcher::Regex("/admin".into()),
                mode: TracingMode::Disabled,
            },
        ]);
        assert_eq!(f.mode_for("/admin/health"), Some(TracingMode::Enabled));
        assert_eq!(f.mode_for("/admin/users"), Some(TracingMode::Disabled));
    }

    #[test]
    fn empty_url_never_matches() {
        let f = filters(vec![TransactionFilter {
            matcher: FilterMatcher::Regex(".*".into()),
            mode: TracingMode::Disabled,
        }]);
        assert_eq!(f.mode_for(""), None);
    }

    #[test]
    fn bad_regex_is_rejected() {
        let result = TransactionFilters::compile(&[TransactionFilter {
            matcher: FilterMatcher::Regex("(".into()),
            mode: TracingMode::Disabled,
        }]);
        assert!(result.is_err());
    }
}
