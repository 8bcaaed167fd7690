// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Transaction-name derivation.
//!
//! Every finished entry span is filed under a stable transaction name.
//! The name comes from the first non-empty source in a strict precedence
//! order and is always non-empty and at most 255 characters.

/// Maximum length of a derived transaction name.
pub const MAX_NAME_LEN: usize = 255;

/// Fallback when every source is empty.
pub const UNKNOWN_NAME: &str = "unknown";

/// Inputs to the derivation, collected by the span processor at span end.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameSources<'a> {
    /// Name attached to the trace's top entry-span record, if any.
    pub attached: Option<&'a str>,
    /// Operator-configured override from the environment.
    pub configured: Option<&'a str>,
    /// True when the process runs in a recognised FaaS environment;
    /// the configured override is only honoured there.
    pub in_faas: bool,
    /// The `faas.name` span attribute.
    pub faas_name: Option<&'a str>,
    /// The `http.route` span attribute.
    pub http_route: Option<&'a str>,
    /// The `url.path` span attribute, falling back to `http.target`.
    pub url_path: Option<&'a str>,
    /// The span name.
    pub span_name: &'a str,
}

/// Derives the transaction name for a finished entry span.
pub fn derive(sources: &NameSources<'_>) -> String {
    let picked = pick(sources);
    let trimmed = picked.trim();
    let name = if trimmed.is_empty() {
        UNKNOWN_NAME.to_owned()
    } else {
        trimmed.to_owned()
    };
    truncate(name)
}

fn pick(sources: &NameSources<'_>) -> String {
    if let Some(name) = non_empty(sources.attached) {
        return name.to_owned();
    }
    if sources.in_faas {
        if let Some(name) = non_empty(sources.configured) {
            return name.to_owned();
        }
    }
    if let Some(name) = non_empty(sources.faas_name) {
        return name.to_owned();
    }
    if let Some(route) = non_empty(sources.http_route) {
        return route.to_owned();
    }
    if let Some(path) = non_empty(sources.url_path) {
        let trimmed = trim_url_path(path);
        if !trimmed.trim().is_empty() {
            return trimmed;
        }
    }
    sources.span_name.to_owned()
}

fn non_empty<'a>(value: Option<&'a str>) -> Option<&'a str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Strips query and fragment, then keeps the first two path segments:
/// `/a/b/c?q=1` becomes `/a/b`.
fn trim_url_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let mut out = String::new();
    let mut segments = 0;
    for segment in path.split('/').skip(1) {
        if segments == 2 {
            break;
        }
        out.push('/');
        out.push_str(segment);
        segments += 1;
    }
    if out.is_empty() { path.to_owned() } else { out }
}

fn truncate(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        // Back up to the previous char boundary.
        let mut cut = MAX_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base<'a>() -> NameSources<'a> {
        NameSources {
            span_name: "GET",
            ..NameSources::default()
        }
    }

    #[test]
    fn attached_name_wins() {
        let sources = NameSources {
            attached: Some("checkout"),
            http_route: Some("/orders/{id}"),
            ..base()
        };
        assert_eq!(derive(&sources), "checkout");
    }

    #[test]
    fn configured_name_requires_faas() {
        let mut sources = NameSources {
            configured: Some("lambda-txn"),
            http_route: Some("/orders"),
            ..base()
        };
        assert_eq!(derive(&sources), "/orders");

        sources.in_faas = true;
        assert_eq!(derive(&sources), "lambda-txn");
    }

    #[test]
    fn route_beats_url_path() {
        let sources = NameSources {
            http_route: Some("/orders/{id}"),
            url_path: Some("/orders/42"),
            ..base()
        };
        assert_eq!(derive(&sources), "/orders/{id}");
    }

    #[test]
    fn url_path_is_trimmed_to_two_segments() {
        let sources = NameSources {
            url_path: Some("/a/b/c?q=1"),
            ..base()
        };
        assert_eq!(derive(&sources), "/a/b");
    }

    #[test]
    fn short_paths_survive_trimming() {
        let sources = NameSources {
            url_path: Some("/a"),
            ..base()
        };
        assert_eq!(derive(&sources), "/a");
    }

    #[test]
    fn span_name_is_the_last_resort() {
        assert_eq!(derive(&base()), "GET");
    }

    #[test]
    fn empty_everything_yields_unknown() {
        let sources = NameSources {
            span_name: "  ",
            ..NameSources::default()
        };
        assert_eq!(derive(&sources), UNKNOWN_NAME);
    }

    #[test]
    fn result_is_trimmed_and_capped() {
        let long = "x".repeat(400);
        let sources = NameSources {
            attached: Some(&long),
            ..base()
        };
        let name = derive(&sources);
        assert_eq!(name.len(), MAX_NAME_LEN);

        let padded = NameSources {
            attached: Some("  spaced  "),
            ..base()
        };
        assert_eq!(derive(&padded), "spaced");
    }

    #[test]
    fn faas_name_beats_route() {
        let sources = NameSources {
            faas_name: Some("my-function"),
            http_route: Some("/orders"),
            ..base()
        };
        assert_eq!(derive(&sources), "my-function");
    }
}
