// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-span sampling decision.
//!
//! The sampler runs synchronously on the thread starting a root span and
//! never performs I/O. It consults the settings store, the per-URL filters
//! and the setting's token buckets, honours upstream decisions carried in
//! the `sw` trace-state entry, and answers operator trigger-trace requests.
//! It never fails: every code path produces a decision, with a best-effort
//! response string when X-Trace-Options were supplied.

use crate::flags::{SampleSource, SettingFlags};
use crate::ids::{FLAG_SAMPLED, SpanId, TraceId};
use crate::settings::{BucketKind, Setting, SettingsStore};
use crate::trace_state::{
    OPTIONS_RESPONSE_KEY, SwEntry, TraceState, VENDOR_KEY, escape_options_response,
};
use crate::trigger::{TriggerMode, XTraceOptions, authenticate, compose_response};
use apm_agent_config::MAX_SAMPLE_RATE;
use apm_agent_config::filters::TransactionFilters;
use rand::RngExt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Span attribute: the `sw-keys` value from X-Trace-Options.
pub const ATTR_SW_KEYS: &str = "SWKeys";
/// Span attribute: set on spans admitted through a trigger trace.
pub const ATTR_TRIGGERED_TRACE: &str = "TriggeredTrace";
/// Span attribute: capacity of the bucket consulted for this decision.
pub const ATTR_BUCKET_CAPACITY: &str = "BucketCapacity";
/// Span attribute: refill rate of the bucket consulted for this decision.
pub const ATTR_BUCKET_RATE: &str = "BucketRate";
/// Span attribute: the effective sample rate.
pub const ATTR_SAMPLE_RATE: &str = "SampleRate";
/// Span attribute: provenance of the effective sample rate.
pub const ATTR_SAMPLE_SOURCE: &str = "SampleSource";
/// Span attribute: foreign vendor entries of the parent trace-state.
pub const ATTR_PARENT_TRACESTATE: &str = "sw.w3c.tracestate";

/// Trigger-trace response: admitted.
const TT_OK: &str = "ok";
/// Trigger-trace response: the bucket was empty.
const TT_RATE_EXCEEDED: &str = "rate-exceeded";
/// Trigger-trace response: tracing is off for this request.
const TT_TRACING_DISABLED: &str = "tracing-disabled";
/// Trigger-trace response: trigger traces are off for this request.
const TT_TRIGGER_DISABLED: &str = "trigger-tracing-disabled";
/// Trigger-trace response: requested on a continuation, not honoured.
const TT_IGNORED: &str = "ignored";
/// Trigger-trace response: options present without `trigger-trace`.
const TT_NOT_REQUESTED: &str = "not-requested";
/// Trigger-trace response: no usable sampling setting.
const TT_SETTINGS_UNAVAILABLE: &str = "settings-not-available";

/// The parent context of the span being started, if any.
#[derive(Debug, Clone)]
pub struct ParentContext {
    /// The parent's span id.
    pub span_id: SpanId,
    /// The parent's sampled bit.
    pub sampled: bool,
    /// True when the parent was imported from a remote context.
    pub remote: bool,
    /// The parent's trace-state.
    pub trace_state: TraceState,
}

/// Everything the sampler needs for one decision.
#[derive(Debug, Clone)]
pub struct SampleRequest<'a> {
    /// Parent context; absent for process-level roots.
    pub parent: Option<ParentContext>,
    /// The new trace id.
    pub trace_id: TraceId,
    /// The id of the span about to be started; written into the outgoing
    /// `sw` trace-state entry.
    pub span_id: SpanId,
    /// Raw `X-Trace-Options` header value, if the request carried one.
    pub xtrace_options: Option<&'a str>,
    /// Raw `X-Trace-Options-Signature` header value.
    pub xtrace_signature: Option<&'a str>,
    /// Request URL; empty when not HTTP-driven.
    pub url: &'a str,
}

/// A typed span attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// A string attribute.
    Str(String),
    /// An integer attribute.
    Int(i64),
    /// A boolean attribute.
    Bool(bool),
}

/// The outcome of one sampling decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Record and sample when true; record-only otherwise.
    pub trace: bool,
    /// Effective sample rate, or `-1` for continuations and trigger traces.
    pub rate: i64,
    /// Provenance of the rate.
    pub source: SampleSource,
    /// Whether tracing was enabled for this request at all.
    pub enabled: bool,
    /// Composed X-Trace-Options response, when options were supplied.
    pub xtrace_opts_rsp: Option<String>,
    /// Capacity of the consulted bucket, or `-1` when none applied.
    pub bucket_cap: f64,
    /// Refill rate of the consulted bucket, or `-1` when none applied.
    pub bucket_rate: f64,
    /// True when a dice roll decided the outcome.
    pub dice_rolled: bool,
}

impl Decision {
    fn drop_with(enabled: bool, response: Option<String>) -> Decision {
        Decision {
            trace: false,
            rate: -1,
            source: SampleSource::Unset,
            enabled,
            xtrace_opts_rsp: response,
            bucket_cap: -1.0,
            bucket_rate: -1.0,
            dice_rolled: false,
        }
    }
}

/// A decision plus the span attributes and trace-state it carries.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// The decision itself.
    pub decision: Decision,
    /// Attributes for the new span; empty unless sampled.
    pub attributes: Vec<(String, AttrValue)>,
    /// The outgoing trace-state for the new span context.
    pub trace_state: TraceState,
}

/// The remote-controlled adaptive sampler.
pub struct Sampler {
    settings: Arc<SettingsStore>,
    filters: TransactionFilters,
}

impl Sampler {
    /// Creates a sampler over the given settings store and URL filters.
    pub fn new(settings: Arc<SettingsStore>, filters: TransactionFilters) -> Sampler {
        Sampler { settings, filters }
    }

    /// Decides whether to record and sample a new span.
    pub fn should_sample(&self, request: &SampleRequest<'_>) -> SampleResult {
        // A local parent already decided for this trace; propagate its
        // sampled bit verbatim and leave its trace-state untouched.
        if let Some(parent) = request.parent.as_ref().filter(|p| !p.remote) {
            return SampleResult {
                decision: Decision {
                    trace: parent.sampled,
                    rate: -1,
                    source: SampleSource::Unset,
                    enabled: true,
                    xtrace_opts_rsp: None,
                    bucket_cap: -1.0,
                    bucket_rate: -1.0,
                    dice_rolled: false,
                },
                attributes: Vec::new(),
                trace_state: parent.trace_state.clone(),
            };
        }

        let options = request.xtrace_options.map(XTraceOptions::parse);
        let continuation = request
            .parent
            .as_ref()
            .and_then(|p| p.trace_state.get(VENDOR_KEY))
            .and_then(SwEntry::parse);

        let Some(setting) = self.settings.get() else {
            let response = options
                .as_ref()
                .map(|o| compose_response(None, TT_SETTINGS_UNAVAILABLE, &o.ignored));
            let decision = Decision::drop_with(false, response);
            return self.finish(request, decision);
        };

        let auth = match (request.xtrace_options, request.xtrace_signature) {
            (Some(raw), Some(signature)) => Some(authenticate(
                raw,
                signature,
                &setting.trigger_token,
                options.as_ref().and_then(|o| o.timestamp),
                unix_now(),
            )),
            _ => None,
        };
        let mode = options
            .as_ref()
            .map(|o| TriggerMode::derive(o, auth))
            .unwrap_or(TriggerMode::NotPresent);

        // Per-URL filters replace the setting's flags for this decision.
        // The OVERRIDE bit is kept: the filter changes what runs, not how
        // local and remote values merge.
        let (flags, source) = match self.filters.mode_for(request.url) {
            Some(filter_mode) => (
                SettingFlags::local_flags(filter_mode) | (setting.flags & SettingFlags::OVERRIDE),
                SampleSource::File,
            ),
            None => (setting.flags, setting.source),
        };
        let enabled = flags.intersects(
            SettingFlags::SAMPLE_START
                | SettingFlags::SAMPLE_THROUGH
                | SettingFlags::SAMPLE_THROUGH_ALWAYS,
        );

        let bucket_kind = match mode {
            TriggerMode::Relaxed => BucketKind::TriggerRelaxed,
            TriggerMode::Strict => BucketKind::TriggerStrict,
            _ => BucketKind::Default,
        };
        let bucket = setting.bucket(bucket_kind);
        let (bucket_rate, bucket_cap) = bucket.rate_cap();

        // Operator-requested trigger trace on a fresh request.
        if mode.requested() && continuation.is_none() {
            let trigger_allowed = flags.contains(SettingFlags::TRIGGER_TRACE);
            let intended = mode != TriggerMode::Invalid && trigger_allowed;
            let admitted = bucket.count(intended, false, true);
            if admitted {
                bucket.count_triggered();
            }

            let tt_response = if mode == TriggerMode::Invalid {
                ""
            } else if !enabled {
                TT_TRACING_DISABLED
            } else if !trigger_allowed {
                TT_TRIGGER_DISABLED
            } else if admitted {
                TT_OK
            } else {
                TT_RATE_EXCEEDED
            };
            let response = options
                .as_ref()
                .map(|o| compose_response(auth, tt_response, &o.ignored));

            let decision = Decision {
                trace: admitted,
                rate: -1,
                source: SampleSource::Unset,
                enabled,
                xtrace_opts_rsp: response,
                bucket_cap,
                bucket_rate,
                dice_rolled: false,
            };
            let mut result = self.finish(request, decision);
            if admitted {
                result
                    .attributes
                    .push((ATTR_TRIGGERED_TRACE.to_owned(), AttrValue::Bool(true)));
                self.push_common_attributes(&mut result, request, options.as_ref());
            }
            return result;
        }

        let tt_response = if mode.requested() {
            // Trigger trace on a continuation is acknowledged but does not
            // influence the upstream decision.
            TT_IGNORED
        } else {
            TT_NOT_REQUESTED
        };
        let response = options
            .as_ref()
            .map(|o| compose_response(auth, tt_response, &o.ignored));
        if mode == TriggerMode::Invalid {
            let decision = Decision::drop_with(enabled, response);
            return self.finish(request, decision);
        }

        let decision = match continuation {
            Some(sw) => self.decide_continuation(&setting, flags, source, sw, response, enabled),
            None => self.decide_dice(
                &setting,
                flags,
                source,
                response,
                enabled,
                bucket_cap,
                bucket_rate,
                false,
            ),
        };

        let sampled = decision.trace;
        let mut result = self.finish(request, decision);
        if sampled {
            self.push_common_attributes(&mut result, request, options.as_ref());
        }
        result
    }

    /// Continuation of an upstream decision carried by a well-formed `sw`
    /// entry.
    fn decide_continuation(
        &self,
        setting: &Setting,
        flags: SettingFlags,
        source: SampleSource,
        sw: SwEntry,
        response: Option<String>,
        enabled: bool,
    ) -> Decision {
        let bucket = setting.bucket(BucketKind::Default);
        if sw.sampled() && flags.contains(SettingFlags::SAMPLE_THROUGH_ALWAYS) {
            let admitted = bucket.count(true, true, false);
            Decision {
                trace: admitted,
                rate: -1,
                source: SampleSource::Unset,
                enabled,
                xtrace_opts_rsp: response,
                bucket_cap: -1.0,
                bucket_rate: -1.0,
                dice_rolled: false,
            }
        } else if flags.contains(SettingFlags::SAMPLE_THROUGH) {
            let (bucket_rate, bucket_cap) = bucket.rate_cap();
            self.decide_dice(
                setting,
                flags,
                source,
                response,
                enabled,
                bucket_cap,
                bucket_rate,
                true,
            )
        } else {
            let _ = bucket.count(false, true, false);
            Decision::drop_with(enabled, response)
        }
    }

    /// Fresh dice-roll decision, also reused for SAMPLE_THROUGH
    /// continuations (which skip the rate limiter).
    #[allow(clippy::too_many_arguments)]
    fn decide_dice(
        &self,
        setting: &Setting,
        flags: SettingFlags,
        source: SampleSource,
        response: Option<String>,
        enabled: bool,
        bucket_cap: f64,
        bucket_rate: f64,
        has_parent: bool,
    ) -> Decision {
        let bucket = setting.bucket(BucketKind::Default);
        let start_allowed = if has_parent {
            // SAMPLE_THROUGH was already checked by the caller.
            true
        } else {
            flags.contains(SettingFlags::SAMPLE_START)
        };

        if !start_allowed {
            let _ = bucket.count(false, has_parent, false);
            return Decision {
                trace: false,
                rate: i64::from(setting.value),
                source,
                enabled,
                xtrace_opts_rsp: response,
                bucket_cap,
                bucket_rate,
                dice_rolled: false,
            };
        }

        let rolled = roll_admits(setting.value, rand::rng().random_range(1..=MAX_SAMPLE_RATE));
        let rate_limit = rolled && !has_parent;
        let admitted = bucket.count(rolled, has_parent, rate_limit);
        Decision {
            trace: admitted,
            rate: i64::from(setting.value),
            source,
            enabled,
            xtrace_opts_rsp: response,
            bucket_cap,
            bucket_rate,
            dice_rolled: true,
        }
    }

    /// Builds the outgoing trace-state and wraps the decision.
    fn finish(&self, request: &SampleRequest<'_>, decision: Decision) -> SampleResult {
        let mut trace_state = request
            .parent
            .as_ref()
            .map(|p| p.trace_state.clone())
            .unwrap_or_default();

        let flags = if decision.trace { FLAG_SAMPLED } else { 0 };
        let sw = SwEntry {
            span_id: request.span_id,
            flags,
        };
        trace_state.insert(VENDOR_KEY, &sw.to_string());

        if let Some(response) = decision.xtrace_opts_rsp.as_deref() {
            trace_state.insert(OPTIONS_RESPONSE_KEY, &escape_options_response(response));
        }

        SampleResult {
            decision,
            attributes: Vec::new(),
            trace_state,
        }
    }

    /// Attributes shared by every sampled decision.
    fn push_common_attributes(
        &self,
        result: &mut SampleResult,
        request: &SampleRequest<'_>,
        options: Option<&XTraceOptions>,
    ) {
        if let Some(options) = options {
            if let Some(sw_keys) = options.sw_keys.as_deref() {
                result
                    .attributes
                    .push((ATTR_SW_KEYS.to_owned(), AttrValue::Str(sw_keys.to_owned())));
            }
            for (key, value) in &options.custom {
                result
                    .attributes
                    .push((key.clone(), AttrValue::Str(value.clone())));
            }
        }

        let decision = &result.decision;
        result.attributes.push((
            ATTR_BUCKET_CAPACITY.to_owned(),
            AttrValue::Str(format_rate(decision.bucket_cap)),
        ));
        result.attributes.push((
            ATTR_BUCKET_RATE.to_owned(),
            AttrValue::Str(format_rate(decision.bucket_rate)),
        ));
        result
            .attributes
            .push((ATTR_SAMPLE_RATE.to_owned(), AttrValue::Int(decision.rate)));
        result.attributes.push((
            ATTR_SAMPLE_SOURCE.to_owned(),
            AttrValue::Int(i64::from(decision.source.as_i32())),
        ));

        if let Some(parent) = request.parent.as_ref() {
            let foreign = parent
                .trace_state
                .others_except(&[VENDOR_KEY, OPTIONS_RESPONSE_KEY]);
            if !foreign.is_empty() {
                result
                    .attributes
                    .push((ATTR_PARENT_TRACESTATE.to_owned(), AttrValue::Str(foreign)));
            }
        }
    }
}

/// Pure dice predicate: a roll in `[1, 1_000_000]` admits when it does not
/// exceed the rate; the maximum rate always admits.
fn roll_admits(rate: u32, roll: u32) -> bool {
    rate == MAX_SAMPLE_RATE || roll <= rate
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Formats bucket values the way the wire expects: integral values lose
/// the trailing `.0`.
fn format_rate(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{
        ARG_BUCKET_CAPACITY, ARG_BUCKET_RATE, ARG_SIGNATURE_KEY, ARG_TRIGGER_RELAXED_CAPACITY,
        ARG_TRIGGER_RELAXED_RATE, ARG_TRIGGER_STRICT_CAPACITY, ARG_TRIGGER_STRICT_RATE,
        LocalSettings, SettingType, SettingsUpdate,
    };
    use crate::trigger::sign;
    use apm_agent_config::TracingMode;
    use apm_agent_config::filters::{FilterMatcher, TransactionFilter};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;

    fn local() -> LocalSettings {
        LocalSettings {
            tracing_mode: TracingMode::Enabled,
            sample_rate: None,
            trigger_trace: true,
            bucket_capacity: None,
            bucket_rate: None,
        }
    }

    fn full_flags() -> SettingFlags {
        SettingFlags::SAMPLE_START
            | SettingFlags::SAMPLE_THROUGH_ALWAYS
            | SettingFlags::TRIGGER_TRACE
    }

    struct Args(HashMap<String, Vec<u8>>);

    impl Args {
        fn new() -> Args {
            Args(HashMap::new())
        }

        fn f64(mut self, key: &str, value: f64) -> Args {
            let _ = self.0.insert(key.to_owned(), value.to_le_bytes().to_vec());
            self
        }

        fn bytes(mut self, key: &str, value: &[u8]) -> Args {
            let _ = self.0.insert(key.to_owned(), value.to_vec());
            self
        }
    }

    fn store_with(flags: SettingFlags, value: i64, args: Args) -> Arc<SettingsStore> {
        let store = Arc::new(SettingsStore::new(local()));
        store.update(SettingsUpdate {
            setting_type: SettingType::Default,
            layer: String::new(),
            flags,
            value,
            ttl: Duration::from_secs(120),
            arguments: args.0,
        });
        store
    }

    fn sampler(store: Arc<SettingsStore>) -> Sampler {
        Sampler::new(store, TransactionFilters::default())
    }

    fn root_request<'a>() -> SampleRequest<'a> {
        SampleRequest {
            parent: None,
            trace_id: TraceId([0x11; 16]),
            span_id: SpanId([0x33; 8]),
            xtrace_options: None,
            xtrace_signature: None,
            url: "",
        }
    }

    fn remote_parent(sw: &str, extra: &str) -> ParentContext {
        let header = if extra.is_empty() {
            format!("sw={sw}")
        } else {
            format!("sw={sw},{extra}")
        };
        ParentContext {
            span_id: SpanId([0x22; 8]),
            sampled: true,
            remote: true,
            trace_state: TraceState::parse(&header),
        }
    }

    fn attr<'a>(result: &'a SampleResult, key: &str) -> Option<&'a AttrValue> {
        result
            .attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    #[test]
    fn fresh_root_is_sampled_with_attributes() {
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new().f64(ARG_BUCKET_CAPACITY, 1.0).f64(ARG_BUCKET_RATE, 1.0),
        );
        let result = sampler(store).should_sample(&root_request());

        assert!(result.decision.trace);
        assert!(result.decision.dice_rolled);
        assert_eq!(result.decision.rate, 1_000_000);
        assert_eq!(result.decision.source, SampleSource::Default);
        assert_eq!(attr(&result, ATTR_SAMPLE_RATE), Some(&AttrValue::Int(1_000_000)));
        assert_eq!(attr(&result, ATTR_SAMPLE_SOURCE), Some(&AttrValue::Int(2)));
        assert_eq!(
            attr(&result, ATTR_BUCKET_CAPACITY),
            Some(&AttrValue::Str("1".into()))
        );
        assert_eq!(
            attr(&result, ATTR_BUCKET_RATE),
            Some(&AttrValue::Str("1".into()))
        );
        assert_eq!(
            result.trace_state.get(VENDOR_KEY),
            Some("3333333333333333-01")
        );
    }

    #[test]
    fn rate_zero_never_samples() {
        let store = store_with(
            full_flags(),
            0,
            Args::new().f64(ARG_BUCKET_CAPACITY, 10.0).f64(ARG_BUCKET_RATE, 10.0),
        );
        let sampler = sampler(store);
        for _ in 0..100 {
            let result = sampler.should_sample(&root_request());
            assert!(!result.decision.trace);
            assert!(result.decision.dice_rolled);
        }
    }

    #[test]
    fn roll_boundaries() {
        assert!(!roll_admits(0, 1));
        assert!(roll_admits(1_000_000, 1_000_000));
        assert!(roll_admits(500_000, 500_000));
        assert!(!roll_admits(500_000, 500_001));
    }

    #[test]
    fn sampled_continuation_is_admitted_with_sentinels() {
        let store = store_with(full_flags(), 0, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-01", ""));
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert!(!result.decision.dice_rolled);
        assert_eq!(result.decision.rate, -1);
        assert_eq!(result.decision.source, SampleSource::Unset);
        assert_eq!(
            attr(&result, ATTR_BUCKET_CAPACITY),
            Some(&AttrValue::Str("-1".into()))
        );
        assert_eq!(
            attr(&result, ATTR_BUCKET_RATE),
            Some(&AttrValue::Str("-1".into()))
        );
        assert_eq!(attr(&result, ATTR_SAMPLE_RATE), Some(&AttrValue::Int(-1)));
    }

    #[test]
    fn unsampled_continuation_is_dropped() {
        let store = store_with(full_flags(), 1_000_000, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-00", ""));
        let result = sampler(store).should_sample(&request);

        assert!(!result.decision.trace);
        assert!(!result.decision.dice_rolled);
        // The outgoing sw entry reflects the local record-only decision.
        assert_eq!(
            result.trace_state.get(VENDOR_KEY),
            Some("3333333333333333-00")
        );
    }

    #[test]
    fn malformed_sw_entry_falls_back_to_dice() {
        let store = store_with(full_flags(), 1_000_000, Args::new().f64(ARG_BUCKET_CAPACITY, 1.0));
        let mut request = root_request();
        request.parent = Some(remote_parent("not-a-valid-entry", ""));
        let result = sampler(store).should_sample(&request);
        assert!(result.decision.dice_rolled);
    }

    #[test]
    fn local_parent_is_propagated_verbatim() {
        let store = store_with(full_flags(), 0, Args::new());
        let mut request = root_request();
        request.parent = Some(ParentContext {
            span_id: SpanId([0x22; 8]),
            sampled: true,
            remote: false,
            trace_state: TraceState::parse("sw=2222222222222222-01"),
        });
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert!(!result.decision.dice_rolled);
        assert!(result.attributes.is_empty());
        // Trace-state is left untouched for local children.
        assert_eq!(
            result.trace_state.get(VENDOR_KEY),
            Some("2222222222222222-01")
        );
    }

    #[test]
    fn missing_settings_drop_with_response() {
        let store = Arc::new(SettingsStore::new(local()));
        let mut request = root_request();
        request.xtrace_options = Some("trigger-trace");
        let result = sampler(store).should_sample(&request);

        assert!(!result.decision.trace);
        assert!(!result.decision.enabled);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=settings-not-available")
        );
    }

    #[test]
    fn trigger_trace_without_signature_is_rate_limited_by_the_strict_bucket() {
        // Strict bucket has no tokens: the request is refused.
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new()
                .f64(ARG_TRIGGER_STRICT_CAPACITY, 0.0)
                .f64(ARG_TRIGGER_STRICT_RATE, 0.0),
        );
        let mut request = root_request();
        request.xtrace_options = Some("trigger-trace");
        let result = sampler(store).should_sample(&request);

        assert!(!result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=rate-exceeded")
        );
    }

    #[test]
    fn trigger_trace_with_tokens_is_admitted() {
        let store = store_with(
            full_flags(),
            0, // dice would never sample; trigger path must.
            Args::new()
                .f64(ARG_TRIGGER_STRICT_CAPACITY, 1.0)
                .f64(ARG_TRIGGER_STRICT_RATE, 1.0),
        );
        let mut request = root_request();
        request.xtrace_options = Some("trigger-trace;sw-keys=lo:se;custom-one=two");
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert_eq!(result.decision.rate, -1);
        assert_eq!(result.decision.source, SampleSource::Unset);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=ok")
        );
        assert_eq!(attr(&result, ATTR_TRIGGERED_TRACE), Some(&AttrValue::Bool(true)));
        assert_eq!(
            attr(&result, ATTR_SW_KEYS),
            Some(&AttrValue::Str("lo:se".into()))
        );
        assert_eq!(
            attr(&result, "custom-one"),
            Some(&AttrValue::Str("two".into()))
        );
    }

    #[test]
    fn bad_timestamp_signature_refuses_the_request() {
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new().bytes(ARG_SIGNATURE_KEY, b"secret"),
        );
        let options = "trigger-trace;ts=0";
        let signature = sign(options, b"secret").expect("should sign");
        let mut request = root_request();
        request.xtrace_options = Some(options);
        request.xtrace_signature = Some(&signature);
        let result = sampler(store).should_sample(&request);

        assert!(!result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("auth=bad-timestamp")
        );
    }

    #[test]
    fn valid_signature_uses_the_relaxed_bucket() {
        let now = unix_now();
        let options = format!("trigger-trace;ts={now}");
        let signature = sign(&options, b"secret").expect("should sign");

        // Only the relaxed bucket has tokens.
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new()
                .bytes(ARG_SIGNATURE_KEY, b"secret")
                .f64(ARG_TRIGGER_RELAXED_CAPACITY, 1.0)
                .f64(ARG_TRIGGER_RELAXED_RATE, 1.0)
                .f64(ARG_TRIGGER_STRICT_CAPACITY, 0.0),
        );
        let mut request = root_request();
        request.xtrace_options = Some(&options);
        request.xtrace_signature = Some(&signature);
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("auth=ok;trigger-trace=ok")
        );
    }

    #[test]
    fn trigger_trace_on_continuation_is_ignored() {
        let store = store_with(full_flags(), 1_000_000, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-01", ""));
        request.xtrace_options = Some("trigger-trace");
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=ignored")
        );
    }

    #[test]
    fn options_without_trigger_trace_answer_not_requested() {
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new().f64(ARG_BUCKET_CAPACITY, 1.0).f64(ARG_BUCKET_RATE, 1.0),
        );
        let mut request = root_request();
        request.xtrace_options = Some("sw-keys=check;what-is-this");
        let result = sampler(store).should_sample(&request);

        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=not-requested;ignored=what-is-this")
        );
    }

    #[test]
    fn trigger_disabled_flag_answers_trigger_tracing_disabled() {
        let flags = SettingFlags::SAMPLE_START | SettingFlags::SAMPLE_THROUGH_ALWAYS;
        let store = store_with(flags, 1_000_000, Args::new());
        let mut request = root_request();
        request.xtrace_options = Some("trigger-trace");
        let result = sampler(store).should_sample(&request);

        assert!(!result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=trigger-tracing-disabled")
        );
    }

    #[test]
    fn url_filter_disables_tracing_for_matched_urls() {
        let store = store_with(
            full_flags(),
            1_000_000,
            Args::new().f64(ARG_BUCKET_CAPACITY, 10.0).f64(ARG_BUCKET_RATE, 10.0),
        );
        let filters = TransactionFilters::compile(&[TransactionFilter {
            matcher: FilterMatcher::Regex("^/health".into()),
            mode: TracingMode::Disabled,
        }])
        .expect("filters should compile");
        let sampler = Sampler::new(store, filters);

        let mut request = root_request();
        request.url = "/healthz";
        let result = sampler.should_sample(&request);
        assert!(!result.decision.trace);
        assert!(!result.decision.enabled);

        request.url = "/orders";
        let result = sampler.should_sample(&request);
        assert!(result.decision.trace);
    }

    #[test]
    fn url_filter_keeps_override_flag() {
        let store = store_with(
            full_flags() | SettingFlags::OVERRIDE,
            1_000_000,
            Args::new(),
        );
        let filters = TransactionFilters::compile(&[TransactionFilter {
            matcher: FilterMatcher::Regex(".*".into()),
            mode: TracingMode::Disabled,
        }])
        .expect("filters should compile");
        let sampler = Sampler::new(Arc::clone(&store), filters);

        let mut request = root_request();
        request.url = "/anything";
        request.xtrace_options = Some("trigger-trace");
        let result = sampler.should_sample(&request);

        // The filter turns tracing off but leaves the merge semantics
        // (OVERRIDE) alone, so trigger-trace reports tracing-disabled.
        assert!(!result.decision.trace);
        assert_eq!(
            result.decision.xtrace_opts_rsp.as_deref(),
            Some("trigger-trace=tracing-disabled")
        );
    }

    #[test]
    fn foreign_tracestate_is_captured_on_sampled_spans() {
        let store = store_with(full_flags(), 1_000_000, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-01", "congo=t61rcWkgMzE"));
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert_eq!(
            attr(&result, ATTR_PARENT_TRACESTATE),
            Some(&AttrValue::Str("congo=t61rcWkgMzE".into()))
        );
        // The outgoing trace-state keeps the foreign entry and refreshes sw.
        assert_eq!(result.trace_state.get("congo"), Some("t61rcWkgMzE"));
        assert_eq!(
            result.trace_state.get(VENDOR_KEY),
            Some("3333333333333333-01")
        );
    }

    #[test]
    fn options_response_is_mirrored_into_the_trace_state() {
        let store = store_with(full_flags(), 1_000_000, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-01", ""));
        request.xtrace_options = Some("trigger-trace");
        let result = sampler(store).should_sample(&request);

        assert_eq!(
            result.trace_state.get(OPTIONS_RESPONSE_KEY),
            Some("trigger-trace####ignored")
        );
    }

    #[test]
    fn sample_through_dices_continuations_without_rate_limit() {
        // SAMPLE_THROUGH only, full rate, empty bucket: the continuation
        // must still be admitted because no token is spent.
        let flags = SettingFlags::SAMPLE_THROUGH | SettingFlags::TRIGGER_TRACE;
        let store = store_with(flags, 1_000_000, Args::new());
        let mut request = root_request();
        request.parent = Some(remote_parent("2222222222222222-01", ""));
        let result = sampler(store).should_sample(&request);

        assert!(result.decision.trace);
        assert!(result.decision.dice_rolled);
        assert_eq!(result.decision.rate, 1_000_000);
    }

    #[test]
    fn no_sample_start_blocks_fresh_roots() {
        let flags = SettingFlags::SAMPLE_THROUGH_ALWAYS | SettingFlags::TRIGGER_TRACE;
        let store = store_with(flags, 1_000_000, Args::new());
        let result = sampler(store).should_sample(&root_request());

        assert!(!result.decision.trace);
        assert!(!result.decision.dice_rolled);
    }
}
