// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive trace sampling for the APM agent core.
//!
//! This crate makes the per-span record/sample decision. The moving parts:
//!
//! - [`settings::SettingsStore`] holds the remote sampling settings with
//!   TTL expiry, merged against local configuration.
//! - [`bucket::TokenBucket`] rate-limits admissions and keeps the request
//!   counters that feed metric reports.
//! - [`sampler::Sampler`] runs the decision algorithm: continuation of
//!   upstream `sw` trace-state entries, trigger-trace requests, and the
//!   sample-rate dice roll.
//! - [`trigger`] parses `X-Trace-Options` and validates its HMAC
//!   signature.
//! - [`entry_spans::EntrySpanRegistry`] tracks the active inbound span per
//!   trace so span-end processing can attach transaction names.
//! - [`txn_name`] derives the stable transaction name a finished span is
//!   filed under.
//!
//! Decisions are synchronous and never perform I/O.

pub mod bucket;
pub mod entry_spans;
pub mod error;
pub mod flags;
pub mod headers;
pub mod ids;
pub mod sampler;
pub mod settings;
pub mod trace_state;
pub mod trigger;
pub mod txn_name;

pub use bucket::{BucketCounters, TokenBucket};
pub use entry_spans::EntrySpanRegistry;
pub use flags::{SampleSource, SettingFlags};
pub use ids::{SpanId, TraceId};
pub use sampler::{Decision, ParentContext, SampleRequest, SampleResult, Sampler};
pub use settings::{LocalSettings, Setting, SettingsStore, SettingsUpdate};
