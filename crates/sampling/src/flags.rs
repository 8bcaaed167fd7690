// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Settings flag set and sample-source provenance.

use apm_agent_config::TracingMode;
use bitflags::bitflags;

bitflags! {
    /// Behaviour flags carried by a sampling setting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SettingFlags: u16 {
        /// Local configuration may lower the remote value but not raise it.
        const OVERRIDE = 0x1;
        /// New traces may be started by dice roll.
        const SAMPLE_START = 0x2;
        /// Upstream decisions are continued by dice roll.
        const SAMPLE_THROUGH = 0x4;
        /// Upstream sampled decisions are continued unconditionally.
        const SAMPLE_THROUGH_ALWAYS = 0x8;
        /// Operator-requested trigger traces are honoured.
        const TRIGGER_TRACE = 0x10;
    }
}

impl SettingFlags {
    /// Parses the comma-separated flag list of a settings response.
    /// Unknown tokens are ignored rather than rejected.
    pub fn from_wire(s: &str) -> SettingFlags {
        let mut flags = SettingFlags::empty();
        for token in s.split(',') {
            match token.trim() {
                "OVERRIDE" => flags |= SettingFlags::OVERRIDE,
                "SAMPLE_START" => flags |= SettingFlags::SAMPLE_START,
                "SAMPLE_THROUGH" => flags |= SettingFlags::SAMPLE_THROUGH,
                "SAMPLE_THROUGH_ALWAYS" => flags |= SettingFlags::SAMPLE_THROUGH_ALWAYS,
                "TRIGGER_TRACE" => flags |= SettingFlags::TRIGGER_TRACE,
                _ => {}
            }
        }
        flags
    }

    /// The flags a locally configured tracing mode grants on its own.
    pub fn local_flags(mode: TracingMode) -> SettingFlags {
        match mode {
            TracingMode::Enabled => {
                SettingFlags::SAMPLE_START
                    | SettingFlags::SAMPLE_THROUGH_ALWAYS
                    | SettingFlags::TRIGGER_TRACE
            }
            TracingMode::Disabled => SettingFlags::empty(),
        }
    }

    /// The mask ANDed onto remote flags when the remote setting carries
    /// `OVERRIDE` and sampling is locally configured.
    pub fn local_mask(mode: TracingMode) -> SettingFlags {
        match mode {
            TracingMode::Enabled => SettingFlags::all(),
            TracingMode::Disabled => SettingFlags::OVERRIDE,
        }
    }
}

/// Where the effective sample rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// Continuation decisions carry no rate of their own.
    Unset,
    /// No setting was consulted.
    None,
    /// Local (file/environment) configuration.
    File,
    /// The remote default setting.
    Default,
    /// A layer-scoped remote setting.
    Layer,
}

impl SampleSource {
    /// Integer encoding used in span attributes.
    pub fn as_i32(&self) -> i32 {
        match self {
            SampleSource::Unset => -1,
            SampleSource::None => 0,
            SampleSource::File => 1,
            SampleSource::Default => 2,
            SampleSource::Layer => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_flags() {
        let flags = SettingFlags::from_wire("OVERRIDE,SAMPLE_START,TRIGGER_TRACE");
        assert!(flags.contains(SettingFlags::OVERRIDE));
        assert!(flags.contains(SettingFlags::SAMPLE_START));
        assert!(flags.contains(SettingFlags::TRIGGER_TRACE));
        assert!(!flags.contains(SettingFlags::SAMPLE_THROUGH));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let flags = SettingFlags::from_wire("SAMPLE_START,FROBNICATE");
        assert_eq!(flags, SettingFlags::SAMPLE_START);
    }

    #[test]
    fn disabled_mode_grants_nothing() {
        assert!(SettingFlags::local_flags(TracingMode::Disabled).is_empty());
    }

    #[test]
    fn disabled_mask_keeps_only_override() {
        let remote = SettingFlags::all();
        let masked = remote & SettingFlags::local_mask(TracingMode::Disabled);
        assert_eq!(masked, SettingFlags::OVERRIDE);
    }

    #[test]
    fn sample_source_encoding() {
        assert_eq!(SampleSource::Unset.as_i32(), -1);
        assert_eq!(SampleSource::File.as_i32(), 1);
        assert_eq!(SampleSource::Default.as_i32(), 2);
    }
}
