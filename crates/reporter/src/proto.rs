// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Collector RPC protocol messages.
//!
//! Hand-maintained prost definitions for the collector service; kept in
//! sync with the collector's `.proto` by code review rather than build-time
//! generation.

#![allow(missing_docs)]
#![allow(unused_qualifications)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::enum_variant_names)]

use std::collections::HashMap;
use std::fmt;

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "collector.Collector";

/// Server verdict attached to every RPC response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    TryLater = 1,
    InvalidApiKey = 2,
    LimitExceeded = 3,
    Redirect = 4,
}

/// Container encoding of the opaque message payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EncodingType {
    Bson = 0,
    Protobuf = 1,
}

/// Host identity attached to uploads.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostId {
    #[prost(string, tag = "1")]
    pub hostname: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub pid: i32,
}

/// Upload request shared by PostEvents, PostMetrics and PostStatus.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageRequest {
    #[prost(string, tag = "1")]
    pub api_key: ::prost::alloc::string::String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub messages: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "EncodingType", tag = "3")]
    pub encoding: i32,
    #[prost(message, optional, tag = "4")]
    pub identity: ::core::option::Option<HostId>,
}

/// Response shared by the upload RPCs and Ping.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageResult {
    #[prost(enumeration = "ResultCode", tag = "1")]
    pub result: i32,
    #[prost(string, tag = "2")]
    pub arg: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub warning: ::prost::alloc::string::String,
}

/// GetSettings request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SettingsRequest {
    #[prost(string, tag = "1")]
    pub api_key: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub identity: ::core::option::Option<HostId>,
    #[prost(string, tag = "3")]
    pub client_version: ::prost::alloc::string::String,
}

/// One settings entry of a GetSettings response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteSetting {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    /// Comma-separated flag names.
    #[prost(string, tag = "2")]
    pub flags: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(int64, tag = "4")]
    pub value: i64,
    #[prost(string, tag = "5")]
    pub layer: ::prost::alloc::string::String,
    /// Byte-encoded argument map; numeric values are little-endian.
    #[prost(map = "string, bytes", tag = "6")]
    pub arguments: HashMap<::prost::alloc::string::String, ::prost::alloc::vec::Vec<u8>>,
    /// Lifetime in seconds.
    #[prost(int64, tag = "7")]
    pub ttl: i64,
}

/// GetSettings response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SettingsResult {
    #[prost(enumeration = "ResultCode", tag = "1")]
    pub result: i32,
    #[prost(string, tag = "2")]
    pub arg: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub settings: ::prost::alloc::vec::Vec<RemoteSetting>,
    #[prost(string, tag = "4")]
    pub warning: ::prost::alloc::string::String,
}

/// Keep-alive request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(string, tag = "1")]
    pub api_key: ::prost::alloc::string::String,
}

/// The collector's RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    /// Upload a batch of serialised span events.
    PostEvents,
    /// Upload metric/histogram reports.
    PostMetrics,
    /// Upload status events, including the init message.
    PostStatus,
    /// Fetch the current sampling settings.
    GetSettings,
    /// Keep-alive.
    Ping,
}

impl RpcMethod {
    /// The gRPC request path for this method.
    pub fn path(&self) -> &'static str {
        match self {
            RpcMethod::PostEvents => "/collector.Collector/postEvents",
            RpcMethod::PostMetrics => "/collector.Collector/postMetrics",
            RpcMethod::PostStatus => "/collector.Collector/postStatus",
            RpcMethod::GetSettings => "/collector.Collector/getSettings",
            RpcMethod::Ping => "/collector.Collector/ping",
        }
    }

    /// The method name within the service.
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::PostEvents => "postEvents",
            RpcMethod::PostMetrics => "postMetrics",
            RpcMethod::PostStatus => "postStatus",
            RpcMethod::GetSettings => "getSettings",
            RpcMethod::Ping => "ping",
        }
    }

    /// Whether transient errors are retried for this method.
    pub fn retry_on_error(&self) -> bool {
        !matches!(self, RpcMethod::Ping)
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn message_request_round_trips() {
        let request = MessageRequest {
            api_key: "key:service".into(),
            messages: vec![vec![1, 2, 3], vec![4]],
            encoding: EncodingType::Bson as i32,
            identity: Some(HostId {
                hostname: "h".into(),
                pid: 42,
            }),
        };
        let bytes = request.encode_to_vec();
        let decoded = MessageRequest::decode(&bytes[..]).expect("should decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn settings_result_round_trips_with_arguments() {
        let mut setting = RemoteSetting {
            r#type: 0,
            flags: "SAMPLE_START,SAMPLE_THROUGH_ALWAYS".into(),
            timestamp: 1_700_000_000,
            value: 1_000_000,
            layer: String::new(),
            arguments: HashMap::new(),
            ttl: 120,
        };
        let _ = setting
            .arguments
            .insert("BucketCapacity".into(), 8.0f64.to_le_bytes().to_vec());
        let result = SettingsResult {
            result: ResultCode::Ok as i32,
            arg: String::new(),
            settings: vec![setting],
            warning: String::new(),
        };

        let bytes = result.encode_to_vec();
        let decoded = SettingsResult::decode(&bytes[..]).expect("should decode");
        assert_eq!(decoded, result);
        assert_eq!(decoded.settings[0].arguments.len(), 1);
    }

    #[test]
    fn result_code_conversion() {
        assert_eq!(ResultCode::try_from(4).ok(), Some(ResultCode::Redirect));
        assert!(ResultCode::try_from(99).is_err());
    }

    #[test]
    fn only_ping_skips_retries() {
        assert!(RpcMethod::PostEvents.retry_on_error());
        assert!(RpcMethod::GetSettings.retry_on_error());
        assert!(!RpcMethod::Ping.retry_on_error());
    }
}
