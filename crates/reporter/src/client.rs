// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! gRPC client for the collector service.
//!
//! A thin unary client over [`tonic::client::Grpc`] so the dispatch
//! channel can drive every method through one code path. The endpoint
//! builder owns TLS setup: collector connections are always TLS, trusting
//! either the system roots or an operator-supplied certificate bundle.

use crate::error::Error;
use crate::proto::{
    MessageRequest, MessageResult, PingRequest, RpcMethod, SERVICE_NAME, SettingsRequest,
    SettingsResult,
};
use http::uri::PathAndQuery;
use prost::Message;
use std::path::PathBuf;
use std::time::Duration;
use tonic::body::Body;
use tonic::client::{Grpc, GrpcService};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{GrpcMethod, Status};

/// Timeout for establishing the TCP/TLS connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attempt timeout applied to every RPC.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How the collector endpoint is constructed.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Collector address as `host:port`.
    pub address: String,
    /// Certificate bundle to trust instead of the system roots.
    pub trusted_cert_path: Option<PathBuf>,
}

impl EndpointConfig {
    /// Builds a lazily-connecting TLS endpoint for the current address.
    pub fn build(&self) -> Result<Endpoint, Error> {
        let uri = format!("https://{}", self.address);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::Endpoint {
                details: e.to_string(),
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tcp_nodelay(true);

        let tls = match &self.trusted_cert_path {
            Some(path) => {
                let pem = std::fs::read(path)?;
                ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
            }
            None => ClientTlsConfig::new().with_native_roots(),
        };
        endpoint.tls_config(tls).map_err(|e| Error::Endpoint {
            details: e.to_string(),
        })
    }
}

/// Unary client for the collector service.
pub struct CollectorClient<T> {
    inner: Grpc<T>,
}

impl CollectorClient<Channel> {
    /// Wraps an established (or lazily connecting) channel.
    pub fn new(channel: Channel) -> CollectorClient<Channel> {
        CollectorClient {
            inner: Grpc::new(channel),
        }
    }
}

impl<T> CollectorClient<T>
where
    T: GrpcService<Body>,
    T::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T::ResponseBody: Send + 'static,
    <T::ResponseBody as tonic::transport::Body>::Error:
        Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    /// Uploads a batch of serialised span events.
    pub async fn post_events(&mut self, request: MessageRequest) -> Result<MessageResult, Status> {
        self.unary(RpcMethod::PostEvents, request).await
    }

    /// Uploads metric reports.
    pub async fn post_metrics(&mut self, request: MessageRequest) -> Result<MessageResult, Status> {
        self.unary(RpcMethod::PostMetrics, request).await
    }

    /// Uploads status events.
    pub async fn post_status(&mut self, request: MessageRequest) -> Result<MessageResult, Status> {
        self.unary(RpcMethod::PostStatus, request).await
    }

    /// Fetches the current sampling settings.
    pub async fn get_settings(
        &mut self,
        request: SettingsRequest,
    ) -> Result<SettingsResult, Status> {
        self.unary(RpcMethod::GetSettings, request).await
    }

    /// Keep-alive.
    pub async fn ping(&mut self, request: PingRequest) -> Result<MessageResult, Status> {
        self.unary(RpcMethod::Ping, request).await
    }

    async fn unary<Req, Resp>(&mut self, method: RpcMethod, request: Req) -> Result<Resp, Status>
    where
        Req: Message + Send + 'static,
        Resp: Message + Default + Send + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {}", e.into())))?;

        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        let path = PathAndQuery::from_static(method.path());
        let mut request = tonic::Request::new(request);
        let _ = request
            .extensions_mut()
            .insert(GrpcMethod::new(SERVICE_NAME, method.name()));

        self.inner
            .unary(request, path, codec)
            .await
            .map(tonic::Response::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_an_endpoint_from_host_and_port() {
        let config = EndpointConfig {
            address: "collector.example.com:443".into(),
            trusted_cert_path: None,
        };
        let endpoint = config.build().expect("endpoint should build");
        assert_eq!(endpoint.uri().host(), Some("collector.example.com"));
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn rejects_unparseable_addresses() {
        let config = EndpointConfig {
            address: "not a uri".into(),
            trusted_cert_path: None,
        };
        assert!(matches!(config.build(), Err(Error::Endpoint { .. })));
    }

    #[test]
    fn missing_cert_file_is_an_io_error() {
        let config = EndpointConfig {
            address: "collector.example.com:443".into(),
            trusted_cert_path: Some(PathBuf::from("/nonexistent/bundle.pem")),
        };
        assert!(matches!(config.build(), Err(Error::TrustedCert(_))));
    }
}
