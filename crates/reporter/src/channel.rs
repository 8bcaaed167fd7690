// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The long-lived dispatch channel to the collector.
//!
//! One refcounted [`Connection`] is shared by every sender task. It owns
//! the current collector address (redirects swap it at runtime), rebuilds
//! the underlying tonic channel on demand, and drives every RPC through
//! the retry/backoff/redirect policy. A terminal `INVALID_API_KEY` cancels
//! the shared shutdown token, which every task observes.

use crate::backoff::{MAX_RETRIES, retry_delay};
use crate::client::{CollectorClient, EndpointConfig, REQUEST_TIMEOUT};
use crate::error::Error;
use crate::proto::{
    EncodingType, HostId, MessageRequest, MessageResult, PingRequest, ResultCode, RpcMethod,
    SettingsRequest, SettingsResult,
};
use prost::Message;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::transport::Channel;
use tracing::{debug, warn};

/// Redirects honoured within a single invocation.
pub const MAX_REDIRECTS: u32 = 20;

/// Consecutive failures before the log level escalates to warn.
const FAILURE_WARN_THRESHOLD: u32 = 5;

/// A request for one of the collector's methods.
#[derive(Debug, Clone)]
pub enum RpcRequest {
    /// PostEvents upload.
    Events(MessageRequest),
    /// PostMetrics upload.
    Metrics(MessageRequest),
    /// PostStatus upload.
    Status(MessageRequest),
    /// GetSettings fetch.
    Settings(SettingsRequest),
    /// Keep-alive.
    Ping(PingRequest),
}

impl RpcRequest {
    /// The method this request targets.
    pub fn method(&self) -> RpcMethod {
        match self {
            RpcRequest::Events(_) => RpcMethod::PostEvents,
            RpcRequest::Metrics(_) => RpcMethod::PostMetrics,
            RpcRequest::Status(_) => RpcMethod::PostStatus,
            RpcRequest::Settings(_) => RpcMethod::GetSettings,
            RpcRequest::Ping(_) => RpcMethod::Ping,
        }
    }

    /// Size of the encoded request body.
    pub fn encoded_len(&self) -> usize {
        match self {
            RpcRequest::Events(m) | RpcRequest::Metrics(m) | RpcRequest::Status(m) => {
                m.encoded_len()
            }
            RpcRequest::Settings(m) => m.encoded_len(),
            RpcRequest::Ping(m) => m.encoded_len(),
        }
    }
}

/// A response from the collector.
#[derive(Debug, Clone)]
pub enum RpcReply {
    /// Response of the upload methods and Ping.
    Message(MessageResult),
    /// Response of GetSettings.
    Settings(SettingsResult),
}

impl RpcReply {
    /// The server verdict; unknown codes are treated as retryable.
    pub fn result_code(&self) -> ResultCode {
        let raw = match self {
            RpcReply::Message(m) => m.result,
            RpcReply::Settings(s) => s.result,
        };
        ResultCode::try_from(raw).unwrap_or(ResultCode::TryLater)
    }

    /// The response argument (redirect target, warnings context).
    pub fn arg(&self) -> &str {
        match self {
            RpcReply::Message(m) => &m.arg,
            RpcReply::Settings(s) => &s.arg,
        }
    }

    /// Unwraps the settings payload.
    pub fn into_settings(self) -> Option<SettingsResult> {
        match self {
            RpcReply::Settings(s) => Some(s),
            RpcReply::Message(_) => None,
        }
    }
}

struct ConnState {
    address: String,
    channel: Option<Channel>,
    active: bool,
}

/// Refcounted dispatch channel shared by the sender and periodic tasks.
pub struct Connection {
    state: RwLock<ConnState>,
    trusted_cert_path: Option<PathBuf>,
    service_key: String,
    identity: HostId,
    max_request_bytes: usize,
    refs: AtomicUsize,
    consecutive_failures: AtomicU32,
    last_activity: parking_lot::Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Creates a connection that will lazily dial `address`.
    pub fn new(
        address: String,
        trusted_cert_path: Option<PathBuf>,
        service_key: String,
        identity: HostId,
        max_request_bytes: usize,
        shutdown: CancellationToken,
    ) -> Connection {
        Connection {
            state: RwLock::new(ConnState {
                address,
                channel: None,
                active: false,
            }),
            trusted_cert_path,
            service_key,
            identity,
            max_request_bytes,
            refs: AtomicUsize::new(1),
            consecutive_failures: AtomicU32::new(0),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            shutdown,
        }
    }

    /// The shutdown token every reporter task observes.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Takes another reference to the underlying channel.
    pub fn retain(&self) {
        let _ = self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one reference; the channel is actually closed when the
    /// last reference goes away.
    pub async fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut state = self.state.write().await;
            state.channel = None;
            state.active = false;
        }
    }

    /// Swaps the collector address and forces a reconnect.
    pub async fn set_address(&self, address: &str) {
        let mut state = self.state.write().await;
        debug!(from = %state.address, to = address, "collector address updated");
        state.address = address.to_owned();
        state.channel = None;
        state.active = false;
    }

    /// Time since the last RPC attempt; drives the keep-alive ping.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Builds an upload request carrying the service key and identity.
    pub fn message_request(&self, messages: Vec<Vec<u8>>) -> MessageRequest {
        MessageRequest {
            api_key: self.service_key.clone(),
            messages,
            encoding: EncodingType::Bson as i32,
            identity: Some(self.identity.clone()),
        }
    }

    /// Builds a settings request.
    pub fn settings_request(&self, client_version: &str) -> SettingsRequest {
        SettingsRequest {
            api_key: self.service_key.clone(),
            identity: Some(self.identity.clone()),
            client_version: client_version.to_owned(),
        }
    }

    /// Builds a keep-alive request.
    pub fn ping_request(&self) -> PingRequest {
        PingRequest {
            api_key: self.service_key.clone(),
        }
    }

    /// Invokes one collector RPC under the full retry policy.
    ///
    /// Oversize requests are refused without a retry. Transient transport
    /// errors and `TRY_LATER`/`LIMIT_EXCEEDED` verdicts back off and retry
    /// up to the attempt cap; redirects swap the address and continue;
    /// `INVALID_API_KEY` cancels the shutdown token and surfaces as a
    /// terminal error. Non-retryable methods report their first failure.
    pub async fn invoke_rpc(&self, request: RpcRequest) -> Result<RpcReply, Error> {
        let method = request.method();
        let size = request.encoded_len();
        if size > self.max_request_bytes {
            return Err(Error::RequestTooBig {
                method,
                size,
                max: self.max_request_bytes,
            });
        }

        // The shutdown token does not gate the first attempt: the graceful
        // drain happens after cancellation and still gets one delivery try.
        // It only short-circuits the retry waits below.
        let mut attempt = 0u32;
        let mut redirects = 0u32;
        let mut last_error = String::new();
        loop {
            attempt += 1;

            let outcome = {
                let mut client = self.client().await?;
                tokio::time::timeout(REQUEST_TIMEOUT, dispatch(&mut client, &request)).await
            };
            self.touch();

            match outcome {
                // The per-attempt deadline fired: the connection is stale.
                Err(_elapsed) => {
                    self.mark_inactive().await;
                    last_error = format!("{method} attempt timed out (conn-stale)");
                    self.count_failure(method, &last_error);
                }
                Ok(Err(status)) => {
                    if matches!(status.code(), Code::DeadlineExceeded | Code::Cancelled) {
                        self.mark_inactive().await;
                        last_error = format!("{method} cancelled (conn-stale): {status}");
                    } else {
                        last_error = format!("{method} transport error: {status}");
                    }
                    self.count_failure(method, &last_error);
                }
                Ok(Ok(reply)) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    match reply.result_code() {
                        ResultCode::Ok => return Ok(reply),
                        ResultCode::TryLater | ResultCode::LimitExceeded => {
                            last_error = format!("{method}: server asked to retry later");
                            debug!(%method, "collector asked to retry later");
                        }
                        ResultCode::InvalidApiKey => {
                            warn!(%method, "collector rejected the service key; shutting down");
                            self.shutdown.cancel();
                            return Err(Error::InvalidApiKey);
                        }
                        ResultCode::Redirect => {
                            redirects += 1;
                            if redirects > MAX_REDIRECTS {
                                return Err(Error::RedirectLimit { method });
                            }
                            let target = reply.arg().to_owned();
                            if target.is_empty() {
                                warn!(%method, "redirect without a target address");
                                last_error = format!("{method}: redirect without target");
                            } else {
                                self.set_address(&target).await;
                                // Redirects do not consume a retry slot.
                                attempt -= 1;
                                continue;
                            }
                        }
                    }
                }
            }

            if !method.retry_on_error() {
                return Err(Error::Transport {
                    method,
                    details: last_error,
                });
            }
            if attempt >= MAX_RETRIES {
                return Err(Error::GiveUpAfterRetries {
                    method,
                    attempts: attempt,
                    last_error,
                });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep(retry_delay(attempt)) => {}
            }
        }
    }

    /// A client over the current channel, (re)building it when needed.
    async fn client(&self) -> Result<CollectorClient<Channel>, Error> {
        {
            let state = self.state.read().await;
            if state.active {
                if let Some(channel) = &state.channel {
                    return Ok(CollectorClient::new(channel.clone()));
                }
            }
        }

        let mut state = self.state.write().await;
        // Another caller may have reconnected while we waited.
        if state.active {
            if let Some(channel) = &state.channel {
                return Ok(CollectorClient::new(channel.clone()));
            }
        }
        let endpoint = EndpointConfig {
            address: state.address.clone(),
            trusted_cert_path: self.trusted_cert_path.clone(),
        }
        .build()?;
        let channel = endpoint.connect_lazy();
        state.channel = Some(channel.clone());
        state.active = true;
        Ok(CollectorClient::new(channel))
    }

    async fn mark_inactive(&self) {
        let mut state = self.state.write().await;
        state.active = false;
        state.channel = None;
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn count_failure(&self, method: RpcMethod, details: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == FAILURE_WARN_THRESHOLD {
            warn!(%method, failures, details, "collector RPCs keep failing");
        } else {
            debug!(%method, failures, details, "collector RPC failed");
        }
    }
}

async fn dispatch(
    client: &mut CollectorClient<Channel>,
    request: &RpcRequest,
) -> Result<RpcReply, tonic::Status> {
    match request {
        RpcRequest::Events(m) => client.post_events(m.clone()).await.map(RpcReply::Message),
        RpcRequest::Metrics(m) => client.post_metrics(m.clone()).await.map(RpcReply::Message),
        RpcRequest::Status(m) => client.post_status(m.clone()).await.map(RpcReply::Message),
        RpcRequest::Settings(m) => client.get_settings(m.clone()).await.map(RpcReply::Settings),
        RpcRequest::Ping(m) => client.ping(m.clone()).await.map(RpcReply::Message),
    }
}
