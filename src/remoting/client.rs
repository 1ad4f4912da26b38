//! Host-side RPC client
//!
//! Each call opens a fresh transient mailbox, sends one request, then reads
//! that mailbox until the final response correlated by `reply_to_id` arrives.
//! Interstitial requests the guest sends on the same mailbox in the meantime
//! are answered through the [`InterstitialRegistry`].
//!
//! ```text
//!   host                                guest
//!    │── ExecutePluginRequest (id=7) ──▶│
//!    │◀── FileReadRequest (id=3) ───────│   interstitial
//!    │── FileReadResponse (re=3) ──────▶│
//!    │◀── ExecutePluginResponse (re=7) ─│   final
//! ```

use crate::postoffice::wire::timestamp_ticks;
use crate::postoffice::{MailboxMessage, PostOffice, PostOfficeError};
use crate::remoting::handlers::InterstitialRegistry;
use crate::remoting::messages::*;
use crate::remoting::protocol::{parse_with, RemoteProtocol};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timeout used for every call when debug timeouts are on.
pub const DEBUG_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-call timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    pub execute: Duration,
    pub trigger: Duration,
    pub load: Duration,
    pub unload: Duration,
    pub get_available: Duration,
    pub cross_domain: Duration,
    pub fetch_view_data: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            execute: Duration::from_secs(10),
            trigger: Duration::from_secs(2),
            load: Duration::from_secs(600),
            unload: Duration::from_secs(10),
            get_available: Duration::from_secs(10),
            cross_domain: Duration::from_secs(10),
            fetch_view_data: Duration::from_secs(10),
        }
    }
}

impl RpcTimeouts {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            execute: timeout,
            trigger: timeout,
            load: timeout,
            unload: timeout,
            get_available: timeout,
            cross_domain: timeout,
            fetch_view_data: timeout,
        }
    }

    pub fn for_debug_mode(debug: bool) -> Self {
        if debug {
            Self::uniform(DEBUG_CALL_TIMEOUT)
        } else {
            Self::default()
        }
    }
}

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("{method} timed out after {timeout:?}")]
    TimedOut { method: &'static str, timeout: Duration },

    #[error("Could not parse {method} response: {reason}")]
    Parse { method: &'static str, reason: String },

    #[error("Unexpected response to {method}: {actual}")]
    UnexpectedResponse { method: &'static str, actual: &'static str },

    #[error("{method} failed remotely: {exception}")]
    Remote { method: &'static str, exception: RemoteException },

    #[error("{method} returned no result")]
    EmptyResult { method: &'static str },

    #[error("Could not encode {method} request: {reason}")]
    Encode { method: &'static str, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] PostOfficeError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }
}

/// Unpack a typed result, turning exceptions into `RpcError::Remote`.
pub(crate) fn unpack<T>(method: &'static str, result: RemoteResult<T>) -> Result<Option<T>, RpcError> {
    result.into_result().map_err(|exception| RpcError::Remote { method, exception })
}

pub(crate) fn unexpected(method: &'static str, actual: &RemoteMessage) -> RpcError {
    RpcError::UnexpectedResponse { method, actual: actual.kind() }
}

pub struct RemoteExecutorClient {
    post_office: Arc<PostOffice>,
    protocol: Arc<dyn RemoteProtocol>,
    timeouts: RpcTimeouts,
    handlers: Arc<InterstitialRegistry>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RemoteExecutorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutorClient")
            .field("post_office", &self.post_office.name())
            .field("protocol", &self.protocol.name())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl RemoteExecutorClient {
    pub fn new(
        post_office: Arc<PostOffice>,
        protocol: Arc<dyn RemoteProtocol>,
        timeouts: RpcTimeouts,
        handlers: Arc<InterstitialRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { post_office, protocol, timeouts, handlers, shutdown }
    }

    pub fn timeouts(&self) -> &RpcTimeouts {
        &self.timeouts
    }

    pub async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<LoadedPluginInfo, RpcError> {
        const METHOD: &str = "LoadPlugin";
        let request = RemoteMessage::LoadPluginRequest(PluginRequest { plugin_id: plugin_id.clone() });
        match self.call(METHOD, request, self.timeouts.load).await? {
            RemoteMessage::LoadPluginResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, RpcError> {
        const METHOD: &str = "UnloadPlugin";
        let request = RemoteMessage::UnloadPluginRequest(PluginRequest { plugin_id: plugin_id.clone() });
        match self.call(METHOD, request, self.timeouts.unload).await? {
            RemoteMessage::UnloadPluginResponse(result) => Ok(unpack(METHOD, result)?.unwrap_or(false)),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn execute_plugin(&self, request: ExecutePluginRequest) -> Result<Value, RpcError> {
        const METHOD: &str = "ExecutePlugin";
        match self.call(METHOD, RemoteMessage::ExecutePluginRequest(request), self.timeouts.execute).await? {
            RemoteMessage::ExecutePluginResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn trigger_plugin(&self, request: TriggerPluginRequest) -> Result<Value, RpcError> {
        const METHOD: &str = "TriggerPlugin";
        match self.call(METHOD, RemoteMessage::TriggerPluginRequest(request), self.timeouts.trigger).await? {
            RemoteMessage::TriggerPluginResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn cross_domain_request(&self, request: CrossDomainRequestData) -> Result<Value, RpcError> {
        const METHOD: &str = "CrossDomainRequest";
        match self.call(METHOD, RemoteMessage::CrossDomainRequest(request), self.timeouts.cross_domain).await? {
            RemoteMessage::CrossDomainRequestResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn cross_domain_response(&self, request: CrossDomainResponseData) -> Result<Value, RpcError> {
        const METHOD: &str = "CrossDomainResponse";
        match self.call(METHOD, RemoteMessage::CrossDomainResponse(request), self.timeouts.cross_domain).await? {
            RemoteMessage::CrossDomainResponseResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    /// `Ok(None)` means the plugin has no such view data.
    pub async fn fetch_view_data(&self, request: FetchViewDataRequest) -> Result<Option<CachedWebData>, RpcError> {
        const METHOD: &str = "FetchViewData";
        match self.call(METHOD, RemoteMessage::FetchViewDataRequest(request), self.timeouts.fetch_view_data).await? {
            RemoteMessage::FetchViewDataResponse(result) => unpack(METHOD, result),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn get_available_plugins(&self) -> Result<Vec<PluginStrongName>, RpcError> {
        const METHOD: &str = "GetAvailablePlugins";
        match self.call(METHOD, RemoteMessage::GetAvailablePluginsRequest, self.timeouts.get_available).await? {
            RemoteMessage::GetAvailablePluginsResponse(result) => Ok(unpack(METHOD, result)?.unwrap_or_default()),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    /// One keepalive ping. Returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, RpcError> {
        const METHOD: &str = "KeepAlive";
        let started = Instant::now();
        let request = RemoteMessage::KeepAliveRequest(KeepAliveRequest { sent_ticks: timestamp_ticks() });
        match self.call(METHOD, request, timeout).await? {
            RemoteMessage::KeepAliveResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })?;
                Ok(started.elapsed())
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    /// Send `request` on a new transient mailbox and wait for its final response.
    async fn call(
        &self,
        method: &'static str,
        request: RemoteMessage,
        timeout: Duration,
    ) -> Result<RemoteMessage, RpcError> {
        let payload = self
            .protocol
            .serialize(&request)
            .map_err(|e| RpcError::Encode { method, reason: e.to_string() })?;
        let mailbox = self.post_office.create_transient_mailbox()?;
        let request_id = self.post_office.generate_message_id();
        let message = MailboxMessage::new(mailbox, self.protocol.protocol_id(), payload).with_message_id(request_id);
        let cancel = self.shutdown.child_token();

        let exchange = self.exchange(method, &message, &cancel);
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::TimedOut { method, timeout }),
        };
        cancel.cancel();
        if let Err(e) = &result {
            tracing::debug!("[RemoteExecutorClient.call] {} on {} failed: {}", method, mailbox, e);
        }
        result
    }

    async fn exchange(
        &self,
        method: &'static str,
        message: &MailboxMessage,
        cancel: &CancellationToken,
    ) -> Result<RemoteMessage, RpcError> {
        let mailbox = message.mailbox_id;
        let request_id = message.message_id;
        self.post_office.send_message(message, cancel).await?;
        loop {
            let incoming = self.post_office.receive_message(mailbox, cancel).await?;
            let parsed = match parse_with(incoming.protocol_id, &incoming.payload) {
                Ok(parsed) => parsed,
                Err(e) if incoming.reply_to_id == request_id => {
                    return Err(RpcError::Parse { method, reason: e.to_string() });
                }
                Err(e) => {
                    tracing::warn!("[RemoteExecutorClient.call] {} ignoring unparseable message on {}: {}", method, mailbox, e);
                    continue;
                }
            };

            if parsed.is_final_response() {
                if incoming.reply_to_id != request_id {
                    tracing::warn!(
                        "[RemoteExecutorClient.call] {} got {} replying to unknown request {}",
                        method,
                        parsed.kind(),
                        incoming.reply_to_id
                    );
                    continue;
                }
                if let RemoteMessage::Fault(exception) = parsed {
                    return Err(RpcError::Remote { method, exception });
                }
                return Ok(parsed);
            }

            if parsed.interstitial_kind().is_some() {
                self.handlers.respond(&self.post_office, &incoming, parsed, cancel).await?;
                continue;
            }

            tracing::warn!("[RemoteExecutorClient.call] {} ignoring unexpected {} on {}", method, parsed.kind(), mailbox);
        }
    }
}
