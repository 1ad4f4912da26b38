//! Guest-side RPC server
//!
//! The guest end of a container. It announces itself with a raw `ALIVE`
//! message on the container mailbox, then serves every host call on its own
//! task. Plugin code reaches back to the host through [`GuestServices`],
//! which issues interstitial requests on the mailbox of the call in progress.
//!
//! ```text
//!   run_guest ──▶ GuestServer::serve
//!                   │  send "ALIVE" on container mailbox
//!                   └─ loop: wait_for_messages_on_new_mailbox
//!                          └─ spawn serve_call(mailbox)
//!                                 ├─ parse request (protocol from header)
//!                                 ├─ PluginLoader::<method>(.., GuestServices)
//!                                 └─ reply on mailbox, reply_to = request id
//! ```

use crate::postoffice::office::{DEBUG_MAILBOX_LIFETIME, DEFAULT_MAILBOX_LIFETIME};
use crate::postoffice::wire::timestamp_ticks;
use crate::postoffice::{MailboxId, MailboxMessage, PostOffice, PostOfficeError, PostOfficeOptions};
use crate::remoting::client::{unexpected, unpack, RpcError, DEBUG_CALL_TIMEOUT};
use crate::remoting::messages::*;
use crate::remoting::protocol::{parse_with, protocol_by_id, protocol_by_name, ProtocolError, RemoteProtocol, RAW_PROTOCOL_ID};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Payload of the startup handshake.
pub const ALIVE: &[u8] = b"ALIVE";

/// Well-known channel number of the container-level mailbox.
pub const CONTAINER_MAILBOX: u16 = 1;

/// How long a plugin waits for the host to answer a service request.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// BOOTSTRAP
// =============================================================================

/// Parameters handed to a guest when it is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestBootstrap {
    pub container_name: String,
    /// Where the duplex stream lives. `stdio` for a child process, `memory` in-process.
    pub connection: String,
    pub container_mailbox: u16,
    pub use_debug_timeouts: bool,
    pub metric_dimensions: BTreeMap<String, String>,
    pub plugin_directory: PathBuf,
    pub environment_root: PathBuf,
    pub dedicated_reader: bool,
    pub protocol: String,
}

impl Default for GuestBootstrap {
    fn default() -> Self {
        Self {
            container_name: "guest".to_string(),
            connection: "stdio".to_string(),
            container_mailbox: CONTAINER_MAILBOX,
            use_debug_timeouts: false,
            metric_dimensions: BTreeMap::new(),
            plugin_directory: PathBuf::from("plugins"),
            environment_root: PathBuf::from("."),
            dedicated_reader: false,
            protocol: "json".to_string(),
        }
    }
}

impl GuestBootstrap {
    /// Render as command line arguments for a guest process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--container-name".to_string(),
            self.container_name.clone(),
            "--connection".to_string(),
            self.connection.clone(),
            "--container-mailbox".to_string(),
            self.container_mailbox.to_string(),
            "--plugin-dir".to_string(),
            self.plugin_directory.display().to_string(),
            "--environment-root".to_string(),
            self.environment_root.display().to_string(),
            "--protocol".to_string(),
            self.protocol.clone(),
        ];
        for (key, value) in &self.metric_dimensions {
            args.push("--metric-dimension".to_string());
            args.push(format!("{key}={value}"));
        }
        if self.use_debug_timeouts {
            args.push("--debug-timeouts".to_string());
        }
        if self.dedicated_reader {
            args.push("--dedicated-reader".to_string());
        }
        args
    }

    pub fn post_office_options(&self) -> PostOfficeOptions {
        PostOfficeOptions {
            name: format!("{}-guest", self.container_name),
            is_server: true,
            dedicated_reader: self.dedicated_reader,
            mailbox_lifetime: if self.use_debug_timeouts { DEBUG_MAILBOX_LIFETIME } else { DEFAULT_MAILBOX_LIFETIME },
        }
    }

    fn service_timeout(&self) -> Duration {
        if self.use_debug_timeouts {
            DEBUG_CALL_TIMEOUT
        } else {
            DEFAULT_SERVICE_TIMEOUT
        }
    }
}

/// Parse one `key=value` metric dimension.
pub fn parse_metric_dimension(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Failure raised by plugin code; travels back to the host as a remote exception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PluginError {
    pub kind: String,
    pub message: String,
}

impl PluginError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn not_found(plugin_id: &PluginStrongName) -> Self {
        Self::new("PluginNotFound", format!("no plugin {plugin_id}"))
    }
}

impl From<PluginError> for RemoteException {
    fn from(e: PluginError) -> Self {
        RemoteException::new(e.kind, e.message)
    }
}

impl From<RpcError> for PluginError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Remote { exception, .. } => PluginError::new(exception.exception_type, exception.message),
            other => PluginError::new("ServiceFailure", other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("Transport error: {0}")]
    Transport(#[from] PostOfficeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

// =============================================================================
// PLUGIN LOADER
// =============================================================================

/// Whatever actually hosts plugin code inside the guest.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<Option<LoadedPluginInfo>, PluginError>;

    async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, PluginError>;

    async fn launch_plugin(&self, request: ExecutePluginRequest, services: &GuestServices) -> Result<Value, PluginError>;

    async fn trigger_plugin(&self, request: TriggerPluginRequest, services: &GuestServices) -> Result<Value, PluginError>;

    async fn cross_domain_request(
        &self,
        request: CrossDomainRequestData,
        services: &GuestServices,
    ) -> Result<Value, PluginError>;

    async fn cross_domain_response(
        &self,
        request: CrossDomainResponseData,
        services: &GuestServices,
    ) -> Result<Value, PluginError>;

    async fn fetch_view_data(&self, request: FetchViewDataRequest) -> Result<Option<CachedWebData>, PluginError>;

    async fn available_plugins(&self) -> Vec<PluginStrongName>;

    /// An unhealthy guest stops answering keepalive pings.
    fn is_healthy(&self) -> bool {
        true
    }
}

// =============================================================================
// GUEST SERVICES
// =============================================================================

/// Host services available to plugin code during one call.
///
/// Requests go out on the call's own mailbox. Replies are matched on
/// `reply_to_id`; a reply meant for a concurrent request from the same call
/// is parked until its owner picks it up.
#[derive(Clone)]
pub struct GuestServices {
    post_office: Arc<PostOffice>,
    mailbox: MailboxId,
    protocol: Arc<dyn RemoteProtocol>,
    timeout: Duration,
    trace_id: Option<String>,
    metric_dimensions: Arc<BTreeMap<String, String>>,
    parked: Arc<tokio::sync::Mutex<HashMap<u32, MailboxMessage>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for GuestServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestServices")
            .field("mailbox", &self.mailbox)
            .field("protocol", &self.protocol.name())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

impl GuestServices {
    pub fn new(
        post_office: Arc<PostOffice>,
        mailbox: MailboxId,
        protocol: Arc<dyn RemoteProtocol>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            post_office,
            mailbox,
            protocol,
            timeout,
            trace_id: None,
            metric_dimensions: Arc::new(BTreeMap::new()),
            parked: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            cancel,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Dimensions merged into every uploaded metric.
    pub fn with_metric_dimensions(mut self, dimensions: Arc<BTreeMap<String, String>>) -> Self {
        self.metric_dimensions = dimensions;
        self
    }

    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    pub async fn log(&self, level: LogLevel, component: &str, message: impl Into<String>) -> Result<(), RpcError> {
        let event = LogEvent {
            level,
            component: component.to_string(),
            message: message.into(),
            trace_id: self.trace_id.clone(),
            timestamp_ticks: timestamp_ticks(),
        };
        self.send_one_way(RemoteMessage::Log(event)).await
    }

    pub async fn upload_metrics(&self, mut events: Vec<MetricEvent>) -> Result<(), RpcError> {
        for event in &mut events {
            for (key, value) in self.metric_dimensions.iter() {
                event.dimensions.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        self.send_one_way(RemoteMessage::UploadMetrics(events)).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, RpcError> {
        const METHOD: &str = "FileRead";
        let request = RemoteMessage::FileReadRequest(FilePathRequest { path: path.to_string() });
        match self.request(METHOD, request).await? {
            RemoteMessage::FileReadResponse(result) => unpack(METHOD, result).map(Option::unwrap_or_default),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<bool, RpcError> {
        const METHOD: &str = "FileWrite";
        let request = RemoteMessage::FileWriteRequest(FileWriteRequest { path: path.to_string(), data });
        match self.request(METHOD, request).await? {
            RemoteMessage::FileWriteResponse(result) => unpack(METHOD, result).map(|r| r.unwrap_or(false)),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool, RpcError> {
        const METHOD: &str = "FileExists";
        let request = RemoteMessage::FileExistsRequest(FilePathRequest { path: path.to_string() });
        match self.request(METHOD, request).await? {
            RemoteMessage::FileExistsResponse(result) => unpack(METHOD, result).map(|r| r.unwrap_or(false)),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<String>, RpcError> {
        const METHOD: &str = "FileList";
        let request = RemoteMessage::FileListRequest(FilePathRequest { path: path.to_string() });
        match self.request(METHOD, request).await? {
            RemoteMessage::FileListResponse(result) => unpack(METHOD, result).map(Option::unwrap_or_default),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn http_request(&self, request: HttpProxyRequest) -> Result<HttpProxyResponseData, RpcError> {
        const METHOD: &str = "HttpProxy";
        match self.request(METHOD, RemoteMessage::HttpProxyRequest(request)).await? {
            RemoteMessage::HttpProxyResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn synthesize_speech(&self, request: SynthesizeSpeechRequest) -> Result<Vec<u8>, RpcError> {
        const METHOD: &str = "SynthesizeSpeech";
        match self.request(METHOD, RemoteMessage::SynthesizeSpeechRequest(request)).await? {
            RemoteMessage::SynthesizeSpeechResponse(result) => {
                unpack(METHOD, result)?.ok_or(RpcError::EmptyResult { method: METHOD })
            }
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn recognize_speech(&self, request: RecognizeSpeechRequest) -> Result<String, RpcError> {
        const METHOD: &str = "RecognizeSpeech";
        match self.request(METHOD, RemoteMessage::RecognizeSpeechRequest(request)).await? {
            RemoteMessage::RecognizeSpeechResponse(result) => Ok(unpack(METHOD, result)?.unwrap_or_default()),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    /// `Ok(None)` when the user has no token for that configuration.
    pub async fn get_oauth_token(&self, request: OAuthTokenRequest) -> Result<Option<String>, RpcError> {
        const METHOD: &str = "OAuthToken";
        match self.request(METHOD, RemoteMessage::OAuthTokenRequest(request)).await? {
            RemoteMessage::OAuthTokenResponse(result) => unpack(METHOD, result),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    pub async fn delete_oauth_token(&self, request: OAuthTokenRequest) -> Result<bool, RpcError> {
        const METHOD: &str = "OAuthDeleteToken";
        match self.request(METHOD, RemoteMessage::OAuthDeleteTokenRequest(request)).await? {
            RemoteMessage::OAuthDeleteTokenResponse(result) => Ok(unpack(METHOD, result)?.unwrap_or(false)),
            other => Err(unexpected(METHOD, &other)),
        }
    }

    fn encode(&self, method: &'static str, message: &RemoteMessage) -> Result<MailboxMessage, RpcError> {
        let payload = self
            .protocol
            .serialize(message)
            .map_err(|e| RpcError::Encode { method, reason: e.to_string() })?;
        Ok(MailboxMessage::new(self.mailbox, self.protocol.protocol_id(), payload)
            .with_message_id(self.post_office.generate_message_id()))
    }

    async fn send_one_way(&self, message: RemoteMessage) -> Result<(), RpcError> {
        let outgoing = self.encode(message.kind(), &message)?;
        self.post_office.send_message(&outgoing, &self.cancel).await?;
        Ok(())
    }

    async fn request(&self, method: &'static str, message: RemoteMessage) -> Result<RemoteMessage, RpcError> {
        let outgoing = self.encode(method, &message)?;
        let request_id = outgoing.message_id;
        let timeout = self.timeout;
        let exchange = async {
            self.post_office.send_message(&outgoing, &self.cancel).await?;
            self.await_reply(method, request_id).await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.parked.lock().await.remove(&request_id);
                Err(RpcError::TimedOut { method, timeout })
            }
        }
    }

    async fn await_reply(&self, method: &'static str, request_id: u32) -> Result<RemoteMessage, RpcError> {
        let reply = loop {
            // The lock doubles as the receive gate for this mailbox.
            let mut parked = self.parked.lock().await;
            if let Some(reply) = parked.remove(&request_id) {
                break reply;
            }
            let incoming = self.post_office.receive_message(self.mailbox, &self.cancel).await?;
            if incoming.reply_to_id == request_id {
                break incoming;
            }
            if incoming.reply_to_id == 0 {
                tracing::warn!("[GuestServices.await_reply] Dropping unsolicited message on {}", self.mailbox);
                continue;
            }
            parked.insert(incoming.reply_to_id, incoming);
        };
        match parse_with(reply.protocol_id, &reply.payload) {
            Ok(RemoteMessage::Fault(exception)) => Err(RpcError::Remote { method, exception }),
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(RpcError::Parse { method, reason: e.to_string() }),
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

pub struct GuestServer {
    post_office: Arc<PostOffice>,
    loader: Arc<dyn PluginLoader>,
    container_mailbox: MailboxId,
    service_timeout: Duration,
    metric_dimensions: Arc<BTreeMap<String, String>>,
}

impl GuestServer {
    pub fn new(post_office: Arc<PostOffice>, loader: Arc<dyn PluginLoader>, bootstrap: &GuestBootstrap) -> Self {
        let container_mailbox = post_office.create_permanent_mailbox(bootstrap.container_mailbox);
        Self {
            post_office,
            loader,
            container_mailbox,
            service_timeout: bootstrap.service_timeout(),
            metric_dimensions: Arc::new(bootstrap.metric_dimensions.clone()),
        }
    }

    /// Services bound to the container mailbox, for work outside any call.
    pub fn container_services(&self, protocol: Arc<dyn RemoteProtocol>, cancel: CancellationToken) -> GuestServices {
        GuestServices::new(
            Arc::clone(&self.post_office),
            self.container_mailbox,
            protocol,
            self.service_timeout,
            cancel,
        )
        .with_metric_dimensions(Arc::clone(&self.metric_dimensions))
    }

    /// Announce readiness, then serve calls until the stream closes or `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), GuestError> {
        let alive = MailboxMessage::new(self.container_mailbox, RAW_PROTOCOL_ID, ALIVE.to_vec())
            .with_message_id(self.post_office.generate_message_id());
        self.post_office.send_message(&alive, &cancel).await?;
        tracing::debug!("[GuestServer.serve] {} is alive", self.post_office.name());

        loop {
            let mailbox = match self.post_office.wait_for_messages_on_new_mailbox(&cancel).await {
                Ok(mailbox) => mailbox,
                Err(PostOfficeError::StreamClosed | PostOfficeError::Shutdown | PostOfficeError::Cancelled) => {
                    tracing::debug!("[GuestServer.serve] {} stopping", self.post_office.name());
                    cancel.cancel();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let call = CallContext {
                post_office: Arc::clone(&self.post_office),
                loader: Arc::clone(&self.loader),
                mailbox,
                service_timeout: self.service_timeout,
                metric_dimensions: Arc::clone(&self.metric_dimensions),
                cancel: cancel.child_token(),
            };
            tokio::spawn(async move {
                if let Err(e) = call.serve().await {
                    tracing::warn!("[GuestServer.serve_call] Call on {} failed: {}", call.mailbox, e);
                }
            });
        }
    }
}

struct CallContext {
    post_office: Arc<PostOffice>,
    loader: Arc<dyn PluginLoader>,
    mailbox: MailboxId,
    service_timeout: Duration,
    metric_dimensions: Arc<BTreeMap<String, String>>,
    cancel: CancellationToken,
}

impl CallContext {
    async fn serve(&self) -> Result<(), GuestError> {
        let incoming = self.post_office.receive_message(self.mailbox, &self.cancel).await?;
        let protocol = protocol_by_id(incoming.protocol_id)?;
        let reply = match protocol.parse(&incoming.payload) {
            Ok(request) => {
                tracing::trace!("[GuestServer.serve_call] {} on {}", request.kind(), self.mailbox);
                match self.dispatch(request, Arc::clone(&protocol)).await {
                    Some(reply) => reply,
                    None => return Ok(()),
                }
            }
            Err(e) => {
                tracing::warn!("[GuestServer.serve_call] Unparseable request on {}: {}", self.mailbox, e);
                RemoteMessage::Fault(RemoteException::new("ParseError", e.to_string()))
            }
        };
        let payload = protocol.serialize(&reply)?;
        let outgoing = MailboxMessage::new(self.mailbox, incoming.protocol_id, payload)
            .with_message_id(self.post_office.generate_message_id())
            .replying_to(incoming.message_id);
        self.post_office.send_message(&outgoing, &self.cancel).await?;
        Ok(())
    }

    fn services(&self, protocol: Arc<dyn RemoteProtocol>, trace_id: Option<String>) -> GuestServices {
        GuestServices::new(
            Arc::clone(&self.post_office),
            self.mailbox,
            protocol,
            self.service_timeout,
            self.cancel.clone(),
        )
        .with_trace_id(trace_id)
        .with_metric_dimensions(Arc::clone(&self.metric_dimensions))
    }

    async fn dispatch(&self, request: RemoteMessage, protocol: Arc<dyn RemoteProtocol>) -> Option<RemoteMessage> {
        let loader = &self.loader;
        Some(match request {
            RemoteMessage::LoadPluginRequest(r) => {
                RemoteMessage::LoadPluginResponse(loader.load_plugin(&r.plugin_id).await.into())
            }
            RemoteMessage::UnloadPluginRequest(r) => {
                RemoteMessage::UnloadPluginResponse(loader.unload_plugin(&r.plugin_id).await.map(Some).into())
            }
            RemoteMessage::ExecutePluginRequest(r) => {
                let services = self.services(protocol, r.trace_id.clone());
                RemoteMessage::ExecutePluginResponse(loader.launch_plugin(r, &services).await.map(Some).into())
            }
            RemoteMessage::TriggerPluginRequest(r) => {
                let services = self.services(protocol, r.trace_id.clone());
                RemoteMessage::TriggerPluginResponse(loader.trigger_plugin(r, &services).await.map(Some).into())
            }
            RemoteMessage::CrossDomainRequest(r) => {
                let services = self.services(protocol, r.trace_id.clone());
                RemoteMessage::CrossDomainRequestResponse(
                    loader.cross_domain_request(r, &services).await.map(Some).into(),
                )
            }
            RemoteMessage::CrossDomainResponse(r) => {
                let services = self.services(protocol, r.trace_id.clone());
                RemoteMessage::CrossDomainResponseResponse(
                    loader.cross_domain_response(r, &services).await.map(Some).into(),
                )
            }
            RemoteMessage::FetchViewDataRequest(r) => {
                RemoteMessage::FetchViewDataResponse(loader.fetch_view_data(r).await.into())
            }
            RemoteMessage::GetAvailablePluginsRequest => {
                RemoteMessage::GetAvailablePluginsResponse(RemoteResult::ok(loader.available_plugins().await))
            }
            RemoteMessage::KeepAliveRequest(_) => {
                if !loader.is_healthy() {
                    tracing::debug!("[GuestServer.serve_call] Unhealthy, ignoring ping");
                    return None;
                }
                RemoteMessage::KeepAliveResponse(RemoteResult::ok(timestamp_ticks()))
            }
            other => {
                tracing::warn!("[GuestServer.serve_call] Unexpected {} on {}", other.kind(), self.mailbox);
                return other.failure_reply(RemoteException::new("NotSupported", other.kind()));
            }
        })
    }
}

/// Run the guest side of a container over one duplex stream.
pub async fn run_guest<R, W>(
    bootstrap: GuestBootstrap,
    reader: R,
    writer: W,
    loader: Arc<dyn PluginLoader>,
    cancel: CancellationToken,
) -> Result<(), GuestError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    // Validated up front so a bad name fails before the handshake.
    let protocol = protocol_by_name(&bootstrap.protocol)?;
    tracing::info!(
        "[run_guest] Starting {} (protocol {}, dedicated reader {})",
        bootstrap.container_name,
        protocol.name(),
        bootstrap.dedicated_reader
    );
    let post_office = Arc::new(PostOffice::new(reader, writer, bootstrap.post_office_options()));
    let server = GuestServer::new(Arc::clone(&post_office), loader, &bootstrap);
    let result = server.serve(cancel).await;
    post_office.shutdown();
    result
}
