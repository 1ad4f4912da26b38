//! ContainerHost - one guest, one PostOffice
//!
//! ## Start sequence
//!
//! ```text
//!   launch guest ──▶ PostOffice over its stream ──▶ await "ALIVE" on P1
//!        ──▶ container dispatcher task ──▶ keepalive
//! ```
//!
//! Any failure along the way tears down what was already started.

use crate::config::RemotingConfig;
use crate::container::keepalive::{HealthEvent, KeepaliveManager};
use crate::container::runtime::RuntimeInfo;
use crate::postoffice::{MailboxId, PostOffice, PostOfficeError, PostOfficeOptions};
use crate::remoting::messages::*;
use crate::remoting::protocol::{parse_with, protocol_by_name, ProtocolError, RAW_PROTOCOL_ID};
use crate::remoting::{GuestBootstrap, InterstitialRegistry, RemoteExecutorClient, RpcError, ALIVE, CONTAINER_MAILBOX};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEALTH_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// ERROR TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContainerError {
    #[error("Failed to launch guest: {0}")]
    LaunchFailed(String),

    #[error("Guest did not report alive within {0:?}")]
    StartupTimedOut(Duration),

    #[error("Bad startup handshake: {0}")]
    BadHandshake(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] PostOfficeError),

    #[error("Call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Container {0} has been disposed")]
    Disposed(String),
}

// =============================================================================
// LAUNCHER SEAM
// =============================================================================

/// A running guest, from the host's point of view.
#[async_trait]
pub trait GuestHandle: Send + Sync {
    /// Stop the guest and release its resources.
    async fn terminate(&mut self);
}

pub type GuestReader = Box<dyn AsyncRead + Send + Unpin>;
pub type GuestWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream ends plus the handle of a freshly launched guest.
pub struct LaunchedGuest {
    pub reader: GuestReader,
    pub writer: GuestWriter,
    pub handle: Box<dyn GuestHandle>,
}

/// Starts guests.
#[async_trait]
pub trait GuestLauncher: Send + Sync {
    /// Connection string written into the bootstrap.
    fn connection(&self) -> &'static str;

    async fn launch(
        &self,
        bootstrap: &GuestBootstrap,
        runtime: Option<&RuntimeInfo>,
    ) -> Result<LaunchedGuest, ContainerError>;
}

// =============================================================================
// CONTAINER HOST
// =============================================================================

#[derive(Debug, Clone)]
pub struct ContainerParams {
    pub name: String,
    pub package_name: String,
    pub runtime: Option<RuntimeInfo>,
    pub remoting: RemotingConfig,
    pub plugin_directory: PathBuf,
    pub environment_root: PathBuf,
    pub metric_dimensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Running,
    Disposed,
}

pub struct ContainerHost {
    name: String,
    package_name: String,
    runtime: Option<RuntimeInfo>,
    state: Mutex<ContainerState>,
    post_office: Arc<PostOffice>,
    client: Arc<RemoteExecutorClient>,
    shutdown: CancellationToken,
    health_tx: broadcast::Sender<HealthEvent>,
    in_flight: AtomicUsize,
    idle: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    keepalive: tokio::sync::Mutex<Option<KeepaliveManager>>,
    guest: tokio::sync::Mutex<Option<Box<dyn GuestHandle>>>,
}

impl std::fmt::Debug for ContainerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHost")
            .field("name", &self.name)
            .field("package_name", &self.package_name)
            .field("state", &self.state())
            .finish()
    }
}

impl ContainerHost {
    pub async fn start(
        params: ContainerParams,
        launcher: &dyn GuestLauncher,
        handlers: Arc<InterstitialRegistry>,
    ) -> Result<Self, ContainerError> {
        let remoting = &params.remoting;
        let protocol = protocol_by_name(&remoting.protocol)?;
        let bootstrap = GuestBootstrap {
            container_name: params.name.clone(),
            connection: launcher.connection().to_string(),
            container_mailbox: CONTAINER_MAILBOX,
            use_debug_timeouts: remoting.debug_timeouts,
            metric_dimensions: params.metric_dimensions.clone(),
            plugin_directory: params.plugin_directory.clone(),
            environment_root: params.environment_root.clone(),
            dedicated_reader: remoting.dedicated_reader,
            protocol: protocol.name().to_string(),
        };

        tracing::debug!("[ContainerHost.start] Launching {} for {}", params.name, params.package_name);
        let LaunchedGuest { reader, writer, mut handle } = launcher.launch(&bootstrap, params.runtime.as_ref()).await?;

        let post_office = Arc::new(PostOffice::new(
            reader,
            writer,
            PostOfficeOptions {
                name: format!("{}-host", params.name),
                is_server: false,
                dedicated_reader: remoting.dedicated_reader,
                mailbox_lifetime: remoting.mailbox_lifetime(),
            },
        ));
        let container_mailbox = post_office.create_permanent_mailbox(CONTAINER_MAILBOX);
        let shutdown = CancellationToken::new();

        if let Err(e) = await_alive(&post_office, container_mailbox, remoting.startup_timeout(), &shutdown).await {
            tracing::error!("[ContainerHost.start] {} failed to start: {}", params.name, e);
            shutdown.cancel();
            post_office.shutdown();
            handle.terminate().await;
            return Err(e);
        }

        let client = Arc::new(RemoteExecutorClient::new(
            Arc::clone(&post_office),
            protocol,
            remoting.rpc_timeouts(),
            Arc::clone(&handlers),
            shutdown.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch_container_mailbox(
            Arc::clone(&post_office),
            container_mailbox,
            handlers,
            shutdown.clone(),
        ));

        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        let keepalive = remoting.keepalive.enabled.then(|| {
            KeepaliveManager::start(Arc::clone(&client), &remoting.keepalive, health_tx.clone(), params.name.clone())
        });

        tracing::info!("[ContainerHost.start] Container {} is running", params.name);
        Ok(Self {
            name: params.name,
            package_name: params.package_name,
            runtime: params.runtime,
            state: Mutex::new(ContainerState::Running),
            post_office,
            client,
            shutdown,
            health_tx,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            dispatcher: Mutex::new(Some(dispatcher)),
            keepalive: tokio::sync::Mutex::new(keepalive),
            guest: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn runtime(&self) -> Option<&RuntimeInfo> {
        self.runtime.as_ref()
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    /// Current keepalive score, if keepalive is running.
    pub async fn quality_of_service(&self) -> Option<f64> {
        self.keepalive.lock().await.as_ref().map(KeepaliveManager::quality_of_service)
    }

    fn begin_call(&self) -> Result<(&RemoteExecutorClient, CallGuard<'_>), ContainerError> {
        if self.state() != ContainerState::Running {
            return Err(ContainerError::Disposed(self.name.clone()));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok((&self.client, CallGuard(self)))
    }

    /// Calls currently running against this container.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no call is running. Returns false if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<LoadedPluginInfo, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.load_plugin(plugin_id).await?)
    }

    pub async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.unload_plugin(plugin_id).await?)
    }

    pub async fn execute_plugin(&self, request: ExecutePluginRequest) -> Result<Value, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.execute_plugin(request).await?)
    }

    pub async fn trigger_plugin(&self, request: TriggerPluginRequest) -> Result<Value, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.trigger_plugin(request).await?)
    }

    pub async fn cross_domain_request(&self, request: CrossDomainRequestData) -> Result<Value, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.cross_domain_request(request).await?)
    }

    pub async fn cross_domain_response(&self, request: CrossDomainResponseData) -> Result<Value, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.cross_domain_response(request).await?)
    }

    pub async fn fetch_view_data(&self, request: FetchViewDataRequest) -> Result<Option<CachedWebData>, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.fetch_view_data(request).await?)
    }

    pub async fn get_available_plugins(&self) -> Result<Vec<PluginStrongName>, ContainerError> {
        let (client, _call) = self.begin_call()?;
        Ok(client.get_available_plugins().await?)
    }

    /// Stop keepalive, close the channel and terminate the guest. Idempotent.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state == ContainerState::Disposed {
                return;
            }
            *state = ContainerState::Disposed;
        }
        tracing::info!("[ContainerHost.dispose] Disposing {}", self.name);

        if let Some(mut keepalive) = self.keepalive.lock().await.take() {
            keepalive.stop().await;
        }
        self.shutdown.cancel();
        self.post_office.shutdown();
        let dispatcher = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        if let Some(mut guest) = self.guest.lock().await.take() {
            guest.terminate().await;
        }
    }
}

struct CallGuard<'a>(&'a ContainerHost);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Drop for ContainerHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn await_alive(
    post_office: &PostOffice,
    mailbox: MailboxId,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ContainerError> {
    let message = match tokio::time::timeout(timeout, post_office.receive_message(mailbox, cancel)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ContainerError::StartupTimedOut(timeout)),
    };
    if message.protocol_id != RAW_PROTOCOL_ID || message.payload != ALIVE {
        return Err(ContainerError::BadHandshake(format!(
            "protocol {} payload {:?}",
            message.protocol_id,
            String::from_utf8_lossy(&message.payload)
        )));
    }
    Ok(())
}

/// Answer guest-initiated requests that arrive outside any call.
async fn dispatch_container_mailbox(
    post_office: Arc<PostOffice>,
    mailbox: MailboxId,
    handlers: Arc<InterstitialRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let incoming = match post_office.receive_message(mailbox, &cancel).await {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("[ContainerHost.dispatcher] {} stopping: {}", post_office.name(), e);
                return;
            }
        };
        let request = match parse_with(incoming.protocol_id, &incoming.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("[ContainerHost.dispatcher] Unparseable message on {}: {}", mailbox, e);
                continue;
            }
        };
        if request.interstitial_kind().is_none() {
            tracing::warn!("[ContainerHost.dispatcher] Ignoring {} on {}", request.kind(), mailbox);
            continue;
        }
        if let Err(e) = handlers.respond(&post_office, &incoming, request, &cancel).await {
            tracing::debug!("[ContainerHost.dispatcher] {} stopping: {}", post_office.name(), e);
            return;
        }
    }
}
