//! Interstitial request handlers (host side)
//!
//! While a call is in flight the guest may ask the host for services: log a
//! line, upload metrics, touch a file, proxy an HTTP request, and so on. The
//! host answers these through an [`InterstitialRegistry`] keyed on
//! [`InterstitialKind`]. A request with no registered handler gets an
//! exception reply so the guest is never left waiting.

use crate::postoffice::{MailboxMessage, PostOffice, PostOfficeError};
use crate::remoting::messages::{InterstitialKind, LogLevel, MetricEvent, RemoteException, RemoteMessage};
use crate::remoting::protocol::protocol_by_id;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait InterstitialHandler: Send + Sync {
    /// Request kinds this handler serves.
    fn kinds(&self) -> &'static [InterstitialKind];

    /// Produce the reply, or `None` for one-way requests.
    async fn handle(&self, request: RemoteMessage) -> Option<RemoteMessage>;
}

#[derive(Default, Clone)]
pub struct InterstitialRegistry {
    handlers: HashMap<InterstitialKind, Arc<dyn InterstitialHandler>>,
}

impl fmt::Debug for InterstitialRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| format!("{k:?}")).collect();
        kinds.sort();
        f.debug_struct("InterstitialRegistry").field("kinds", &kinds).finish()
    }
}

impl InterstitialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and metric handlers, plus file access when a root is given.
    pub fn with_defaults(file_root: Option<PathBuf>, metrics: Arc<dyn MetricSink>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogHandler));
        registry.register(Arc::new(MetricHandler::new(metrics)));
        if let Some(root) = file_root {
            registry.register(Arc::new(FileSystemHandler::new(root)));
        }
        registry
    }

    /// Register a handler for every kind it declares, replacing earlier ones.
    pub fn register(&mut self, handler: Arc<dyn InterstitialHandler>) {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, Arc::clone(&handler));
        }
    }

    pub fn handles(&self, kind: InterstitialKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, request: RemoteMessage) -> Option<RemoteMessage> {
        let Some(kind) = request.interstitial_kind() else {
            tracing::warn!("[InterstitialRegistry.dispatch] {} is not an interstitial request", request.kind());
            return None;
        };
        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(request).await,
            None => {
                tracing::debug!("[InterstitialRegistry.dispatch] No handler for {:?}", kind);
                request.failure_reply(RemoteException::new(
                    "NotSupported",
                    format!("no handler registered for {kind:?}"),
                ))
            }
        }
    }

    /// Handle one incoming interstitial message and send its reply on the same mailbox.
    pub async fn respond(
        &self,
        post_office: &PostOffice,
        incoming: &MailboxMessage,
        request: RemoteMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PostOfficeError> {
        let Some(reply) = self.dispatch(request).await else {
            return Ok(());
        };
        let protocol = match protocol_by_id(incoming.protocol_id) {
            Ok(protocol) => protocol,
            Err(e) => {
                tracing::warn!("[InterstitialRegistry.respond] Cannot answer: {}", e);
                return Ok(());
            }
        };
        let payload = match protocol.serialize(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("[InterstitialRegistry.respond] Cannot serialize {}: {}", reply.kind(), e);
                return Ok(());
            }
        };
        let message = MailboxMessage::new(incoming.mailbox_id, incoming.protocol_id, payload)
            .with_message_id(post_office.generate_message_id())
            .replying_to(incoming.message_id);
        post_office.send_message(&message, cancel).await
    }
}

// =============================================================================
// LOGGING
// =============================================================================

/// Re-emits guest log lines through `tracing`.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl InterstitialHandler for LogHandler {
    fn kinds(&self) -> &'static [InterstitialKind] {
        &[InterstitialKind::Log]
    }

    async fn handle(&self, request: RemoteMessage) -> Option<RemoteMessage> {
        if let RemoteMessage::Log(event) = request {
            let trace = event.trace_id.as_deref().unwrap_or("-");
            match event.level {
                LogLevel::Trace => tracing::trace!(target: "mailroom::guest", component = %event.component, trace, "{}", event.message),
                LogLevel::Debug => tracing::debug!(target: "mailroom::guest", component = %event.component, trace, "{}", event.message),
                LogLevel::Info => tracing::info!(target: "mailroom::guest", component = %event.component, trace, "{}", event.message),
                LogLevel::Warn => tracing::warn!(target: "mailroom::guest", component = %event.component, trace, "{}", event.message),
                LogLevel::Error => tracing::error!(target: "mailroom::guest", component = %event.component, trace, "{}", event.message),
            }
        }
        None
    }
}

// =============================================================================
// METRICS
// =============================================================================

pub trait MetricSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Writes metrics to the debug log.
#[derive(Debug, Default)]
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn record(&self, event: &MetricEvent) {
        tracing::debug!(target: "mailroom::metrics", "{} = {} {:?}", event.name, event.value, event.dimensions);
    }
}

pub struct MetricHandler {
    sink: Arc<dyn MetricSink>,
}

impl MetricHandler {
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl InterstitialHandler for MetricHandler {
    fn kinds(&self) -> &'static [InterstitialKind] {
        &[InterstitialKind::UploadMetrics]
    }

    async fn handle(&self, request: RemoteMessage) -> Option<RemoteMessage> {
        if let RemoteMessage::UploadMetrics(events) = request {
            for event in &events {
                self.sink.record(event);
            }
        }
        None
    }
}

// =============================================================================
// FILE ACCESS
// =============================================================================

/// File access confined to one directory.
#[derive(Debug, Clone)]
pub struct FileSystemHandler {
    root: PathBuf,
}

impl FileSystemHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join a guest-supplied relative path onto the root, refusing anything that could escape it.
    fn resolve(&self, requested: &str) -> Result<PathBuf, RemoteException> {
        let path = Path::new(requested);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(RemoteException::new(
                        "UnauthorizedAccess",
                        format!("path '{requested}' leaves the sandbox"),
                    ))
                }
            }
        }
        Ok(self.root.join(path))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteException> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map(Some).map_err(io_exception)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<Option<bool>, RemoteException> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_exception)?;
        }
        tokio::fs::write(&full, data).await.map_err(io_exception)?;
        Ok(Some(true))
    }

    async fn exists(&self, path: &str) -> Result<Option<bool>, RemoteException> {
        let full = self.resolve(path)?;
        Ok(Some(tokio::fs::try_exists(&full).await.unwrap_or(false)))
    }

    async fn list(&self, path: &str) -> Result<Option<Vec<String>>, RemoteException> {
        let full = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&full).await.map_err(io_exception)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_exception)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(Some(names))
    }
}

fn io_exception(e: std::io::Error) -> RemoteException {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => "FileNotFound",
        std::io::ErrorKind::PermissionDenied => "UnauthorizedAccess",
        _ => "IOException",
    };
    RemoteException::new(kind, e.to_string())
}

#[async_trait]
impl InterstitialHandler for FileSystemHandler {
    fn kinds(&self) -> &'static [InterstitialKind] {
        &[
            InterstitialKind::FileRead,
            InterstitialKind::FileWrite,
            InterstitialKind::FileExists,
            InterstitialKind::FileList,
        ]
    }

    async fn handle(&self, request: RemoteMessage) -> Option<RemoteMessage> {
        Some(match request {
            RemoteMessage::FileReadRequest(r) => RemoteMessage::FileReadResponse(self.read(&r.path).await.into()),
            RemoteMessage::FileWriteRequest(r) => {
                RemoteMessage::FileWriteResponse(self.write(&r.path, &r.data).await.into())
            }
            RemoteMessage::FileExistsRequest(r) => {
                RemoteMessage::FileExistsResponse(self.exists(&r.path).await.into())
            }
            RemoteMessage::FileListRequest(r) => RemoteMessage::FileListResponse(self.list(&r.path).await.into()),
            other => {
                return other.failure_reply(RemoteException::new("NotSupported", other.kind()));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoting::messages::{FilePathRequest, FileWriteRequest, HttpProxyRequest, RemoteResult};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<MetricEvent>>);

    impl MetricSink for CollectingSink {
        fn record(&self, event: &MetricEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    // TEST100: Files round-trip through the sandboxed handler
    #[tokio::test]
    async fn test_file_handler_read_write_list() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileSystemHandler::new(dir.path());

        let reply = handler
            .handle(RemoteMessage::FileWriteRequest(FileWriteRequest {
                path: "sub/data.bin".into(),
                data: vec![1, 2, 3],
            }))
            .await
            .unwrap();
        assert_eq!(reply, RemoteMessage::FileWriteResponse(RemoteResult::ok(true)));

        let reply = handler
            .handle(RemoteMessage::FileReadRequest(FilePathRequest { path: "sub/data.bin".into() }))
            .await
            .unwrap();
        assert_eq!(reply, RemoteMessage::FileReadResponse(RemoteResult::ok(vec![1, 2, 3])));

        let reply = handler
            .handle(RemoteMessage::FileListRequest(FilePathRequest { path: "sub".into() }))
            .await
            .unwrap();
        assert_eq!(reply, RemoteMessage::FileListResponse(RemoteResult::ok(vec!["data.bin".to_string()])));

        let reply = handler
            .handle(RemoteMessage::FileExistsRequest(FilePathRequest { path: "missing".into() }))
            .await
            .unwrap();
        assert_eq!(reply, RemoteMessage::FileExistsResponse(RemoteResult::ok(false)));
    }

    // TEST101: Paths that climb out of the root are refused
    #[tokio::test]
    async fn test_file_handler_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileSystemHandler::new(dir.path());
        for path in ["../secret", "/etc/passwd", "a/../../b"] {
            let reply = handler
                .handle(RemoteMessage::FileReadRequest(FilePathRequest { path: path.into() }))
                .await
                .unwrap();
            match reply {
                RemoteMessage::FileReadResponse(r) => {
                    assert_eq!(r.exception.unwrap().exception_type, "UnauthorizedAccess", "{path}")
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    // TEST102: Reading a missing file reports FileNotFound
    #[tokio::test]
    async fn test_file_handler_missing() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileSystemHandler::new(dir.path());
        let reply = handler
            .handle(RemoteMessage::FileReadRequest(FilePathRequest { path: "nope.txt".into() }))
            .await
            .unwrap();
        match reply {
            RemoteMessage::FileReadResponse(r) => assert_eq!(r.exception.unwrap().exception_type, "FileNotFound"),
            other => panic!("unexpected {other:?}"),
        }
    }

    // TEST103: Unregistered kinds get a NotSupported reply; one-way kinds get none
    #[tokio::test]
    async fn test_registry_unhandled() {
        let registry = InterstitialRegistry::new();
        let reply = registry
            .dispatch(RemoteMessage::HttpProxyRequest(HttpProxyRequest {
                method: "GET".into(),
                url: "http://example.invalid".into(),
                headers: vec![],
                body: vec![],
            }))
            .await
            .unwrap();
        match reply {
            RemoteMessage::HttpProxyResponse(r) => assert_eq!(r.exception.unwrap().exception_type, "NotSupported"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(registry.dispatch(RemoteMessage::UploadMetrics(vec![])).await.is_none());
    }

    // TEST104: Metric uploads reach the sink
    #[tokio::test]
    async fn test_metrics_reach_sink() {
        let sink = Arc::new(CollectingSink::default());
        let registry = InterstitialRegistry::with_defaults(None, sink.clone());
        assert!(registry.handles(InterstitialKind::Log));
        assert!(!registry.handles(InterstitialKind::FileRead));

        let event = MetricEvent { name: "latency".into(), value: 12.5, dimensions: Default::default() };
        assert!(registry.dispatch(RemoteMessage::UploadMetrics(vec![event.clone()])).await.is_none());
        assert_eq!(sink.0.lock().unwrap().as_slice(), &[event]);
    }
}
