//! Host client against a real guest server over an in-memory stream.

use super::client::{RemoteExecutorClient, RpcError, RpcTimeouts};
use super::guest::{run_guest, GuestBootstrap, GuestServices, PluginError, PluginLoader};
use super::handlers::{InterstitialRegistry, TracingMetricSink};
use super::messages::*;
use super::protocol::{protocol_by_name, JsonProtocol, RemoteProtocol};
use crate::postoffice::{MailboxMessage, PostOffice, PostOfficeOptions};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct EchoLoader {
    healthy: AtomicBool,
}

impl EchoLoader {
    fn new() -> Arc<Self> {
        Arc::new(Self { healthy: AtomicBool::new(true) })
    }
}

fn plugin() -> PluginStrongName {
    PluginStrongName::new("echo", 1, 0)
}

#[async_trait]
impl PluginLoader for EchoLoader {
    async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<Option<LoadedPluginInfo>, PluginError> {
        if plugin_id.plugin_id == "echo" {
            Ok(Some(LoadedPluginInfo { plugin_id: plugin_id.clone(), info: json!({"name": "Echo"}) }))
        } else if plugin_id.plugin_id == "hollow" {
            Ok(None)
        } else {
            Err(PluginError::not_found(plugin_id))
        }
    }

    async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, PluginError> {
        Ok(plugin_id.plugin_id == "echo")
    }

    async fn launch_plugin(&self, request: ExecutePluginRequest, services: &GuestServices) -> Result<Value, PluginError> {
        match request.entry_point.as_deref() {
            Some("read") => {
                let path = request.query["path"].as_str().unwrap_or_default().to_string();
                services.log(LogLevel::Info, "echo", format!("reading {path}")).await?;
                let data = services.read_file(&path).await?;
                Ok(json!({ "text": String::from_utf8_lossy(&data) }))
            }
            Some("read_two") => {
                let (a, b) = tokio::join!(services.read_file("a.txt"), services.read_file("b.txt"));
                Ok(json!([String::from_utf8_lossy(&a?), String::from_utf8_lossy(&b?)]))
            }
            Some("slow") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
            Some("fail") => Err(PluginError::new("PluginCrashed", "entry point threw")),
            _ => Ok(request.query),
        }
    }

    async fn trigger_plugin(&self, request: TriggerPluginRequest, _services: &GuestServices) -> Result<Value, PluginError> {
        Ok(json!({ "triggered": request.query }))
    }

    async fn cross_domain_request(
        &self,
        request: CrossDomainRequestData,
        _services: &GuestServices,
    ) -> Result<Value, PluginError> {
        Ok(json!({ "intent": request.target_intent }))
    }

    async fn cross_domain_response(
        &self,
        request: CrossDomainResponseData,
        _services: &GuestServices,
    ) -> Result<Value, PluginError> {
        Ok(request.context)
    }

    async fn fetch_view_data(&self, request: FetchViewDataRequest) -> Result<Option<CachedWebData>, PluginError> {
        if request.file_path == "index.html" {
            Ok(Some(CachedWebData { data: b"<html/>".to_vec(), mime_type: "text/html".into(), lifetime_seconds: Some(60) }))
        } else {
            Ok(None)
        }
    }

    async fn available_plugins(&self) -> Vec<PluginStrongName> {
        vec![plugin()]
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct Harness {
    client: RemoteExecutorClient,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn start(loader: Arc<dyn PluginLoader>, file_root: Option<PathBuf>, protocol: &str, timeouts: RpcTimeouts) -> Harness {
    let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();

    let bootstrap = GuestBootstrap { container_name: "itest".into(), protocol: protocol.into(), ..Default::default() };
    let (reader, writer) = tokio::io::split(guest_end);
    tokio::spawn(run_guest(bootstrap, reader, writer, loader, cancel.clone()));

    let post_office = Arc::new(PostOffice::from_stream(
        host_end,
        PostOfficeOptions { name: "itest-host".into(), ..Default::default() },
    ));
    let handlers = Arc::new(InterstitialRegistry::with_defaults(file_root, Arc::new(TracingMetricSink)));
    let client = RemoteExecutorClient::new(
        post_office,
        protocol_by_name(protocol).unwrap(),
        timeouts,
        handlers,
        cancel.clone(),
    );
    Harness { client, cancel }
}

fn execute(entry_point: &str, query: Value) -> ExecutePluginRequest {
    ExecutePluginRequest {
        plugin_id: plugin(),
        entry_point: Some(entry_point.to_string()),
        is_retry: false,
        query,
        trace_id: Some("trace-1".into()),
    }
}

// TEST120: Every typed call reaches the loader and returns its result
#[tokio::test]
async fn test_typed_calls() {
    for protocol in ["json", "cbor"] {
        let h = start(EchoLoader::new(), None, protocol, RpcTimeouts::default());
        let info = h.client.load_plugin(&plugin()).await.unwrap();
        assert_eq!(info.info["name"], "Echo");
        assert!(h.client.unload_plugin(&plugin()).await.unwrap());
        assert_eq!(h.client.execute_plugin(execute("echo", json!({"x": 1}))).await.unwrap(), json!({"x": 1}));

        let triggered = h
            .client
            .trigger_plugin(TriggerPluginRequest { plugin_id: plugin(), query: json!("hi"), trace_id: None })
            .await
            .unwrap();
        assert_eq!(triggered, json!({"triggered": "hi"}));

        let cross = h
            .client
            .cross_domain_request(CrossDomainRequestData {
                plugin_id: plugin(),
                target_intent: "weather.forecast".into(),
                trace_id: None,
            })
            .await
            .unwrap();
        assert_eq!(cross["intent"], "weather.forecast");

        let page = h
            .client
            .fetch_view_data(FetchViewDataRequest { plugin_id: plugin(), file_path: "index.html".into(), if_modified_since: None })
            .await
            .unwrap();
        assert_eq!(page.unwrap().mime_type, "text/html");
        let missing = h
            .client
            .fetch_view_data(FetchViewDataRequest { plugin_id: plugin(), file_path: "nope".into(), if_modified_since: None })
            .await
            .unwrap();
        assert!(missing.is_none());

        assert_eq!(h.client.get_available_plugins().await.unwrap(), vec![plugin()]);
        assert!(h.client.ping(Duration::from_secs(1)).await.is_ok());
    }
}

// TEST121: A plugin reads a host file through an interstitial request mid-call
#[tokio::test]
async fn test_interstitial_file_read() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("greeting.txt"), "hello from the host").unwrap();
    let h = start(EchoLoader::new(), Some(dir.path().to_path_buf()), "json", RpcTimeouts::default());

    let result = h.client.execute_plugin(execute("read", json!({"path": "greeting.txt"}))).await.unwrap();
    assert_eq!(result["text"], "hello from the host");

    let err = h.client.execute_plugin(execute("read", json!({"path": "../outside"}))).await.unwrap_err();
    match err {
        RpcError::Remote { exception, .. } => assert_eq!(exception.exception_type, "UnauthorizedAccess"),
        other => panic!("unexpected {other:?}"),
    }
}

// TEST122: Concurrent service requests from one call get their own replies
#[tokio::test]
async fn test_concurrent_interstitials() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "first").unwrap();
    std::fs::write(dir.path().join("b.txt"), "second").unwrap();
    let h = start(EchoLoader::new(), Some(dir.path().to_path_buf()), "cbor", RpcTimeouts::default());

    let result = h.client.execute_plugin(execute("read_two", Value::Null)).await.unwrap();
    assert_eq!(result, json!(["first", "second"]));
}

// TEST123: Plugin failures surface as remote exceptions and missing results as EmptyResult
#[tokio::test]
async fn test_remote_failures() {
    let h = start(EchoLoader::new(), None, "json", RpcTimeouts::default());

    match h.client.execute_plugin(execute("fail", Value::Null)).await.unwrap_err() {
        RpcError::Remote { method, exception } => {
            assert_eq!(method, "ExecutePlugin");
            assert_eq!(exception.exception_type, "PluginCrashed");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        h.client.load_plugin(&PluginStrongName::new("hollow", 1, 0)).await,
        Err(RpcError::EmptyResult { method: "LoadPlugin" })
    ));
    assert!(matches!(
        h.client.load_plugin(&PluginStrongName::new("ghost", 1, 0)).await,
        Err(RpcError::Remote { .. })
    ));
}

// TEST124: A slow plugin produces TimedOut and the channel stays usable
#[tokio::test]
async fn test_timeout_is_labeled() {
    let timeouts = RpcTimeouts { execute: Duration::from_millis(100), ..Default::default() };
    let h = start(EchoLoader::new(), None, "json", timeouts);

    let err = h.client.execute_plugin(execute("slow", Value::Null)).await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(err, RpcError::TimedOut { method: "ExecutePlugin", timeout: Duration::from_millis(100) });

    assert_eq!(h.client.execute_plugin(execute("echo", json!(2))).await.unwrap(), json!(2));
}

// TEST125: An unhealthy guest leaves pings unanswered
#[tokio::test]
async fn test_unhealthy_guest_ignores_ping() {
    let loader = EchoLoader::new();
    let h = start(loader.clone(), None, "json", RpcTimeouts::default());
    assert!(h.client.ping(Duration::from_secs(1)).await.is_ok());

    loader.healthy.store(false, Ordering::SeqCst);
    let err = h.client.ping(Duration::from_millis(100)).await.unwrap_err();
    assert!(err.is_timeout());
}

/// Host client against a hand-driven fake guest.
fn start_fake() -> (RemoteExecutorClient, Arc<PostOffice>, CancellationToken) {
    let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let guest = Arc::new(PostOffice::from_stream(
        guest_end,
        PostOfficeOptions { name: "fake-guest".into(), is_server: true, ..Default::default() },
    ));
    let host = Arc::new(PostOffice::from_stream(host_end, PostOfficeOptions::default()));
    let client = RemoteExecutorClient::new(
        host,
        Arc::new(JsonProtocol),
        RpcTimeouts::uniform(Duration::from_millis(500)),
        Arc::new(InterstitialRegistry::new()),
        cancel.clone(),
    );
    (client, guest, cancel)
}

// TEST126: A garbled reply to the request is a Parse error, not a timeout
#[tokio::test]
async fn test_unparseable_reply_is_parse_error() {
    let (client, guest, cancel) = start_fake();
    let fake = tokio::spawn(async move {
        let mailbox = guest.wait_for_messages_on_new_mailbox(&cancel).await.unwrap();
        let request = guest.receive_message(mailbox, &cancel).await.unwrap();
        let reply = MailboxMessage::new(mailbox, request.protocol_id, b"{definitely not".to_vec())
            .with_message_id(guest.generate_message_id())
            .replying_to(request.message_id);
        guest.send_message(&reply, &cancel).await.unwrap();
        guest
    });

    let err = client.get_available_plugins().await.unwrap_err();
    assert!(matches!(err, RpcError::Parse { method: "GetAvailablePlugins", .. }), "{err:?}");
    let _guest = fake.await.unwrap();
}

// TEST127: A final response correlated to some other request is skipped
#[tokio::test]
async fn test_reply_to_unknown_request_is_skipped() {
    let (client, guest, cancel) = start_fake();
    let fake = tokio::spawn(async move {
        let mailbox = guest.wait_for_messages_on_new_mailbox(&cancel).await.unwrap();
        let request = guest.receive_message(mailbox, &cancel).await.unwrap();
        let protocol = JsonProtocol;
        for (reply_to, plugins) in [(request.message_id + 1000, vec![]), (request.message_id, vec![plugin()])] {
            let body = RemoteMessage::GetAvailablePluginsResponse(RemoteResult::ok(plugins));
            let reply = MailboxMessage::new(mailbox, protocol.protocol_id(), protocol.serialize(&body).unwrap())
                .with_message_id(guest.generate_message_id())
                .replying_to(reply_to);
            guest.send_message(&reply, &cancel).await.unwrap();
        }
        guest
    });

    assert_eq!(client.get_available_plugins().await.unwrap(), vec![plugin()]);
    let _guest = fake.await.unwrap();
}

// TEST128: Interstitial kinds without a handler get a NotSupported reply the plugin can see
#[tokio::test]
async fn test_unhandled_interstitial_reaches_plugin() {
    struct ProxyLoader;

    #[async_trait]
    impl PluginLoader for ProxyLoader {
        async fn load_plugin(&self, _: &PluginStrongName) -> Result<Option<LoadedPluginInfo>, PluginError> {
            Ok(None)
        }
        async fn unload_plugin(&self, _: &PluginStrongName) -> Result<bool, PluginError> {
            Ok(false)
        }
        async fn launch_plugin(&self, _: ExecutePluginRequest, services: &GuestServices) -> Result<Value, PluginError> {
            let response = services
                .http_request(HttpProxyRequest {
                    method: "GET".into(),
                    url: "http://example.invalid/".into(),
                    headers: vec![],
                    body: vec![],
                })
                .await?;
            Ok(json!(response.status))
        }
        async fn trigger_plugin(&self, _: TriggerPluginRequest, _: &GuestServices) -> Result<Value, PluginError> {
            Ok(Value::Null)
        }
        async fn cross_domain_request(&self, _: CrossDomainRequestData, _: &GuestServices) -> Result<Value, PluginError> {
            Ok(Value::Null)
        }
        async fn cross_domain_response(&self, _: CrossDomainResponseData, _: &GuestServices) -> Result<Value, PluginError> {
            Ok(Value::Null)
        }
        async fn fetch_view_data(&self, _: FetchViewDataRequest) -> Result<Option<CachedWebData>, PluginError> {
            Ok(None)
        }
        async fn available_plugins(&self) -> Vec<PluginStrongName> {
            vec![]
        }
    }

    let h = start(Arc::new(ProxyLoader), None, "json", RpcTimeouts::default());
    match h.client.execute_plugin(execute("any", Value::Null)).await.unwrap_err() {
        RpcError::Remote { exception, .. } => assert_eq!(exception.exception_type, "NotSupported"),
        other => panic!("unexpected {other:?}"),
    }
}

// TEST129: A request the guest cannot parse is answered with a Fault instead of silence
#[tokio::test]
async fn test_unparseable_request_gets_fault() {
    let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let bootstrap = GuestBootstrap { container_name: "itest".into(), ..Default::default() };
    let (reader, writer) = tokio::io::split(guest_end);
    tokio::spawn(run_guest(bootstrap, reader, writer, EchoLoader::new(), cancel.clone()));

    let host = PostOffice::from_stream(host_end, PostOfficeOptions::default());
    let mailbox = host.create_transient_mailbox().unwrap();
    let request = MailboxMessage::new(mailbox, JsonProtocol.protocol_id(), br#"{"LoadPluginRequest": 7}"#.to_vec())
        .with_message_id(host.generate_message_id());
    host.send_message(&request, &cancel).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), host.receive_message(mailbox, &cancel))
        .await
        .expect("guest never replied")
        .unwrap();
    assert_eq!(reply.reply_to_id, request.message_id);
    match JsonProtocol.parse(&reply.payload).unwrap() {
        RemoteMessage::Fault(exception) => assert_eq!(exception.exception_type, "ParseError"),
        other => panic!("unexpected {other:?}"),
    }
    cancel.cancel();
}

// TEST134: A Fault reply fails the call as a remote error
#[tokio::test]
async fn test_fault_reply_is_remote_error() {
    let (client, guest, cancel) = start_fake();
    let fake = tokio::spawn(async move {
        let mailbox = guest.wait_for_messages_on_new_mailbox(&cancel).await.unwrap();
        let request = guest.receive_message(mailbox, &cancel).await.unwrap();
        let body = RemoteMessage::Fault(RemoteException::new("ParseError", "expected value at line 1"));
        let reply = MailboxMessage::new(mailbox, JsonProtocol.protocol_id(), JsonProtocol.serialize(&body).unwrap())
            .with_message_id(guest.generate_message_id())
            .replying_to(request.message_id);
        guest.send_message(&reply, &cancel).await.unwrap();
        guest
    });

    match client.get_available_plugins().await.unwrap_err() {
        RpcError::Remote { method, exception } => {
            assert_eq!(method, "GetAvailablePlugins");
            assert_eq!(exception.exception_type, "ParseError");
        }
        other => panic!("unexpected {other:?}"),
    }
    let _guest = fake.await.unwrap();
}
