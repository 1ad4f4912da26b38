//! ContainerHost against a real testguest child process.

use mailroom::config::RemotingConfig;
use mailroom::container::{ContainerError, ContainerHost, ContainerParams, ProcessLauncher, RuntimeInfo};
use mailroom::remoting::messages::*;
use mailroom::remoting::{FileSystemHandler, InterstitialRegistry, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_testguest"))
}

fn params(name: &str, protocol: &str, dedicated_reader: bool) -> ContainerParams {
    let mut remoting = RemotingConfig { protocol: protocol.into(), dedicated_reader, ..Default::default() };
    remoting.keepalive.interval_ms = 50;
    ContainerParams {
        name: name.into(),
        package_name: "echo-pkg".into(),
        runtime: Some(RuntimeInfo::parse("1.4-native").unwrap()),
        remoting,
        plugin_directory: "plugins".into(),
        environment_root: ".".into(),
        metric_dimensions: [("suite".to_string(), "process".to_string())].into_iter().collect(),
    }
}

fn echo() -> PluginStrongName {
    PluginStrongName::new("echo", 1, 0)
}

fn execute(entry_point: Option<&str>, query: Value) -> ExecutePluginRequest {
    ExecutePluginRequest {
        plugin_id: echo(),
        entry_point: entry_point.map(str::to_string),
        is_retry: false,
        query,
        trace_id: None,
    }
}

// TEST310: A child process container answers every call shape in both protocols
#[tokio::test]
async fn test310_process_container_calls() {
    for (protocol, dedicated_reader) in [("json", false), ("cbor", true)] {
        let name = format!("proc-{protocol}");
        let host = ContainerHost::start(params(&name, protocol, dedicated_reader), &launcher(), Arc::new(InterstitialRegistry::new()))
            .await
            .unwrap();

        let info = host.load_plugin(&echo()).await.unwrap();
        assert!(info.info["pid"].as_u64().is_some());

        let echoed = host.execute_plugin(execute(None, json!({"n": 7}))).await.unwrap();
        assert_eq!(echoed, json!({"n": 7}));

        let whoami = host.execute_plugin(execute(Some("whoami"), Value::Null)).await.unwrap();
        assert_eq!(whoami["container"], name.as_str());
        assert_eq!(whoami["runtime"], "1.4-native");

        assert_eq!(host.get_available_plugins().await.unwrap(), vec![echo()]);
        assert!(host.unload_plugin(&echo()).await.unwrap());
        host.dispose().await;
    }
}

// TEST311: The child reads a host file through an interstitial request
#[tokio::test]
async fn test311_process_interstitial_read() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.txt"), "across the pipe").unwrap();
    let mut handlers = InterstitialRegistry::new();
    handlers.register(Arc::new(FileSystemHandler::new(dir.path())));

    let host = ContainerHost::start(params("proc-fs", "json", false), &launcher(), Arc::new(handlers)).await.unwrap();
    let result = host.execute_plugin(execute(Some("read"), json!({"path": "note.txt"}))).await.unwrap();
    assert_eq!(result["text"], "across the pipe");
    host.dispose().await;
}

// TEST312: Load failures from the child surface as typed errors
#[tokio::test]
async fn test312_process_load_failures() {
    let host = ContainerHost::start(params("proc-fail", "json", false), &launcher(), Arc::new(InterstitialRegistry::new()))
        .await
        .unwrap();

    let err = host.load_plugin(&PluginStrongName::new("hollow", 1, 0)).await.unwrap_err();
    assert!(matches!(err, ContainerError::Rpc(RpcError::EmptyResult { .. })));

    let err = host.load_plugin(&PluginStrongName::new("missing", 1, 0)).await.unwrap_err();
    assert!(matches!(err, ContainerError::Rpc(RpcError::Remote { .. })));
    host.dispose().await;
}

// TEST313: A missing guest executable fails at launch
#[tokio::test]
async fn test313_missing_executable() {
    let launcher = ProcessLauncher::new("/nonexistent/mailroom-guest");
    let err = ContainerHost::start(params("proc-none", "json", false), &launcher, Arc::new(InterstitialRegistry::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::LaunchFailed(_)));
}
