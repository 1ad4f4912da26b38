//! testguest - guest process for exercising mailroom over real pipes
//!
//! Spawned by a host with the bootstrap flags of
//! [`mailroom::remoting::GuestBootstrap::to_args`]. Speaks the mailroom
//! protocol on stdin/stdout; logs go to stderr.
//!
//! Plugins it knows:
//! - `echo`: returns its query; entry point `read` fetches a host file,
//!   `whoami` reports the container name and runtime.
//! - `hollow`: loads to nothing.
//! Anything else fails to load.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use mailroom::remoting::guest::parse_metric_dimension;
use mailroom::remoting::messages::*;
use mailroom::remoting::{run_guest, GuestBootstrap, GuestServices, PluginError, PluginLoader};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser, Clone)]
#[command(name = "testguest")]
#[command(about = "mailroom test guest over stdin/stdout")]
struct Cli {
    #[arg(long, default_value = "guest")]
    container_name: String,

    #[arg(long, default_value = "stdio")]
    connection: String,

    #[arg(long, default_value_t = mailroom::remoting::CONTAINER_MAILBOX)]
    container_mailbox: u16,

    #[arg(long = "plugin-dir", default_value = "plugins")]
    plugin_directory: PathBuf,

    #[arg(long, default_value = ".")]
    environment_root: PathBuf,

    /// Payload protocol: json or cbor.
    #[arg(long, default_value = "json")]
    protocol: String,

    /// Repeatable `key=value` attached to every metric.
    #[arg(long = "metric-dimension", value_parser = parse_metric_dimension)]
    metric_dimensions: Vec<(String, String)>,

    #[arg(long)]
    debug_timeouts: bool,

    #[arg(long)]
    dedicated_reader: bool,
}

impl Cli {
    fn into_bootstrap(self) -> GuestBootstrap {
        GuestBootstrap {
            container_name: self.container_name,
            connection: self.connection,
            container_mailbox: self.container_mailbox,
            use_debug_timeouts: self.debug_timeouts,
            metric_dimensions: self.metric_dimensions.into_iter().collect(),
            plugin_directory: self.plugin_directory,
            environment_root: self.environment_root,
            dedicated_reader: self.dedicated_reader,
            protocol: self.protocol,
        }
    }
}

// =============================================================================
// Plugins
// =============================================================================

struct EchoLoader {
    container_name: String,
}

fn echo() -> PluginStrongName {
    PluginStrongName::new("echo", 1, 0)
}

#[async_trait]
impl PluginLoader for EchoLoader {
    async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<Option<LoadedPluginInfo>, PluginError> {
        match plugin_id.plugin_id.as_str() {
            "echo" => Ok(Some(LoadedPluginInfo { plugin_id: plugin_id.clone(), info: json!({"pid": std::process::id()}) })),
            "hollow" => Ok(None),
            _ => Err(PluginError::not_found(plugin_id)),
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
            Some("whoami") => Ok(json!({
                "container": self.container_name,
                "runtime": std::env::var("MAILROOM_RUNTIME").ok(),
            })),
            _ => Ok(request.query),
        }
    }

    async fn trigger_plugin(&self, request: TriggerPluginRequest, _services: &GuestServices) -> Result<Value, PluginError> {
        Ok(request.query)
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

    async fn fetch_view_data(&self, _request: FetchViewDataRequest) -> Result<Option<CachedWebData>, PluginError> {
        Ok(None)
    }

    async fn available_plugins(&self) -> Vec<PluginStrongName> {
        vec![echo()]
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the transport
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_ansi(false).init();

    let bootstrap = Cli::parse().into_bootstrap();
    if bootstrap.connection != "stdio" {
        anyhow::bail!("unsupported connection '{}'", bootstrap.connection);
    }

    let loader = Arc::new(EchoLoader { container_name: bootstrap.container_name.clone() });
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    run_guest(bootstrap, tokio::io::stdin(), tokio::io::stdout(), loader, cancel).await?;
    tracing::info!("[testguest] Host closed the channel, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // TEST300: Bootstrap flags parse back into the same bootstrap
    #[test]
    fn test_bootstrap_round_trip_through_cli() {
        let mut bootstrap = GuestBootstrap {
            container_name: "weather-9".into(),
            protocol: "cbor".into(),
            dedicated_reader: true,
            plugin_directory: PathBuf::from("/srv/plugins/weather"),
            ..Default::default()
        };
        bootstrap.metric_dimensions.insert("region".into(), "west".into());
        bootstrap.metric_dimensions.insert("tier".into(), "gold".into());

        let mut argv = vec!["testguest".to_string()];
        argv.extend(bootstrap.to_args());
        let parsed = Cli::try_parse_from(argv).unwrap().into_bootstrap();
        assert_eq!(parsed, bootstrap);
    }

    // TEST301: Malformed metric dimensions are rejected by the parser
    #[test]
    fn test_bad_metric_dimension() {
        let err = Cli::try_parse_from(["testguest", "--metric-dimension", "novalue"]);
        assert!(err.is_err());
    }
}
