//! Typed RPC over a PostOffice
//!
//! - `messages`: the request/response union and its payload types
//! - `protocol`: byte encodings of that union
//! - `client`: host-side calls with per-method timeouts
//! - `handlers`: host-side answers to guest interstitial requests
//! - `guest`: the guest-side server and plugin callback surface

pub mod client;
pub mod guest;
pub mod handlers;
pub mod messages;
pub mod protocol;

pub use client::{RemoteExecutorClient, RpcError, RpcTimeouts};
pub use guest::{
    run_guest, GuestBootstrap, GuestError, GuestServer, GuestServices, PluginError, PluginLoader, ALIVE,
    CONTAINER_MAILBOX,
};
pub use handlers::{
    FileSystemHandler, InterstitialHandler, InterstitialRegistry, LogHandler, MetricHandler, MetricSink,
    TracingMetricSink,
};
pub use messages::{
    CachedWebData, CrossDomainRequestData, CrossDomainResponseData, ExecutePluginRequest, FetchViewDataRequest,
    InterstitialKind, LoadedPluginInfo, PluginStrongName, RemoteException, RemoteMessage, RemoteResult,
    TriggerPluginRequest,
};
pub use protocol::{protocol_by_id, protocol_by_name, CborProtocol, JsonProtocol, ProtocolError, RemoteProtocol};

#[cfg(test)]
mod integration_tests;
