//! mailroom - host/guest IPC over one duplex stream, and isolated plugin containers
//!
//! ```text
//!   ContainerSupervisor ──▶ ContainerHost ──▶ RemoteExecutorClient ──▶ PostOffice
//!                                                                         │ frames
//!                                                                         ▼
//!                               guest: PostOffice ──▶ GuestServer ──▶ PluginLoader
//! ```
//!
//! - [`postoffice`]: mailbox multiplexing, framing and resynchronizing reads.
//! - [`remoting`]: typed request/response correlation on top of mailboxes,
//!   both the host client and the guest server.
//! - [`container`]: guest lifecycle, keepalive, runtime selection and the
//!   supervisor that keeps plugins loaded.
//! - [`config`]: serde settings for all of the above.

pub mod config;
pub mod container;
pub mod postoffice;
pub mod remoting;

pub use config::{ConfigError, KeepaliveConfig, RemotingConfig, SupervisorConfig};
pub use container::{
    ContainerError, ContainerHost, ContainerSupervisor, GuestLauncher, InProcessLauncher, PackageManifest,
    ProcessLauncher, ReconcileReport, RuntimeCatalog, SupervisorError,
};
pub use postoffice::{MailboxId, MailboxMessage, PostOffice, PostOfficeError, PostOfficeOptions};
pub use remoting::{
    run_guest, GuestBootstrap, PluginError, PluginLoader, PluginStrongName, RemoteExecutorClient, RpcError,
};
