//! Containers - isolated guests and their supervision
//!
//! ```text
//!   ContainerSupervisor
//!     ├── RuntimeCatalog        which runtime a package gets
//!     └── ContainerHost (n)     one per package
//!           ├── PostOffice      over the guest's stream
//!           ├── RemoteExecutorClient
//!           └── KeepaliveManager ── HealthEvent ──▶ supervisor recycles
//! ```

pub mod host;
pub mod keepalive;
pub mod launcher;
pub mod package;
pub mod runtime;
pub mod supervisor;


pub use host::{
    ContainerError, ContainerHost, ContainerParams, ContainerState, GuestHandle, GuestLauncher, LaunchedGuest,
};
pub use keepalive::{HealthEvent, HealthState, HealthTracker, KeepaliveManager, MovingAverage};
pub use launcher::{InProcessLauncher, LaunchCounters, ProcessLauncher};
pub use package::{PackageManifest, PluginComponent};
pub use runtime::{CatalogError, RuntimeCatalog, RuntimeFormatError, RuntimeInfo, RuntimeVersion, PORTABLE};
pub use supervisor::{ContainerSupervisor, ReconcileReport, SupervisorError};
