//! ContainerSupervisor - plugins to packages to containers
//!
//! The supervisor keeps two plugin sets: the ones callers want loaded and
//! the ones actually loaded. [`ContainerSupervisor::reconcile`] levels them
//! one plugin at a time; a failure is recorded and the rest carry on.
//!
//! ## Topology
//!
//! ```text
//!   plugin ──▶ package ──▶ container name ──▶ Arc<ContainerHost>
//! ```
//!
//! Reads (resolving a call) take the topology lock shared; load, unload and
//! the recycle swap take it exclusive.
//!
//! ## Recycling
//!
//! ```text
//!   BecameUnhealthy
//!     ├─ read lock:   find package and loaded plugins of the failing container
//!     ├─ no lock:     start a replacement and load the same plugins
//!     ├─ write lock:  repoint package -> new container
//!     └─ no lock:     drain in-flight calls, dispose the old container
//! ```
//!
//! A failed recycle keeps the old container in place.

use crate::config::SupervisorConfig;
use crate::container::host::{ContainerError, ContainerHost, ContainerParams, GuestLauncher};
use crate::container::keepalive::HealthEvent;
use crate::container::package::PackageManifest;
use crate::container::runtime::{CatalogError, RuntimeCatalog, RuntimeInfo};
use crate::remoting::messages::*;
use crate::remoting::{InterstitialRegistry, RpcError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, RwLock};

// =============================================================================
// ERROR TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Plugin {0} is not known to any installed package")]
    UnknownPlugin(PluginStrongName),

    #[error("Plugin {0} is not loaded")]
    PluginNotLoaded(PluginStrongName),

    #[error("Plugin {0} is already loaded")]
    AlreadyLoaded(PluginStrongName),

    #[error("Package {0} is not installed")]
    UnknownPackage(String),

    #[error("No {runtime} runtime available for package {package}")]
    NoRuntimeAvailable { package: String, runtime: String },

    #[error("Loading {0} returned no plugin information")]
    LoadReturnedNothing(PluginStrongName),

    #[error("Invalid manifest for package {package}: {reason}")]
    InvalidManifest { package: String, reason: String },

    #[error("Recycle of {container} abandoned: {reason}")]
    RecycleAborted { container: String, reason: String },

    #[error("Runtime catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Container error: {0}")]
    Container(ContainerError),

    #[error("Call failed: {0}")]
    Rpc(RpcError),
}

impl From<ContainerError> for SupervisorError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Rpc(rpc) => SupervisorError::Rpc(rpc),
            other => SupervisorError::Container(other),
        }
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub loaded: Vec<PluginStrongName>,
    pub unloaded: Vec<PluginStrongName>,
    pub failed: Vec<(PluginStrongName, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Default)]
struct Topology {
    manifests: HashMap<String, PackageManifest>,
    plugin_to_package: HashMap<PluginStrongName, String>,
    package_to_container: HashMap<String, String>,
    containers: HashMap<String, Arc<ContainerHost>>,
    loaded: BTreeSet<PluginStrongName>,
}

impl Topology {
    fn container_of_package(&self, package: &str) -> Option<(String, Arc<ContainerHost>)> {
        let name = self.package_to_container.get(package)?;
        let container = self.containers.get(name)?;
        Some((name.clone(), Arc::clone(container)))
    }

    fn loaded_in_package(&self, package: &str) -> Vec<PluginStrongName> {
        self.loaded
            .iter()
            .filter(|p| self.plugin_to_package.get(*p).map(String::as_str) == Some(package))
            .cloned()
            .collect()
    }

    /// Detach a package's container from the maps. The caller disposes it.
    fn remove_container_of(&mut self, package: &str) -> Option<Arc<ContainerHost>> {
        let name = self.package_to_container.remove(package)?;
        self.containers.remove(&name)
    }
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn GuestLauncher>,
    handlers: Arc<InterstitialRegistry>,
    catalog: Option<RuntimeCatalog>,
    desired: Mutex<BTreeSet<PluginStrongName>>,
    topology: RwLock<Topology>,
}

/// Loads plugins into containers and keeps them healthy.
#[derive(Clone)]
pub struct ContainerSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContainerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSupervisor")
            .field("desired", &self.desired_plugins())
            .finish()
    }
}

impl ContainerSupervisor {
    /// Without a catalog, containers start with no runtime selection.
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn GuestLauncher>,
        handlers: Arc<InterstitialRegistry>,
        catalog: Option<RuntimeCatalog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                handlers,
                catalog,
                desired: Mutex::new(BTreeSet::new()),
                topology: RwLock::new(Topology::default()),
            }),
        }
    }

    /// Build the runtime catalog from `config.runtime_directory`, if set.
    pub async fn from_config(
        config: SupervisorConfig,
        launcher: Arc<dyn GuestLauncher>,
        handlers: Arc<InterstitialRegistry>,
    ) -> Result<Self, SupervisorError> {
        let catalog = match &config.runtime_directory {
            Some(dir) => {
                let mut catalog = RuntimeCatalog::new(&config.preferred_runtime, &config.allowed_runtimes)?;
                catalog.discover(dir).await?;
                Some(catalog)
            }
            None => None,
        };
        Ok(Self::new(config, launcher, handlers, catalog))
    }

    // =========================================================================
    // PACKAGE EVENTS
    // =========================================================================

    pub async fn install_package(&self, manifest: PackageManifest) -> Result<ReconcileReport, SupervisorError> {
        validate_manifest(&manifest)?;
        self.inner.register_package(manifest).await;
        Ok(self.reconcile().await)
    }

    /// Unload the old version's plugins, then register the new manifest.
    pub async fn update_package(&self, manifest: PackageManifest) -> Result<ReconcileReport, SupervisorError> {
        validate_manifest(&manifest)?;
        let mut report = ReconcileReport::default();
        if self.inner.topology.read().await.manifests.contains_key(&manifest.name) {
            report = self.inner.remove_package(&manifest.name).await?;
        }
        self.inner.register_package(manifest).await;
        let second = self.reconcile().await;
        report.loaded.extend(second.loaded);
        report.unloaded.extend(second.unloaded);
        report.failed.extend(second.failed);
        Ok(report)
    }

    pub async fn uninstall_package(&self, package: &str) -> Result<ReconcileReport, SupervisorError> {
        let mut report = self.inner.remove_package(package).await?;
        let second = self.reconcile().await;
        report.unloaded.extend(second.unloaded);
        report.loaded.extend(second.loaded);
        report.failed.extend(second.failed);
        Ok(report)
    }

    // =========================================================================
    // LOAD / UNLOAD / RECONCILE
    // =========================================================================

    /// Mark `plugin_id` as desired and load it now.
    pub async fn load_plugin(&self, plugin_id: &PluginStrongName) -> Result<LoadedPluginInfo, SupervisorError> {
        self.inner.lock_desired().insert(plugin_id.clone());
        self.inner.load_plugin(plugin_id).await
    }

    /// Mark `plugin_id` as not desired and unload it now.
    pub async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, SupervisorError> {
        self.inner.lock_desired().remove(plugin_id);
        self.inner.unload_plugin(plugin_id).await
    }

    /// Best-effort leveling of loaded plugins towards the desired set.
    pub async fn reconcile(&self) -> ReconcileReport {
        let desired = self.inner.lock_desired().clone();
        let (actual, available) = {
            let topology = self.inner.topology.read().await;
            let available: BTreeSet<PluginStrongName> = topology.plugin_to_package.keys().cloned().collect();
            (topology.loaded.clone(), available)
        };
        let mut report = ReconcileReport::default();

        for plugin in actual.difference(&desired) {
            match self.inner.unload_plugin(plugin).await {
                Ok(_) => report.unloaded.push(plugin.clone()),
                Err(e) => {
                    tracing::error!("[ContainerSupervisor.reconcile] Failed to unload {}: {}", plugin, e);
                    report.failed.push((plugin.clone(), e.to_string()));
                }
            }
        }
        // Desired plugins no installed package provides stay pending.
        for plugin in desired.difference(&actual).filter(|p| available.contains(*p)) {
            match self.inner.load_plugin(plugin).await {
                Ok(_) => report.loaded.push(plugin.clone()),
                Err(e) => {
                    tracing::error!("[ContainerSupervisor.reconcile] Failed to load {}: {}", plugin, e);
                    report.failed.push((plugin.clone(), e.to_string()));
                }
            }
        }
        report
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    pub async fn launch_plugin(&self, request: ExecutePluginRequest) -> Result<Value, SupervisorError> {
        let container = self.inner.resolve(&request.plugin_id).await?;
        Ok(container.execute_plugin(request).await?)
    }

    pub async fn trigger_plugin(&self, request: TriggerPluginRequest) -> Result<Value, SupervisorError> {
        let container = self.inner.resolve(&request.plugin_id).await?;
        Ok(container.trigger_plugin(request).await?)
    }

    pub async fn cross_domain_request(&self, request: CrossDomainRequestData) -> Result<Value, SupervisorError> {
        let container = self.inner.resolve(&request.plugin_id).await?;
        Ok(container.cross_domain_request(request).await?)
    }

    pub async fn cross_domain_response(&self, request: CrossDomainResponseData) -> Result<Value, SupervisorError> {
        let container = self.inner.resolve(&request.plugin_id).await?;
        Ok(container.cross_domain_response(request).await?)
    }

    pub async fn fetch_view_data(&self, request: FetchViewDataRequest) -> Result<Option<CachedWebData>, SupervisorError> {
        let container = self.inner.resolve(&request.plugin_id).await?;
        Ok(container.fetch_view_data(request).await?)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Every plugin of every installed package, sorted.
    pub async fn get_all_available_plugins(&self) -> Vec<PluginStrongName> {
        let topology = self.inner.topology.read().await;
        let mut all: Vec<PluginStrongName> = topology.plugin_to_package.keys().cloned().collect();
        all.sort();
        all
    }

    pub async fn loaded_plugins(&self) -> Vec<PluginStrongName> {
        self.inner.topology.read().await.loaded.iter().cloned().collect()
    }

    pub fn desired_plugins(&self) -> Vec<PluginStrongName> {
        self.inner.lock_desired().iter().cloned().collect()
    }

    pub fn has_dev_runtime_available(&self) -> bool {
        self.inner.catalog.as_ref().is_some_and(RuntimeCatalog::has_dev_runtime)
    }

    pub async fn container_for_plugin(&self, plugin_id: &PluginStrongName) -> Option<Arc<ContainerHost>> {
        let topology = self.inner.topology.read().await;
        let package = topology.plugin_to_package.get(plugin_id)?;
        topology.container_of_package(package).map(|(_, container)| container)
    }

    pub async fn container_count(&self) -> usize {
        self.inner.topology.read().await.containers.len()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Replace a package's container now. Returns the new container's name.
    pub async fn recycle_container(&self, package: &str) -> Result<String, SupervisorError> {
        let (_, container) = self
            .inner
            .topology
            .read()
            .await
            .container_of_package(package)
            .ok_or_else(|| SupervisorError::UnknownPackage(package.to_string()))?;
        self.inner.recycle(&container).await
    }

    /// Dispose every container. Desired plugins stay recorded.
    pub async fn shutdown(&self) {
        let containers: Vec<Arc<ContainerHost>> = {
            let mut topology = self.inner.topology.write().await;
            topology.package_to_container.clear();
            topology.loaded.clear();
            topology.containers.drain().map(|(_, c)| c).collect()
        };
        tracing::info!("[ContainerSupervisor.shutdown] Disposing {} containers", containers.len());
        for container in containers {
            container.dispose().await;
        }
    }
}

fn validate_manifest(manifest: &PackageManifest) -> Result<(), SupervisorError> {
    manifest
        .min_runtime_version()
        .map(|_| ())
        .map_err(|e| SupervisorError::InvalidManifest { package: manifest.name.clone(), reason: e.to_string() })
}

impl Inner {
    fn lock_desired(&self) -> std::sync::MutexGuard<'_, BTreeSet<PluginStrongName>> {
        self.desired.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn register_package(&self, manifest: PackageManifest) {
        let mut topology = self.topology.write().await;
        tracing::info!("[ContainerSupervisor] Registering package {} ({} plugins)", manifest.name, manifest.plugins.len());
        for plugin in manifest.plugin_ids() {
            topology.plugin_to_package.insert(plugin.clone(), manifest.name.clone());
        }
        topology.manifests.insert(manifest.name.clone(), manifest);
    }

    /// Unload a package's plugins and forget it.
    async fn remove_package(&self, package: &str) -> Result<ReconcileReport, SupervisorError> {
        let loaded = {
            let topology = self.topology.read().await;
            if !topology.manifests.contains_key(package) {
                return Err(SupervisorError::UnknownPackage(package.to_string()));
            }
            topology.loaded_in_package(package)
        };

        let mut report = ReconcileReport::default();
        for plugin in loaded {
            match self.unload_plugin(&plugin).await {
                Ok(_) => report.unloaded.push(plugin),
                Err(e) => {
                    tracing::warn!("[ContainerSupervisor] Failed to unload {} from removed package: {}", plugin, e);
                    report.failed.push((plugin, e.to_string()));
                }
            }
        }

        let leftover = {
            let mut topology = self.topology.write().await;
            if let Some(manifest) = topology.manifests.remove(package) {
                for plugin in manifest.plugin_ids() {
                    topology.plugin_to_package.remove(plugin);
                    topology.loaded.remove(plugin);
                }
            }
            topology.remove_container_of(package)
        };
        if let Some(container) = leftover {
            container.dispose().await;
        }
        tracing::info!("[ContainerSupervisor] Removed package {}", package);
        Ok(report)
    }

    async fn resolve(&self, plugin_id: &PluginStrongName) -> Result<Arc<ContainerHost>, SupervisorError> {
        let topology = self.topology.read().await;
        let package = topology
            .plugin_to_package
            .get(plugin_id)
            .ok_or_else(|| SupervisorError::UnknownPlugin(plugin_id.clone()))?;
        if !topology.loaded.contains(plugin_id) {
            return Err(SupervisorError::PluginNotLoaded(plugin_id.clone()));
        }
        topology
            .container_of_package(package)
            .map(|(_, container)| container)
            .ok_or_else(|| SupervisorError::PluginNotLoaded(plugin_id.clone()))
    }

    fn select_runtime(&self, manifest: &PackageManifest) -> Result<Option<RuntimeInfo>, SupervisorError> {
        let Some(catalog) = &self.catalog else {
            return Ok(None);
        };
        let family = manifest.requested_runtime();
        let min_version = manifest
            .min_runtime_version()
            .map_err(|e| SupervisorError::InvalidManifest { package: manifest.name.clone(), reason: e.to_string() })?;
        catalog
            .select(&family, min_version.as_ref())
            .map(Some)
            .ok_or_else(|| SupervisorError::NoRuntimeAvailable { package: manifest.name.clone(), runtime: family })
    }

    /// Start a container for `manifest` and watch its health.
    async fn start_container(self: &Arc<Self>, manifest: &PackageManifest) -> Result<(String, Arc<ContainerHost>), SupervisorError> {
        let runtime = self.select_runtime(manifest)?;
        let name = format!("{}-{}", manifest.name, uuid::Uuid::new_v4().simple());
        let params = ContainerParams {
            name: name.clone(),
            package_name: manifest.name.clone(),
            runtime,
            remoting: self.config.remoting.clone(),
            plugin_directory: self.config.plugin_directory.join(&manifest.name),
            environment_root: self.config.environment_root.clone(),
            metric_dimensions: self.config.metric_dimensions.clone(),
        };
        let container = Arc::new(ContainerHost::start(params, self.launcher.as_ref(), Arc::clone(&self.handlers)).await?);
        self.watch_health(&container);
        Ok((name, container))
    }

    fn watch_health(self: &Arc<Self>, container: &Arc<ContainerHost>) {
        let mut events = container.subscribe_health();
        let supervisor: Weak<Inner> = Arc::downgrade(self);
        let watched: Weak<ContainerHost> = Arc::downgrade(container);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HealthEvent::BecameUnhealthy { score }) => {
                        let (Some(supervisor), Some(container)) = (supervisor.upgrade(), watched.upgrade()) else {
                            return;
                        };
                        tracing::error!(
                            "[ContainerSupervisor] Container {} is unhealthy (score {:.2}), recycling",
                            container.name(),
                            score
                        );
                        if let Err(e) = supervisor.recycle(&container).await {
                            tracing::error!("[ContainerSupervisor] {}", e);
                        }
                    }
                    Ok(HealthEvent::Recovered { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn load_plugin(self: &Arc<Self>, plugin_id: &PluginStrongName) -> Result<LoadedPluginInfo, SupervisorError> {
        let mut topology = self.topology.write().await;
        let package = topology
            .plugin_to_package
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownPlugin(plugin_id.clone()))?;
        if topology.loaded.contains(plugin_id) {
            return Err(SupervisorError::AlreadyLoaded(plugin_id.clone()));
        }

        let (container_name, container, created) = match topology.container_of_package(&package) {
            Some((name, container)) => (name, container, false),
            None => {
                let manifest = topology
                    .manifests
                    .get(&package)
                    .cloned()
                    .ok_or_else(|| SupervisorError::UnknownPackage(package.clone()))?;
                tracing::info!("[ContainerSupervisor] Starting container for package {}", package);
                let (name, container) = self.start_container(&manifest).await?;
                topology.package_to_container.insert(package.clone(), name.clone());
                topology.containers.insert(name.clone(), Arc::clone(&container));
                (name, container, true)
            }
        };

        let result = match container.load_plugin(plugin_id).await {
            Ok(info) => Ok(info),
            Err(ContainerError::Rpc(RpcError::EmptyResult { .. })) => {
                Err(SupervisorError::LoadReturnedNothing(plugin_id.clone()))
            }
            Err(e) => Err(SupervisorError::from(e)),
        };

        match result {
            Ok(info) => {
                topology.loaded.insert(plugin_id.clone());
                tracing::info!("[ContainerSupervisor] Loaded {} into {}", plugin_id, container_name);
                Ok(info)
            }
            Err(e) => {
                tracing::error!("[ContainerSupervisor] Loading {} failed: {}", plugin_id, e);
                if created {
                    topology.remove_container_of(&package);
                    drop(topology);
                    container.dispose().await;
                }
                Err(e)
            }
        }
    }

    async fn unload_plugin(&self, plugin_id: &PluginStrongName) -> Result<bool, SupervisorError> {
        let (result, emptied) = {
            let mut topology = self.topology.write().await;
            let package = topology
                .plugin_to_package
                .get(plugin_id)
                .cloned()
                .ok_or_else(|| SupervisorError::UnknownPlugin(plugin_id.clone()))?;
            if !topology.loaded.contains(plugin_id) {
                return Err(SupervisorError::PluginNotLoaded(plugin_id.clone()));
            }
            let (_, container) = topology
                .container_of_package(&package)
                .ok_or_else(|| SupervisorError::PluginNotLoaded(plugin_id.clone()))?;

            // Still counted as loaded on failure so the next reconcile retries it.
            let unloaded = container.unload_plugin(plugin_id).await.map_err(|e| {
                tracing::error!("[ContainerSupervisor] Unloading {} failed: {}", plugin_id, e);
                SupervisorError::from(e)
            })?;
            topology.loaded.remove(plugin_id);
            let emptied = if topology.loaded_in_package(&package).is_empty() {
                topology.remove_container_of(&package)
            } else {
                None
            };
            (unloaded, emptied)
        };

        if let Some(container) = emptied {
            tracing::info!("[ContainerSupervisor] Disposing unused container {}", container.name());
            container.dispose().await;
        }
        Ok(result)
    }

    async fn recycle(self: &Arc<Self>, failing: &Arc<ContainerHost>) -> Result<String, SupervisorError> {
        let (old_name, package, plugins, manifest) = {
            let topology = self.topology.read().await;
            let old_name = topology
                .containers
                .iter()
                .find(|(_, c)| Arc::ptr_eq(c, failing))
                .map(|(name, _)| name.clone())
                .ok_or_else(|| SupervisorError::RecycleAborted {
                    container: failing.name().to_string(),
                    reason: "container is no longer registered".to_string(),
                })?;
            let package = failing.package_name().to_string();
            let manifest = topology.manifests.get(&package).cloned().ok_or_else(|| SupervisorError::RecycleAborted {
                container: old_name.clone(),
                reason: format!("package {package} is no longer installed"),
            })?;
            let plugins = topology.loaded_in_package(&package);
            (old_name, package, plugins, manifest)
        };

        tracing::info!("[ContainerSupervisor] Recycling {} ({} plugins)", old_name, plugins.len());
        let (new_name, replacement) = self.start_container(&manifest).await.map_err(|e| SupervisorError::RecycleAborted {
            container: old_name.clone(),
            reason: e.to_string(),
        })?;

        for plugin in &plugins {
            if let Err(e) = replacement.load_plugin(plugin).await {
                replacement.dispose().await;
                return Err(SupervisorError::RecycleAborted {
                    container: old_name,
                    reason: format!("reloading {plugin} failed: {e}"),
                });
            }
        }

        {
            let mut topology = self.topology.write().await;
            if topology.package_to_container.get(&package) != Some(&old_name) {
                drop(topology);
                replacement.dispose().await;
                return Err(SupervisorError::RecycleAborted {
                    container: old_name,
                    reason: "topology changed during recycle".to_string(),
                });
            }

            // Loads and unloads that landed on the old container while the replacement started.
            let current = topology.loaded_in_package(&package);
            for plugin in current.iter().filter(|p| !plugins.contains(*p)) {
                if let Err(e) = replacement.load_plugin(plugin).await {
                    drop(topology);
                    replacement.dispose().await;
                    return Err(SupervisorError::RecycleAborted {
                        container: old_name,
                        reason: format!("reloading {plugin} failed: {e}"),
                    });
                }
            }
            for plugin in plugins.iter().filter(|p| !current.contains(*p)) {
                if let Err(e) = replacement.unload_plugin(plugin).await {
                    tracing::warn!("[ContainerSupervisor] Unloading stale {} from {} failed: {}", plugin, new_name, e);
                }
            }

            topology.package_to_container.insert(package.clone(), new_name.clone());
            topology.containers.remove(&old_name);
            topology.containers.insert(new_name.clone(), replacement);
        }
        tracing::info!("[ContainerSupervisor] Swapped {} for {}", old_name, new_name);

        let drain_timeout = self.config.remoting.rpc_timeouts().execute;
        if !failing.drain(drain_timeout).await {
            tracing::warn!("[ContainerSupervisor] {} still had calls running after {:?}", old_name, drain_timeout);
        }
        failing.dispose().await;
        Ok(new_name)
    }
}
