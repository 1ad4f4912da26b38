//! Guest launchers
//!
//! - [`InProcessLauncher`]: the guest is a tokio task on the other end of an
//!   in-memory duplex stream. Used for load-context style isolation and tests.
//! - [`ProcessLauncher`]: the guest is a child process speaking over its
//!   stdin/stdout.

use crate::container::host::{ContainerError, GuestHandle, GuestLauncher, LaunchedGuest};
use crate::container::runtime::RuntimeInfo;
use crate::remoting::{run_guest, GuestBootstrap, PluginLoader};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffer size of the in-memory stream between host and in-process guest.
const IN_PROCESS_BUFFER: usize = 256 * 1024;

pub type LoaderFactory = dyn Fn(&GuestBootstrap) -> Arc<dyn PluginLoader> + Send + Sync;

/// Launch and teardown counts, for leak checks.
#[derive(Debug, Default)]
pub struct LaunchCounters {
    launched: AtomicUsize,
    terminated: AtomicUsize,
}

impl LaunchCounters {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Guests launched and not yet terminated.
    pub fn live(&self) -> usize {
        self.launched().saturating_sub(self.terminated())
    }
}

// =============================================================================
// IN-PROCESS
// =============================================================================

pub struct InProcessLauncher {
    factory: Arc<LoaderFactory>,
    counters: Arc<LaunchCounters>,
}

impl InProcessLauncher {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&GuestBootstrap) -> Arc<dyn PluginLoader> + Send + Sync + 'static,
    {
        Self { factory: Arc::new(factory), counters: Arc::new(LaunchCounters::default()) }
    }

    pub fn counters(&self) -> Arc<LaunchCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl GuestLauncher for InProcessLauncher {
    fn connection(&self) -> &'static str {
        "memory"
    }

    async fn launch(
        &self,
        bootstrap: &GuestBootstrap,
        _runtime: Option<&RuntimeInfo>,
    ) -> Result<LaunchedGuest, ContainerError> {
        let (host_end, guest_end) = tokio::io::duplex(IN_PROCESS_BUFFER);
        let (guest_reader, guest_writer) = tokio::io::split(guest_end);
        let (host_reader, host_writer) = tokio::io::split(host_end);

        let loader = (self.factory)(bootstrap);
        let cancel = CancellationToken::new();
        let name = bootstrap.container_name.clone();
        let task = tokio::spawn(run_guest(bootstrap.clone(), guest_reader, guest_writer, loader, cancel.clone()));
        let task = tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("[InProcessLauncher] Guest {} exited with error: {}", name, e),
                Err(e) => tracing::warn!("[InProcessLauncher] Guest {} panicked: {}", name, e),
            }
        });

        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedGuest {
            reader: Box::new(host_reader),
            writer: Box::new(host_writer),
            handle: Box::new(InProcessGuest { cancel, task: Some(task), counters: Arc::clone(&self.counters) }),
        })
    }
}

struct InProcessGuest {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<LaunchCounters>,
}

#[async_trait]
impl GuestHandle for InProcessGuest {
    async fn terminate(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for InProcessGuest {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// CHILD PROCESS
// =============================================================================

/// Runs the guest as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), extra_args: Vec::new() }
    }

    /// Arguments placed before the bootstrap flags.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }
}

#[async_trait]
impl GuestLauncher for ProcessLauncher {
    fn connection(&self) -> &'static str {
        "stdio"
    }

    async fn launch(
        &self,
        bootstrap: &GuestBootstrap,
        runtime: Option<&RuntimeInfo>,
    ) -> Result<LaunchedGuest, ContainerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .args(bootstrap.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(runtime) = runtime {
            command.env("MAILROOM_RUNTIME", runtime.to_string());
            if let Some(path) = &runtime.path {
                command.env("MAILROOM_RUNTIME_DIR", path);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| ContainerError::LaunchFailed(format!("{}: {}", self.program.display(), e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ContainerError::LaunchFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContainerError::LaunchFailed("child stdout unavailable".to_string()))?;

        tracing::debug!(
            "[ProcessLauncher] Spawned {} (pid {:?}) for {}",
            self.program.display(),
            child.id(),
            bootstrap.container_name
        );
        Ok(LaunchedGuest { reader: Box::new(stdout), writer: Box::new(stdin), handle: Box::new(ProcessGuest { child }) })
    }
}

struct ProcessGuest {
    child: Child,
}

#[async_trait]
impl GuestHandle for ProcessGuest {
    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("[ProcessLauncher] kill failed: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => tracing::debug!("[ProcessLauncher] Guest exited with {}", status),
            Err(e) => tracing::warn!("[ProcessLauncher] Failed to reap guest: {}", e),
        }
    }
}
