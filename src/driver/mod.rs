//! Hypervisor backend abstraction.
//!
//! The control plane drives microVMs through the [`HypervisorDriver`]
//! capability trait and never references a concrete backend:
//! - Firecracker (HTTP-over-UDS configuration)
//! - Cloud Hypervisor (CLI-args configuration, auto-start)
//! - Mock (in-memory, for the test suite)

pub mod cloud_hypervisor;
pub mod firecracker;
pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::Result;
use crate::net::GuestNet;
use crate::spec::VmSpec;

pub use cloud_hypervisor::CloudHypervisorDriver;
pub use firecracker::FirecrackerDriver;
pub use mock::MockDriver;

/// Backend identifier, selected via `FC_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Firecracker,
    CloudHypervisor,
    Mock,
}

impl BackendType {
    /// Default backend for the current OS: Firecracker where KVM lives,
    /// Cloud Hypervisor elsewhere.
    pub fn default_for_os() -> Self {
        if cfg!(target_os = "linux") {
            BackendType::Firecracker
        } else {
            BackendType::CloudHypervisor
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Firecracker => write!(f, "firecracker"),
            BackendType::CloudHypervisor => write!(f, "cloud_hypervisor"),
            BackendType::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "firecracker" => Ok(BackendType::Firecracker),
            "cloud_hypervisor" | "cloud-hypervisor" => Ok(BackendType::CloudHypervisor),
            "mock" => Ok(BackendType::Mock),
            _ => Err(format!(
                "Unknown backend '{}'. Valid options: firecracker, cloud_hypervisor, mock",
                s
            )),
        }
    }
}

/// Everything a driver needs to realize one microVM. Owned by the VM actor;
/// immutable for the VM's lifetime.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub vm_id: String,
    pub spec: VmSpec,
    pub net: GuestNet,
    /// Backend API socket path; a `.old` sibling may linger from a crashed
    /// predecessor and is reaped before reuse.
    pub api_socket: PathBuf,
    /// Backend metrics file path.
    pub metrics_path: PathBuf,
    /// Port the guest workload (and its health agent) listens on.
    pub guest_port: u16,
}

impl LaunchContext {
    pub fn new(
        vm_id: String,
        spec: VmSpec,
        net: GuestNet,
        run_dir: &std::path::Path,
        guest_port: u16,
    ) -> Self {
        let api_socket = run_dir.join(format!("vmplane-{}.sock", vm_id));
        let metrics_path = run_dir.join(format!("vmplane-{}-metrics.json", vm_id));
        Self {
            vm_id,
            spec,
            net,
            api_socket,
            metrics_path,
            guest_port,
        }
    }

    /// All host files this VM may leave behind, including `.old` leftovers.
    pub fn stale_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::with_capacity(4);
        for path in [&self.api_socket, &self.metrics_path] {
            files.push(path.clone());
            let mut old = path.as_os_str().to_owned();
            old.push(".old");
            files.push(PathBuf::from(old));
        }
        files
    }
}

/// Handle to the backend OS process realizing one microVM.
///
/// The mock backend has no process; a detached handle is always "dead" and
/// kill is a no-op.
#[derive(Debug, Default)]
pub struct VmProcess {
    child: Option<Child>,
}

impl VmProcess {
    pub fn from_child(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Handle with no backing process (mock backend).
    pub fn detached() -> Self {
        Self { child: None }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Whether the backend process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Forcefully kill the backend process and reap it. Idempotent.
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Capability interface every backend implements.
///
/// `boot` and `warm_up` are long (multi-second) blocking operations; callers
/// must not hold shared locks across them. `stop` never fails observably.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Create the TAP, spawn and configure the backend, begin execution,
    /// and gate on the guest health endpoint. Returns the owned process.
    async fn boot(&self, ctx: &LaunchContext) -> Result<VmProcess>;

    /// Lifecycle-class-specific priming inside an already booted guest.
    async fn warm_up(&self, ctx: &LaunchContext) -> Result<()>;

    /// Terminate the backend process. Unreachable processes are logged and
    /// reaped; this never fails.
    async fn stop(&self, ctx: &LaunchContext, process: &mut VmProcess);
}

/// Build the driver selected by the settings.
pub fn create_driver(settings: &Settings) -> Arc<dyn HypervisorDriver> {
    match settings.backend {
        BackendType::Firecracker => Arc::new(FirecrackerDriver::new(settings)),
        BackendType::CloudHypervisor => Arc::new(CloudHypervisorDriver::new(settings)),
        BackendType::Mock => Arc::new(MockDriver::new()),
    }
}

/// Whether the selected backend's binary can be found on this host.
pub fn backend_available(backend: BackendType) -> bool {
    match backend {
        BackendType::Firecracker => firecracker::firecracker_available(),
        BackendType::CloudHypervisor => cloud_hypervisor::cloud_hypervisor_available(),
        BackendType::Mock => true,
    }
}
