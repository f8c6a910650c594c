//! Runtime settings, read from `FC_*` environment variables.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::driver::BackendType;

fn default_kernel() -> PathBuf {
    PathBuf::from("/var/lib/vmplane/images/vmlinux")
}

fn default_rootfs() -> PathBuf {
    PathBuf::from("/var/lib/vmplane/images/base.ext4")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vmplane/desired.db")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Control-plane settings with environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Hypervisor backend (`FC_BACKEND`).
    pub backend: BackendType,
    /// Default kernel image (`FC_KERNEL`); specs carry their own paths, this
    /// is the fallback handed to external tooling.
    pub kernel_path: PathBuf,
    /// Default rootfs image (`FC_ROOTFS`).
    pub rootfs_path: PathBuf,
    /// Fallback `warm_pool.min` for specs that declare a warm pool without
    /// sizing it (`FC_WARM`).
    pub warm_target: u32,
    /// Upper bound on concurrently supervised VMs (`FC_MAX`).
    pub max_vms: usize,
    /// Host bridge the TAPs attach to (`FC_BRIDGE`).
    pub bridge: String,
    /// Bridge address in CIDR form (`FC_BRIDGE_CIDR`).
    pub bridge_cidr: String,
    /// First two octets of the guest subnet (`FC_SUBNET_PREFIX`).
    pub subnet_prefix: String,
    /// Outbound interface used for NAT (`FC_OUT_IFACE`).
    pub out_iface: String,
    /// Port the guest workload listens on (`FC_GUEST_PORT`).
    pub guest_port: u16,
    /// Port the control-plane HTTP API binds (`FC_PORT`).
    pub api_port: u16,
    /// SQLite file backing the desired-state store (`VMPLANE_DB`).
    pub db_path: PathBuf,
    /// Declarative desired-state file loaded at startup
    /// (`VMPLANE_DESIRED_FILE`), absent means start empty.
    pub desired_file: Option<PathBuf>,
    /// Directory for API sockets and metrics files.
    pub run_dir: PathBuf,
    /// Guest health-poll deadline in seconds (`FC_HEALTH_TIMEOUT`).
    pub health_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendType::default_for_os(),
            kernel_path: default_kernel(),
            rootfs_path: default_rootfs(),
            warm_target: 1,
            max_vms: 32,
            bridge: "fcbr0".to_string(),
            bridge_cidr: "172.16.0.1/16".to_string(),
            subnet_prefix: "172.16".to_string(),
            out_iface: "eth0".to_string(),
            guest_port: 4000,
            api_port: 4001,
            db_path: default_db_path(),
            desired_file: None,
            run_dir: default_run_dir(),
            health_timeout_secs: 15,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(backend) = std::env::var("FC_BACKEND") {
            settings.backend = backend
                .parse()
                .map_err(|e: String| anyhow::anyhow!("FC_BACKEND: {}", e))?;
        }
        if let Ok(kernel) = std::env::var("FC_KERNEL") {
            settings.kernel_path = PathBuf::from(kernel);
        }
        if let Ok(rootfs) = std::env::var("FC_ROOTFS") {
            settings.rootfs_path = PathBuf::from(rootfs);
        }
        if let Ok(warm) = std::env::var("FC_WARM") {
            settings.warm_target = warm.parse().context("FC_WARM: expected an integer")?;
        }
        if let Ok(max) = std::env::var("FC_MAX") {
            settings.max_vms = max.parse().context("FC_MAX: expected an integer")?;
        }
        if let Ok(bridge) = std::env::var("FC_BRIDGE") {
            settings.bridge = bridge;
        }
        if let Ok(cidr) = std::env::var("FC_BRIDGE_CIDR") {
            settings.bridge_cidr = cidr;
        }
        if let Ok(prefix) = std::env::var("FC_SUBNET_PREFIX") {
            settings.subnet_prefix = prefix;
        }
        if let Ok(iface) = std::env::var("FC_OUT_IFACE") {
            settings.out_iface = iface;
        }
        if let Ok(port) = std::env::var("FC_GUEST_PORT") {
            settings.guest_port = port.parse().context("FC_GUEST_PORT: expected a port")?;
        }
        if let Ok(port) = std::env::var("FC_PORT") {
            settings.api_port = port.parse().context("FC_PORT: expected a port")?;
        }
        if let Ok(db) = std::env::var("VMPLANE_DB") {
            settings.db_path = PathBuf::from(db);
        }
        if let Ok(file) = std::env::var("VMPLANE_DESIRED_FILE") {
            settings.desired_file = Some(PathBuf::from(file));
        }
        if let Ok(timeout) = std::env::var("FC_HEALTH_TIMEOUT") {
            settings.health_timeout_secs = timeout
                .parse()
                .context("FC_HEALTH_TIMEOUT: expected seconds")?;
        }

        Ok(settings)
    }
}
