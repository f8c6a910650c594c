//! Cloud Hypervisor backend: everything is passed as CLI arguments and the
//! VM starts executing immediately, so there is no configure phase.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, FailStage, Result};
use crate::health::GuestClient;
use crate::net;

use super::{HypervisorDriver, LaunchContext, VmProcess};

/// Check whether a cloud-hypervisor binary can be found on this host.
pub fn cloud_hypervisor_available() -> bool {
    find_cloud_hypervisor().is_ok()
}

fn find_cloud_hypervisor() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CLOUD_HYPERVISOR_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    let locations = [
        "/usr/local/bin/cloud-hypervisor",
        "/usr/bin/cloud-hypervisor",
        "./cloud-hypervisor",
    ];
    for loc in locations {
        let path = PathBuf::from(loc);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(output) = Command::new("which").arg("cloud-hypervisor").output()
        && output.status.success()
    {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(Error::boot(
        FailStage::Spawn,
        "cloud-hypervisor binary not found; install it or set CLOUD_HYPERVISOR_BIN",
    ))
}

pub struct CloudHypervisorDriver {
    bridge: String,
    gateway: String,
    guest_port: u16,
    health_timeout: Duration,
}

impl CloudHypervisorDriver {
    pub fn new(settings: &Settings) -> Self {
        let gateway = settings
            .bridge_cidr
            .split('/')
            .next()
            .unwrap_or("172.16.0.1")
            .to_string();
        Self {
            bridge: settings.bridge.clone(),
            gateway,
            guest_port: settings.guest_port,
            health_timeout: Duration::from_secs(settings.health_timeout_secs),
        }
    }

    fn cmdline(&self, ctx: &LaunchContext) -> String {
        let mut cmdline = format!(
            "console=ttyS0 reboot=k panic=1 ip={}::{}:255.255.0.0::eth0:off",
            ctx.net.guest_ip, self.gateway
        );
        if !ctx.spec.cmd.is_empty() {
            cmdline.push_str(&format!(" init={}", ctx.spec.cmd[0]));
            for arg in &ctx.spec.cmd[1..] {
                cmdline.push(' ');
                cmdline.push_str(arg);
            }
        }
        for (key, value) in &ctx.spec.env {
            cmdline.push_str(&format!(" {}={}", key, value));
        }
        cmdline
    }
}

#[async_trait]
impl HypervisorDriver for CloudHypervisorDriver {
    async fn boot(&self, ctx: &LaunchContext) -> Result<VmProcess> {
        for path in ctx.stale_files() {
            let _ = std::fs::remove_file(&path);
        }

        net::create_tap(&ctx.net.tap_dev, &self.bridge)
            .map_err(|e| Error::boot(FailStage::Tap, e.to_string()))?;

        let binary = match find_cloud_hypervisor() {
            Ok(binary) => binary,
            Err(e) => {
                net::delete_tap(&ctx.net.tap_dev);
                return Err(e);
            }
        };

        let spawned = Command::new(&binary)
            .arg("--api-socket")
            .arg(&ctx.api_socket)
            .arg("--kernel")
            .arg(&ctx.spec.kernel)
            .arg("--disk")
            .arg(format!("path={}", ctx.spec.rootfs))
            .arg("--cpus")
            .arg(format!("boot={}", ctx.spec.resources.vcpu))
            .arg("--memory")
            .arg(format!("size={}M", ctx.spec.resources.mem_mb))
            .arg("--net")
            .arg(format!(
                "tap={},mac={}",
                ctx.net.tap_dev, ctx.net.guest_mac
            ))
            .arg("--cmdline")
            .arg(self.cmdline(ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut process = match spawned {
            Ok(child) => VmProcess::from_child(child),
            Err(e) => {
                net::delete_tap(&ctx.net.tap_dev);
                return Err(Error::boot(
                    FailStage::Spawn,
                    format!("{}: {}", binary.display(), e),
                ));
            }
        };

        let guest = GuestClient::new(&ctx.net.guest_ip, self.guest_port);
        if let Err(e) = guest.wait_healthy(self.health_timeout).await {
            process.kill();
            net::delete_tap(&ctx.net.tap_dev);
            for path in ctx.stale_files() {
                let _ = std::fs::remove_file(&path);
            }
            return Err(e);
        }

        info!(vm_id = %ctx.vm_id, ip = %ctx.net.guest_ip, "cloud-hypervisor vm booted");
        Ok(process)
    }

    async fn warm_up(&self, ctx: &LaunchContext) -> Result<()> {
        let guest = GuestClient::new(&ctx.net.guest_ip, self.guest_port);
        guest.prime(ctx.spec.lifecycle).await
    }

    async fn stop(&self, ctx: &LaunchContext, process: &mut VmProcess) {
        if process.is_alive() {
            warn!(vm_id = %ctx.vm_id, pid = ?process.pid(), "killing cloud-hypervisor process");
        }
        process.kill();
    }
}
