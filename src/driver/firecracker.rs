//! Firecracker backend: spawn the VMM, configure it over its API socket,
//! and gate boot on guest health.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Error, FailStage, Result};
use crate::firecracker_client::{
    BootSource, Drive, FirecrackerClient, MachineConfig, NetworkInterface,
};
use crate::health::GuestClient;
use crate::net;

use super::{HypervisorDriver, LaunchContext, VmProcess};

/// Check whether a Firecracker binary can be found on this host.
pub fn firecracker_available() -> bool {
    find_firecracker().is_ok()
}

fn find_firecracker() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FIRECRACKER_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    let locations = [
        "/usr/local/bin/firecracker",
        "/usr/bin/firecracker",
        "./firecracker",
    ];
    for loc in locations {
        let path = PathBuf::from(loc);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(output) = Command::new("which").arg("firecracker").output()
        && output.status.success()
    {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(Error::boot(
        FailStage::Spawn,
        "firecracker binary not found; install it or set FIRECRACKER_BIN",
    ))
}

pub struct FirecrackerDriver {
    bridge: String,
    /// Bridge address, handed to the guest as its default gateway.
    gateway: String,
    guest_port: u16,
    health_timeout: Duration,
}

impl FirecrackerDriver {
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

    fn boot_args(&self, ctx: &LaunchContext) -> String {
        let mut args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.0.0::eth0:off",
            ctx.net.guest_ip, self.gateway
        );
        if !ctx.spec.cmd.is_empty() {
            args.push_str(&format!(" init={}", ctx.spec.cmd[0]));
            for arg in &ctx.spec.cmd[1..] {
                args.push(' ');
                args.push_str(arg);
            }
        }
        for (key, value) in &ctx.spec.env {
            args.push_str(&format!(" {}={}", key, value));
        }
        args
    }

    async fn configure(&self, ctx: &LaunchContext) -> Result<()> {
        let client = FirecrackerClient::new(&ctx.api_socket);

        client
            .set_machine_config(&MachineConfig {
                vcpu_count: ctx.spec.resources.vcpu,
                mem_size_mib: ctx.spec.resources.mem_mb,
            })
            .await?;
        client
            .set_boot_source(&BootSource {
                kernel_image_path: ctx.spec.kernel.clone(),
                boot_args: self.boot_args(ctx),
            })
            .await?;
        client
            .set_drive(&Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: ctx.spec.rootfs.clone(),
                is_root_device: true,
                is_read_only: false,
            })
            .await?;
        client
            .set_network_interface(&NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: Some(ctx.net.guest_mac.clone()),
                host_dev_name: ctx.net.tap_dev.clone(),
            })
            .await?;
        client.start_instance().await
    }

    /// Undo a partial boot so the failed attempt leaves nothing behind.
    fn abort_boot(&self, ctx: &LaunchContext, process: &mut VmProcess) {
        process.kill();
        net::delete_tap(&ctx.net.tap_dev);
        reap_stale_files(ctx);
    }
}

/// Remove leftover socket/metrics files (including `.old`) before reusing a
/// vm id. Orphans from a crashed predecessor are reaped here.
fn reap_stale_files(ctx: &LaunchContext) {
    for path in ctx.stale_files() {
        if path.exists() {
            debug!(path = %path.display(), "removing stale file");
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn boot(&self, ctx: &LaunchContext) -> Result<VmProcess> {
        reap_stale_files(ctx);

        net::create_tap(&ctx.net.tap_dev, &self.bridge)
            .map_err(|e| Error::boot(FailStage::Tap, e.to_string()))?;

        let binary = match find_firecracker() {
            Ok(binary) => binary,
            Err(e) => {
                net::delete_tap(&ctx.net.tap_dev);
                return Err(e);
            }
        };

        let spawned = Command::new(&binary)
            .arg("--api-sock")
            .arg(&ctx.api_socket)
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

        // The API socket appears shortly after spawn; give it five seconds.
        let mut socket_ready = false;
        for _ in 0..50 {
            if ctx.api_socket.exists() {
                socket_ready = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        if !socket_ready {
            self.abort_boot(ctx, &mut process);
            return Err(Error::DriverUnreachable(format!(
                "api socket {} not available after 5s",
                ctx.api_socket.display()
            )));
        }

        if let Err(e) = self.configure(ctx).await {
            self.abort_boot(ctx, &mut process);
            return Err(e);
        }

        let guest = GuestClient::new(&ctx.net.guest_ip, self.guest_port);
        if let Err(e) = guest.wait_healthy(self.health_timeout).await {
            self.abort_boot(ctx, &mut process);
            return Err(e);
        }

        info!(vm_id = %ctx.vm_id, ip = %ctx.net.guest_ip, "firecracker vm booted");
        Ok(process)
    }

    async fn warm_up(&self, ctx: &LaunchContext) -> Result<()> {
        let guest = GuestClient::new(&ctx.net.guest_ip, self.guest_port);
        guest.prime(ctx.spec.lifecycle).await
    }

    async fn stop(&self, ctx: &LaunchContext, process: &mut VmProcess) {
        if ctx.api_socket.exists() {
            let client = FirecrackerClient::new(&ctx.api_socket);
            client.send_ctrl_alt_del().await;
            // Give the guest a moment to shut down gracefully.
            sleep(Duration::from_millis(500)).await;
        }
        if process.is_alive() {
            warn!(vm_id = %ctx.vm_id, pid = ?process.pid(), "forcefully killing vm process");
        }
        process.kill();
    }
}
