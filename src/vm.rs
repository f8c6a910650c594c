//! Per-VM actor.
//!
//! One tokio task owns each microVM: its process handle, TAP, socket and
//! metrics paths, and current status. A single mpsc inbox serializes every
//! command, so per-VM operations are strictly ordered (boot precedes
//! warm_up precedes any update_tenant). All interaction goes through the
//! cloneable [`VmHandle`].
//!
//! State machine: `Init → Booting → (Running | Warm | Failed) → Stopped`.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};

use crate::driver::{HypervisorDriver, LaunchContext, VmProcess};
use crate::error::{Error, Result};
use crate::metrics;
use crate::net;
use crate::proxy::ProxyRegistry;

/// Tenant sentinel marking a VM as pool-owned. A VM carrying this tenant is
/// never registered with the proxy; `update_tenant` with a real tenant
/// promotes it.
pub const WARM_TENANT: &str = "__warm__";

/// Hard ceiling on one boot attempt, end to end.
const BOOT_DEADLINE: Duration = Duration::from_secs(60);

/// Ceiling on lifecycle priming (replica seeding can be slow).
const WARM_UP_DEADLINE: Duration = Duration::from_secs(30);

/// Lifecycle status of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Init,
    Booting,
    Running,
    Warm,
    Failed,
    Stopped,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Init => "init",
            VmStatus::Booting => "booting",
            VmStatus::Running => "running",
            VmStatus::Warm => "warm",
            VmStatus::Failed => "failed",
            VmStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of a VM's identity and current state.
#[derive(Debug, Clone, Serialize)]
pub struct VmInfo {
    pub vm_id: String,
    pub tenant: String,
    pub fingerprint: String,
    pub status: VmStatus,
    pub ip: String,
    pub port: u16,
    pub tap_dev: String,
}

enum Command {
    Info(oneshot::Sender<VmInfo>),
    Boot(oneshot::Sender<Result<VmInfo>>),
    WarmUp(oneshot::Sender<Result<()>>),
    UpdateTenant(String, oneshot::Sender<VmInfo>),
    Stop(oneshot::Sender<()>),
}

/// Cloneable handle to one VM actor.
#[derive(Clone)]
pub struct VmHandle {
    vm_id: String,
    fingerprint: String,
    tx: mpsc::Sender<Command>,
}

impl VmHandle {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether the actor task is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Snapshot current state. `None` if the actor has terminated.
    pub async fn info(&self) -> Option<VmInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Info(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Drive `Init → Booting → Running` (or `Warm`-eligible when the tenant
    /// is the warm sentinel). On failure the VM is `Failed` with cleanup
    /// already performed.
    pub async fn boot(&self) -> Result<VmInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Boot(reply))
            .await
            .map_err(|_| actor_gone(&self.vm_id))?;
        rx.await.map_err(|_| actor_gone(&self.vm_id))?
    }

    /// Run lifecycle priming; `Running → Warm` on success.
    pub async fn warm_up(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WarmUp(reply))
            .await
            .map_err(|_| actor_gone(&self.vm_id))?;
        rx.await.map_err(|_| actor_gone(&self.vm_id))?
    }

    /// Swap the tenant: deregister the old one from the proxy, register the
    /// new one, status → Running. `None` if the actor has terminated.
    pub async fn update_tenant(&self, tenant: &str) -> Option<VmInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateTenant(tenant.to_string(), reply))
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Normal termination: cleanup runs, status → Stopped, the actor exits.
    /// Idempotent from the caller's view; a VM that is already gone is fine.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn actor_gone(vm_id: &str) -> Error {
    Error::DriverUnreachable(format!("vm actor {} terminated", vm_id))
}

/// Spawn the actor task for one microVM and return its handle.
pub fn spawn(
    tenant: String,
    fingerprint: String,
    ctx: LaunchContext,
    driver: Arc<dyn HypervisorDriver>,
    proxy: Arc<dyn ProxyRegistry>,
) -> VmHandle {
    let vm_id = ctx.vm_id.clone();
    let (tx, rx) = mpsc::channel(16);
    let actor = VmActor {
        ctx,
        tenant,
        fingerprint: fingerprint.clone(),
        status: VmStatus::Init,
        process: VmProcess::detached(),
        registered_tenant: None,
        cleaned: false,
        driver,
        proxy,
    };
    tokio::spawn(actor.run(rx));

    VmHandle {
        vm_id,
        fingerprint,
        tx,
    }
}

struct VmActor {
    ctx: LaunchContext,
    tenant: String,
    fingerprint: String,
    status: VmStatus,
    process: VmProcess,
    /// Tenant currently registered with the proxy, if any.
    registered_tenant: Option<String>,
    cleaned: bool,
    driver: Arc<dyn HypervisorDriver>,
    proxy: Arc<dyn ProxyRegistry>,
}

impl VmActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Info(reply) => {
                    let _ = reply.send(self.info());
                }
                Command::Boot(reply) => {
                    let _ = reply.send(self.handle_boot().await);
                }
                Command::WarmUp(reply) => {
                    let _ = reply.send(self.handle_warm_up().await);
                }
                Command::UpdateTenant(tenant, reply) => {
                    self.handle_update_tenant(tenant).await;
                    let _ = reply.send(self.info());
                }
                Command::Stop(reply) => {
                    self.cleanup().await;
                    self.status = VmStatus::Stopped;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // All handles dropped without an explicit stop; release everything.
        self.cleanup().await;
        self.status = VmStatus::Stopped;
    }

    fn info(&self) -> VmInfo {
        VmInfo {
            vm_id: self.ctx.vm_id.clone(),
            tenant: self.tenant.clone(),
            fingerprint: self.fingerprint.clone(),
            status: self.status,
            ip: self.ctx.net.guest_ip.clone(),
            port: self.ctx.guest_port,
            tap_dev: self.ctx.net.tap_dev.clone(),
        }
    }

    async fn handle_boot(&mut self) -> Result<VmInfo> {
        if self.status != VmStatus::Init {
            // Booting twice is a pool bug, but the second caller still gets
            // a coherent answer.
            warn!(vm_id = %self.ctx.vm_id, status = %self.status, "boot on non-init vm");
            return Ok(self.info());
        }
        self.status = VmStatus::Booting;

        let booted = timeout(BOOT_DEADLINE, self.driver.boot(&self.ctx)).await;
        let result = match booted {
            Ok(result) => result,
            Err(_) => Err(Error::DriverUnreachable(format!(
                "boot of {} exceeded {:?}",
                self.ctx.vm_id, BOOT_DEADLINE
            ))),
        };

        match result {
            Ok(process) => {
                self.process = process;
                if self.tenant != WARM_TENANT {
                    self.proxy
                        .register(
                            &self.tenant,
                            &self.ctx.vm_id,
                            &self.ctx.net.guest_ip,
                            self.ctx.guest_port,
                        )
                        .await;
                    self.registered_tenant = Some(self.tenant.clone());
                }
                self.status = VmStatus::Running;
                metrics::global()
                    .vms_booted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(vm_id = %self.ctx.vm_id, tenant = %self.tenant, "vm running");
                Ok(self.info())
            }
            Err(e) => {
                error!(vm_id = %self.ctx.vm_id, error = %e, "boot failed");
                metrics::global()
                    .boot_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.cleanup().await;
                self.status = VmStatus::Failed;
                Err(e)
            }
        }
    }

    async fn handle_warm_up(&mut self) -> Result<()> {
        if self.status != VmStatus::Running {
            return Err(Error::warm_up(
                crate::error::FailStage::Priming,
                format!("warm_up on {} vm {}", self.status, self.ctx.vm_id),
            ));
        }

        let primed = timeout(WARM_UP_DEADLINE, self.driver.warm_up(&self.ctx)).await;
        let result = match primed {
            Ok(result) => result,
            Err(_) => Err(Error::warm_up(
                crate::error::FailStage::Priming,
                format!("warm-up of {} exceeded {:?}", self.ctx.vm_id, WARM_UP_DEADLINE),
            )),
        };

        match result {
            Ok(()) => {
                self.status = VmStatus::Warm;
                metrics::global()
                    .vms_warmed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // The guest is still running; it just is not warm.
                warn!(vm_id = %self.ctx.vm_id, error = %e, "warm-up failed");
                metrics::global()
                    .warm_up_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn handle_update_tenant(&mut self, tenant: String) {
        if let Some(old) = self.registered_tenant.take() {
            self.proxy.deregister(&old, &self.ctx.vm_id).await;
        }
        self.tenant = tenant;
        if self.tenant != WARM_TENANT {
            self.proxy
                .register(
                    &self.tenant,
                    &self.ctx.vm_id,
                    &self.ctx.net.guest_ip,
                    self.ctx.guest_port,
                )
                .await;
            self.registered_tenant = Some(self.tenant.clone());
        }
        self.status = VmStatus::Running;
        info!(vm_id = %self.ctx.vm_id, tenant = %self.tenant, "tenant updated");
    }

    /// Release every host resource this VM owns. Idempotent; never raises.
    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if let Some(tenant) = self.registered_tenant.take() {
            self.proxy.deregister(&tenant, &self.ctx.vm_id).await;
        }

        self.driver.stop(&self.ctx, &mut self.process).await;
        // stop() reaps the process; a second kill is a no-op safeguard.
        self.process.kill();

        net::delete_tap(&self.ctx.net.tap_dev);

        for path in self.ctx.stale_files() {
            let _ = std::fs::remove_file(&path);
        }

        metrics::global()
            .vms_stopped
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(vm_id = %self.ctx.vm_id, "vm resources released");
    }
}
