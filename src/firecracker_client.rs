//! HTTP client for the Firecracker API over its Unix socket.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::net::UnixStream;
use tracing::warn;

use crate::error::{Error, FailStage, Result};

/// Error payload Firecracker attaches to failed (and sometimes successful)
/// responses.
#[derive(Debug, Deserialize)]
struct ApiFault {
    fault_message: Option<String>,
}

/// Machine sizing, PUT to `/machine-config` before boot.
#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
}

/// Kernel and boot arguments, PUT to `/boot-source`.
#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// Block device, PUT to `/drives/{id}`.
#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// Network interface, PUT to `/network-interfaces/{id}`.
#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: Option<String>,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct InstanceAction {
    action_type: String,
}

/// Client for one Firecracker process's API socket.
pub struct FirecrackerClient {
    socket_path: String,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Configure machine sizing.
    pub async fn set_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config, FailStage::Configure).await
    }

    /// Configure the kernel and its command line.
    pub async fn set_boot_source(&self, boot_source: &BootSource) -> Result<()> {
        self.put("/boot-source", boot_source, FailStage::Configure).await
    }

    /// Attach a block device.
    pub async fn set_drive(&self, drive: &Drive) -> Result<()> {
        let path = format!("/drives/{}", drive.drive_id);
        self.put(&path, drive, FailStage::Configure).await
    }

    /// Attach a network interface.
    pub async fn set_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        let path = format!("/network-interfaces/{}", iface.iface_id);
        self.put(&path, iface, FailStage::Configure).await
    }

    /// Kick off execution of the configured VM.
    pub async fn start_instance(&self) -> Result<()> {
        let action = InstanceAction {
            action_type: "InstanceStart".to_string(),
        };
        self.put("/actions", &action, FailStage::InstanceStart).await
    }

    /// Ask the guest to shut down via Ctrl+Alt+Del. Best-effort; a VM that
    /// is already gone is not an error.
    pub async fn send_ctrl_alt_del(&self) {
        let action = InstanceAction {
            action_type: "SendCtrlAltDel".to_string(),
        };
        if let Err(e) = self.put("/actions", &action, FailStage::InstanceStart).await {
            warn!(socket = %self.socket_path, error = %e, "graceful shutdown request failed");
        }
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T, stage: FailStage) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::DriverUnreachable(format!("connect {}: {}", self.socket_path, e))
        })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| Error::DriverUnreachable(format!("handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = ?e, "firecracker api connection error");
            }
        });

        let body_bytes = serde_json::to_vec(body)
            .map_err(|e| Error::boot(stage, format!("encoding {} body: {}", path, e)))?;
        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("http://localhost{}", path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| Error::boot(stage, format!("building {} request: {}", path, e)))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| Error::DriverUnreachable(format!("PUT {}: {}", path, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::DriverUnreachable(format!("reading {} response: {}", path, e)))?
            .to_bytes();

        if !status.is_success() {
            let detail = serde_json::from_slice::<ApiFault>(&bytes)
                .ok()
                .and_then(|f| f.fault_message)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).to_string());
            return Err(Error::boot(stage, format!("{} ({}): {}", path, status, detail)));
        }

        // Some endpoints answer 200 with a fault_message in the body.
        if !bytes.is_empty()
            && let Ok(fault) = serde_json::from_slice::<ApiFault>(&bytes)
            && let Some(msg) = fault.fault_message
        {
            return Err(Error::boot(stage, format!("{}: {}", path, msg)));
        }

        Ok(())
    }
}
