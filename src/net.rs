//! Host networking for microVMs: TAP devices and guest addressing.
//!
//! Bridge/NAT setup is host provisioning and lives outside the control
//! plane; this module only creates and deletes the per-VM TAP and hands out
//! guest addresses from the configured subnet.

use anyhow::{Context, Result, bail};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Network identity assigned to one microVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNet {
    /// Host-side TAP device name (fits in IFNAMSIZ).
    pub tap_dev: String,
    /// Guest IPv4 address.
    pub guest_ip: String,
    /// Guest MAC, derived from the IP so it is stable per address.
    pub guest_mac: String,
}

/// Hands out TAP names and guest IPs from `<prefix>.x.y`.
///
/// Offsets start at 2 (.0.0 is the network, .0.1 the bridge gateway) and are
/// never reused within one process lifetime; pool/warm state is not
/// persisted, so a restart starts fresh anyway.
pub struct NetAllocator {
    subnet_prefix: String,
    next: AtomicU32,
}

impl NetAllocator {
    pub fn new(subnet_prefix: impl Into<String>) -> Self {
        Self {
            subnet_prefix: subnet_prefix.into(),
            next: AtomicU32::new(2),
        }
    }

    /// Allocate the next guest network identity.
    pub fn allocate(&self) -> GuestNet {
        let offset = self.next.fetch_add(1, Ordering::SeqCst);
        let third = offset / 250;
        let fourth = 2 + offset % 250;
        let guest_ip = format!("{}.{}.{}", self.subnet_prefix, third, fourth);
        GuestNet {
            tap_dev: format!("vmtap{}", offset),
            guest_mac: guest_mac_for_ip(&guest_ip),
            guest_ip,
        }
    }
}

/// Derive a locally administered MAC from the guest IP's last two octets.
pub fn guest_mac_for_ip(ip: &str) -> String {
    let octets: Vec<u8> = ip.split('.').filter_map(|o| o.parse().ok()).collect();
    let (c, d) = match octets.as_slice() {
        [_, _, c, d] => (*c, *d),
        _ => (0, 0),
    };
    format!("06:00:AC:10:{:02X}:{:02X}", c, d)
}

/// Create a TAP device and attach it to the host bridge.
pub fn create_tap(tap_dev: &str, bridge: &str) -> Result<()> {
    run_ip(&["tuntap", "add", "dev", tap_dev, "mode", "tap"])
        .with_context(|| format!("creating tap {}", tap_dev))?;
    run_ip(&["link", "set", tap_dev, "master", bridge])
        .with_context(|| format!("attaching {} to bridge {}", tap_dev, bridge))?;
    run_ip(&["link", "set", tap_dev, "up"]).with_context(|| format!("bringing up {}", tap_dev))?;
    Ok(())
}

/// Delete a TAP device. Best-effort: a missing device is not an error.
pub fn delete_tap(tap_dev: &str) {
    if let Err(e) = run_ip(&["link", "del", tap_dev]) {
        tracing::debug!(tap = tap_dev, error = %e, "tap deletion skipped");
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("running ip")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}
