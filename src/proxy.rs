//! Load-balancer registration hook.
//!
//! The proxy itself is an external collaborator; the core only needs
//! register/deregister. A VM is exposed iff it is Running under a real job
//! tenant; warm VMs never reach the proxy.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Narrow interface the core drives.
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    /// Expose a VM to the load balancer under a tenant.
    async fn register(&self, tenant: &str, vm_id: &str, ip: &str, port: u16);

    /// Withdraw a VM from the load balancer.
    async fn deregister(&self, tenant: &str, vm_id: &str);
}

/// Default registry when no load balancer is wired up: log and move on.
#[derive(Debug, Default)]
pub struct LogProxy;

#[async_trait]
impl ProxyRegistry for LogProxy {
    async fn register(&self, tenant: &str, vm_id: &str, ip: &str, port: u16) {
        info!(tenant, vm_id, ip, port, "proxy register");
    }

    async fn deregister(&self, tenant: &str, vm_id: &str) {
        info!(tenant, vm_id, "proxy deregister");
    }
}

/// One observed proxy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Register { tenant: String, vm_id: String },
    Deregister { tenant: String, vm_id: String },
}

/// Test registry recording every call, so tests can assert the
/// exactly-one-register/one-deregister invariant.
#[derive(Debug, Default)]
pub struct RecordingProxy {
    events: Mutex<Vec<ProxyEvent>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().expect("proxy event lock").clone()
    }

    pub fn registrations_for(&self, vm_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProxyEvent::Register { vm_id: id, .. } if id == vm_id))
            .count()
    }

    pub fn deregistrations_for(&self, vm_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProxyEvent::Deregister { vm_id: id, .. } if id == vm_id))
            .count()
    }
}

#[async_trait]
impl ProxyRegistry for RecordingProxy {
    async fn register(&self, tenant: &str, vm_id: &str, _ip: &str, _port: u16) {
        self.events.lock().expect("proxy event lock").push(ProxyEvent::Register {
            tenant: tenant.to_string(),
            vm_id: vm_id.to_string(),
        });
    }

    async fn deregister(&self, tenant: &str, vm_id: &str) {
        self.events.lock().expect("proxy event lock").push(ProxyEvent::Deregister {
            tenant: tenant.to_string(),
            vm_id: vm_id.to_string(),
        });
    }
}
