//! Launch specifications for microVMs.
//!
//! A [`VmSpec`] is an immutable bundle describing how to launch one microVM:
//! kernel, rootfs, command, environment, resources, lifecycle class, and an
//! optional warm-pool policy. Specs are value objects; two specs are
//! equivalent iff they produce the same fingerprint.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle class of a workload. Governs how much pre-warming the driver
/// performs inside a booted VM before it is handed to a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Long-lived service: heaviest warm-up (replica seeding plus
    /// change-feed subscription).
    Service,
    /// Background daemon: lighter warm-up.
    Daemon,
    /// One-shot job: minimal or no warm-up.
    #[default]
    Job,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Service => write!(f, "service"),
            Lifecycle::Daemon => write!(f, "daemon"),
            Lifecycle::Job => write!(f, "job"),
        }
    }
}

/// CPU and memory sizing for one microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of vCPUs (must be positive).
    pub vcpu: u32,
    /// Guest memory in MiB (must be positive).
    pub mem_mb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self { vcpu: 1, mem_mb: 256 }
    }
}

/// Warm-pool sizing declared on a spec. An effective `min > 0` asks the
/// reconciler to keep a pre-booted VM ready for this spec's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPoolPolicy {
    /// Minimum warm VMs to keep ready; absent falls back to the operator
    /// default (`FC_WARM`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    /// Upper bound; absent means `max = min`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl WarmPoolPolicy {
    /// Effective minimum, with the operator fallback applied.
    pub fn effective_min(&self, default_min: u32) -> u32 {
        self.min.unwrap_or(default_min)
    }

    /// Effective upper bound (`max` falls back to the effective minimum).
    pub fn effective_max(&self, default_min: u32) -> u32 {
        self.max.unwrap_or_else(|| self.effective_min(default_min))
    }
}

/// Immutable launch description of one microVM.
///
/// Unknown top-level keys are preserved in `extra` so operators can carry
/// forward-compatible metadata; extras participate in the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Path to the kernel image, opaque to the control plane.
    pub kernel: String,
    /// Path to the root filesystem image.
    pub rootfs: String,
    /// Guest init command.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Guest environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPoolPolicy>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl VmSpec {
    /// Minimal spec for the given kernel and rootfs.
    pub fn new(kernel: impl Into<String>, rootfs: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            rootfs: rootfs.into(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            resources: Resources::default(),
            lifecycle: Lifecycle::default(),
            warm_pool: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the lifecycle class.
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Declare a warm-pool policy with an explicit minimum.
    pub fn with_warm_pool(mut self, min: u32, max: Option<u32>) -> Self {
        self.warm_pool = Some(WarmPoolPolicy { min: Some(min), max });
        self
    }

    /// Set resource sizing.
    pub fn with_resources(mut self, vcpu: u32, mem_mb: u64) -> Self {
        self.resources = Resources { vcpu, mem_mb };
        self
    }

    /// Whether the reconciler should keep a warm VM for this spec.
    /// `default_min` fills in for a warm pool declared without sizing.
    pub fn wants_warm(&self, default_min: u32) -> bool {
        self.warm_pool
            .as_ref()
            .is_some_and(|w| w.effective_min(default_min) > 0)
    }

    /// Validate semantic invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.kernel.is_empty() {
            bail!("spec: kernel path must not be empty");
        }
        if self.rootfs.is_empty() {
            bail!("spec: rootfs path must not be empty");
        }
        if self.resources.vcpu == 0 {
            bail!("spec: vcpu must be positive");
        }
        if self.resources.mem_mb == 0 {
            bail!("spec: mem_mb must be positive");
        }
        if let Some(warm) = &self.warm_pool {
            if let Some(max) = warm.max
                && max == 0
            {
                bail!("spec: warm_pool.max must be positive");
            }
            if let (Some(min), Some(max)) = (warm.min, warm.max)
                && min > max
            {
                bail!("spec: warm_pool.min ({}) exceeds max ({})", min, max);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_spec() {
        let json = r#"{
            "kernel": "/images/vmlinux",
            "rootfs": "/images/base.ext4"
        }"#;
        let spec: VmSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kernel, "/images/vmlinux");
        assert_eq!(spec.lifecycle, Lifecycle::Job);
        assert_eq!(spec.resources.vcpu, 1);
        assert!(spec.warm_pool.is_none());
        assert!(!spec.wants_warm(1));
        spec.validate().unwrap();
    }

    #[test]
    fn test_parse_full_spec() {
        let json = r#"{
            "kernel": "/images/vmlinux",
            "rootfs": "/images/web.ext4",
            "cmd": ["/bin/web", "--port", "4000"],
            "env": {"MIX_ENV": "prod", "PORT": "4000"},
            "resources": {"vcpu": 2, "mem_mb": 512},
            "lifecycle": "service",
            "warm_pool": {"min": 1, "max": 3},
            "region": "eu-west"
        }"#;
        let spec: VmSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.lifecycle, Lifecycle::Service);
        assert_eq!(spec.cmd.len(), 3);
        assert_eq!(spec.env.get("PORT"), Some(&"4000".to_string()));
        assert_eq!(spec.warm_pool.as_ref().unwrap().min, Some(1));
        assert_eq!(spec.warm_pool.as_ref().unwrap().effective_max(1), 3);
        assert!(spec.wants_warm(1));
        // Unknown keys land in extra, not on the floor.
        assert_eq!(
            spec.extra.get("region"),
            Some(&serde_json::Value::String("eu-west".into()))
        );
        spec.validate().unwrap();
    }

    #[test]
    fn test_warm_pool_max_defaults_to_min() {
        let policy = WarmPoolPolicy {
            min: Some(2),
            max: None,
        };
        assert_eq!(policy.effective_max(1), 2);
    }

    #[test]
    fn test_unsized_warm_pool_uses_operator_default() {
        let json = r#"{
            "kernel": "/k",
            "rootfs": "/r",
            "warm_pool": {}
        }"#;
        let spec: VmSpec = serde_json::from_str(json).unwrap();
        let policy = spec.warm_pool.as_ref().unwrap();
        assert_eq!(policy.min, None);
        assert_eq!(policy.effective_min(2), 2);
        assert_eq!(policy.effective_max(2), 2);
        assert!(spec.wants_warm(1));
        assert!(!spec.wants_warm(0));
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_vcpu() {
        let mut spec = VmSpec::new("/k", "/r");
        spec.resources.vcpu = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_min_over_max() {
        let spec = VmSpec::new("/k", "/r").with_warm_pool(5, Some(2));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        assert!(VmSpec::new("", "/r").validate().is_err());
        assert!(VmSpec::new("/k", "").validate().is_err());
    }

    #[test]
    fn test_lifecycle_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Lifecycle::Service).unwrap(), "\"service\"");
        let parsed: Lifecycle = serde_json::from_str("\"daemon\"").unwrap();
        assert_eq!(parsed, Lifecycle::Daemon);
    }
}
