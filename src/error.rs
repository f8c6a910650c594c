//! Error kinds surfaced by the control-plane core.
//!
//! Per-VM failures stay local to that VM; store errors bubble up to the API
//! boundary; the reconciler logs everything and retries on the next tick.

use std::fmt;

/// Phase of a boot or warm-up attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStage {
    /// TAP device creation.
    Tap,
    /// Spawning the hypervisor process.
    Spawn,
    /// Configuring the VM over the backend API.
    Configure,
    /// Issuing the instance-start action.
    InstanceStart,
    /// Polling the guest health endpoint.
    HealthCheck,
    /// Lifecycle-specific guest priming.
    Priming,
}

impl fmt::Display for FailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailStage::Tap => write!(f, "tap"),
            FailStage::Spawn => write!(f, "spawn"),
            FailStage::Configure => write!(f, "configure"),
            FailStage::InstanceStart => write!(f, "instance-start"),
            FailStage::HealthCheck => write!(f, "health-check"),
            FailStage::Priming => write!(f, "priming"),
        }
    }
}

/// Typed errors surfaced by the pool core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Attach found no warm VM matching the spec fingerprint. Recoverable;
    /// the reconciler retries on its next tick.
    #[error("no warm VM available for fingerprint {0}")]
    NoWarmVmAvailable(String),

    /// An operation referenced a job id that is not in the desired set.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Boot failed somewhere between TAP creation and the guest health
    /// check. Fatal for that VM instance, non-fatal for the pool.
    #[error("boot failed ({stage}): {reason}")]
    BootFailed { stage: FailStage, reason: String },

    /// Warm-up priming failed after a successful boot.
    #[error("warm-up failed ({stage}): {reason}")]
    WarmUpFailed { stage: FailStage, reason: String },

    /// Persistent storage I/O failure.
    #[error("desired-state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The hypervisor API socket timed out or refused the connection.
    #[error("hypervisor driver unreachable: {0}")]
    DriverUnreachable(String),
}

impl Error {
    pub fn boot(stage: FailStage, reason: impl Into<String>) -> Self {
        Error::BootFailed {
            stage,
            reason: reason.into(),
        }
    }

    pub fn warm_up(stage: FailStage, reason: impl Into<String>) -> Self {
        Error::WarmUpFailed {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the caller may simply retry later (reconciler policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoWarmVmAvailable(_) | Error::StoreUnavailable(_) | Error::DriverUnreachable(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
