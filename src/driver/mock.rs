//! In-memory backend for the test suite: boots instantly, counts every
//! operation, and supports failure injection.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, sleep};

use crate::error::{Error, FailStage, Result};

use super::{HypervisorDriver, LaunchContext, VmProcess};

/// Mock hypervisor. Counters let tests assert "at most one VM creation" and
/// "stop called exactly once"; `fail_next_boots` injects boot failures.
#[derive(Debug, Default)]
pub struct MockDriver {
    pub boots: AtomicUsize,
    pub warm_ups: AtomicUsize,
    pub stops: AtomicUsize,
    fail_next_boots: AtomicUsize,
    fail_next_warm_ups: AtomicUsize,
    boot_delay_ms: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` boot calls fail with a spawn error.
    pub fn fail_next_boots(&self, n: usize) {
        self.fail_next_boots.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` warm-up calls fail.
    pub fn fail_next_warm_ups(&self, n: usize) {
        self.fail_next_warm_ups.store(n, Ordering::SeqCst);
    }

    /// Simulate slow boots to widen race windows in concurrency tests.
    pub fn set_boot_delay(&self, delay: Duration) {
        self.boot_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn warm_up_count(&self) -> usize {
        self.warm_ups.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HypervisorDriver for MockDriver {
    async fn boot(&self, ctx: &LaunchContext) -> Result<VmProcess> {
        let delay = self.boot_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay as u64)).await;
        }
        if Self::take_failure(&self.fail_next_boots) {
            return Err(Error::boot(
                FailStage::Spawn,
                format!("injected boot failure for {}", ctx.vm_id),
            ));
        }
        self.boots.fetch_add(1, Ordering::SeqCst);
        Ok(VmProcess::detached())
    }

    async fn warm_up(&self, ctx: &LaunchContext) -> Result<()> {
        if Self::take_failure(&self.fail_next_warm_ups) {
            return Err(Error::warm_up(
                FailStage::Priming,
                format!("injected warm-up failure for {}", ctx.vm_id),
            ));
        }
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _ctx: &LaunchContext, process: &mut VmProcess) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        process.kill();
    }
}
