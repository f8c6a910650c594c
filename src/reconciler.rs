//! Periodic convergence loop.
//!
//! Each tick diffs desired state against the pool, attaches missing jobs,
//! detaches undesired ones, and keeps one warm VM per distinct desired spec
//! that asks for warm capacity. Ticks are serial and never overlap; every
//! error is logged and retried on the next tick, so the loop itself cannot
//! crash the control plane.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::debug;

use crate::error::Error;
use crate::fingerprint::fingerprint;
use crate::metrics;
use crate::pool::PoolManager;
use crate::spec::VmSpec;

/// Default tick interval.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reconciler {
    pool: PoolManager,
    tick_interval: Duration,
}

impl Reconciler {
    pub fn new(pool: PoolManager) -> Self {
        Self::with_interval(pool, TICK_INTERVAL)
    }

    pub fn with_interval(pool: PoolManager, tick_interval: Duration) -> Self {
        Self {
            pool,
            tick_interval,
        }
    }

    /// Run one convergence pass. Public so tests can step the loop by hand.
    pub async fn tick(&self) {
        metrics::global()
            .reconcile_ticks
            .fetch_add(1, Ordering::Relaxed);

        let desired = match self.pool.store().list().await {
            Ok(desired) => desired,
            Err(e) => {
                metrics::global()
                    .reconcile_errors
                    .fetch_add(1, Ordering::Relaxed);
                PoolManager::log_error("reconcile: listing desired state", &e);
                return;
            }
        };
        let actual = self.pool.actual_ids().await;

        // Attach everything desired but not running.
        for (job_id, job) in &desired {
            if actual.contains(job_id) {
                continue;
            }
            if let Err(e) = self.pool.attach(job_id, &job.spec).await {
                self.count_error(&e);
                PoolManager::log_error("reconcile: attach", &e);
            }
        }

        // Detach everything running but no longer desired.
        for job_id in &actual {
            if !desired.contains_key(job_id) {
                self.pool.detach(job_id).await;
            }
        }

        self.ensure_warm_for_all_specs(&desired).await;

        debug!(
            desired = desired.len(),
            actual = actual.len(),
            "reconcile tick complete"
        );
    }

    /// Keep one warm VM per distinct fingerprint whose spec declares an
    /// effective `warm_pool.min > 0`, and retire warm VMs for fingerprints
    /// that left the desired set entirely.
    async fn ensure_warm_for_all_specs(&self, desired: &HashMap<String, crate::store::DesiredJob>) {
        let default_min = self.pool.default_warm_min();
        let mut desired_fingerprints = HashSet::new();
        // Several entries may share a fingerprint; any one spec suffices to
        // seed the warm VM.
        let mut warm_wanted: HashMap<String, &VmSpec> = HashMap::new();
        for job in desired.values() {
            let f = fingerprint(&job.spec);
            if job.spec.wants_warm(default_min) {
                warm_wanted.entry(f.clone()).or_insert(&job.spec);
            }
            desired_fingerprints.insert(f);
        }

        let have = self.pool.warm_spec_hashes().await;
        for (f, spec) in &warm_wanted {
            if have.contains(f) {
                continue;
            }
            if let Err(e) = self.pool.ensure_warm_one(spec).await {
                self.count_error(&e);
                PoolManager::log_error("reconcile: ensure warm", &e);
            }
        }

        self.pool.prune_warm(&desired_fingerprints).await;
    }

    fn count_error(&self, e: &Error) {
        // A warm miss is the expected "not yet" signal, not a failure.
        if !matches!(e, Error::NoWarmVmAvailable(_)) {
            metrics::global()
                .reconcile_errors
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Start the periodic loop. The returned handle stops it gracefully.
    pub fn spawn(self) -> ReconcilerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.tick_interval);
            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                self.tick().await;
            }
        });
        ReconcilerHandle { stop, task }
    }
}

/// Handle to a running reconciler loop.
pub struct ReconcilerHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop after the in-flight tick, if any, completes.
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::driver::MockDriver;
    use crate::proxy::RecordingProxy;
    use crate::spec::{Lifecycle, WarmPoolPolicy};
    use crate::store::DesiredStore;
    use tokio::time::sleep;

    async fn harness() -> (Reconciler, PoolManager, Arc<MockDriver>, DesiredStore) {
        let store = DesiredStore::in_memory().await.unwrap();
        let driver = Arc::new(MockDriver::new());
        let proxy = Arc::new(RecordingProxy::new());
        let mut settings = Settings::default();
        settings.run_dir = std::env::temp_dir();
        let pool = PoolManager::new(store.clone(), driver.clone(), proxy, &settings);
        let reconciler = Reconciler::new(pool.clone());
        (reconciler, pool, driver, store)
    }

    fn service_spec() -> VmSpec {
        VmSpec::new("/images/vmlinux", "/images/web.ext4")
            .with_lifecycle(Lifecycle::Service)
            .with_warm_pool(1, Some(3))
    }

    #[tokio::test]
    async fn test_empty_desired_state_creates_nothing() {
        let (reconciler, pool, driver, _) = harness().await;
        reconciler.tick().await;
        reconciler.tick().await;
        assert_eq!(driver.boot_count(), 0);
        assert_eq!(pool.vm_count().await, 0);
    }

    #[tokio::test]
    async fn test_cold_start_converges_within_three_ticks() {
        let (reconciler, pool, _, store) = harness().await;
        let spec = service_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        let f = fingerprint(&spec);

        // Tick 1: attach misses, warm vm gets created.
        reconciler.tick().await;
        assert!(pool.warm_spec_hashes().await.contains(&f));

        // Tick 2: the warm vm is promoted to back web-1.
        reconciler.tick().await;
        let actual = pool.actual_ids().await;
        assert!(actual.contains("web-1"));

        let info = pool.lookup("web-1").await.unwrap();
        assert!(info.vm_id.starts_with(&f));

        // Tick 3: the consumed warm slot is refilled.
        reconciler.tick().await;
        sleep(Duration::from_millis(100)).await;
        assert!(pool.warm_spec_hashes().await.contains(&f));
    }

    #[tokio::test]
    async fn test_no_warm_policy_means_no_proactive_boot() {
        let (reconciler, pool, driver, store) = harness().await;
        // A job-lifecycle spec with no warm_pool: attachment stays pending
        // until warm capacity appears by other means.
        let spec = VmSpec::new("/images/vmlinux", "/images/batch.ext4");
        store.put("job-1", "job-1", &spec).await.unwrap();

        for _ in 0..3 {
            reconciler.tick().await;
        }
        assert_eq!(driver.boot_count(), 0);
        assert!(pool.actual_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_warm_pool_min_zero_creates_no_warm() {
        let (reconciler, pool, driver, store) = harness().await;
        let spec = VmSpec::new("/k", "/r").with_warm_pool(0, Some(2));
        store.put("job-1", "job-1", &spec).await.unwrap();

        reconciler.tick().await;
        assert_eq!(driver.boot_count(), 0);
        assert!(pool.warm_spec_hashes().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsized_warm_pool_falls_back_to_operator_default() {
        let (reconciler, pool, driver, store) = harness().await;
        // warm_pool declared but not sized: FC_WARM (default 1) fills in.
        let mut spec = VmSpec::new("/k", "/r").with_lifecycle(Lifecycle::Service);
        spec.warm_pool = Some(WarmPoolPolicy {
            min: None,
            max: None,
        });
        store.put("web-1", "web-1", &spec).await.unwrap();

        reconciler.tick().await;
        assert_eq!(driver.boot_count(), 1);
        assert_eq!(pool.warm_spec_hashes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_converges_within_two_ticks() {
        let (reconciler, pool, _, store) = harness().await;
        let spec = service_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();

        reconciler.tick().await;
        reconciler.tick().await;
        assert!(pool.actual_ids().await.contains("web-1"));

        // Let the async warm refill settle before flipping desired state.
        sleep(Duration::from_millis(100)).await;
        assert!(!pool.warm_spec_hashes().await.is_empty());

        store.delete("web-1").await.unwrap();
        reconciler.tick().await;
        assert!(!pool.actual_ids().await.contains("web-1"));
        assert!(pool.lookup("web-1").await.is_none());

        // The fingerprint left the desired set, so warm capacity for it is
        // retired as well.
        reconciler.tick().await;
        assert!(pool.warm_spec_hashes().await.is_empty());
    }

    #[tokio::test]
    async fn test_tick_is_idempotent_on_converged_state() {
        let (reconciler, pool, driver, store) = harness().await;
        let spec = service_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();

        for _ in 0..3 {
            reconciler.tick().await;
        }
        sleep(Duration::from_millis(100)).await;
        assert!(pool.actual_ids().await.contains("web-1"));
        let boots = driver.boot_count();

        for _ in 0..3 {
            reconciler.tick().await;
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(driver.boot_count(), boots);
        assert_eq!(pool.vm_count().await, 2);
    }

    #[tokio::test]
    async fn test_shared_fingerprint_seeds_one_warm() {
        let (reconciler, pool, driver, store) = harness().await;
        let spec = service_spec();
        // Two desired entries, identical spec: one warm vm serves both as
        // the cache seed.
        store.put("web-1", "web-1", &spec).await.unwrap();
        store.put("web-2", "web-2", &spec).await.unwrap();

        reconciler.tick().await;
        assert_eq!(pool.warm_spec_hashes().await.len(), 1);
        assert_eq!(driver.boot_count(), 1);
    }

    #[tokio::test]
    async fn test_boot_failures_do_not_stop_the_loop() {
        let (reconciler, pool, driver, store) = harness().await;
        let spec = service_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        driver.fail_next_boots(1);

        // First tick's warm boot fails; later ticks recover.
        reconciler.tick().await;
        assert!(pool.warm_spec_hashes().await.is_empty());

        reconciler.tick().await;
        reconciler.tick().await;
        assert!(pool.actual_ids().await.contains("web-1"));
    }
}
