//! Pool manager: the authority over `job -> vm` and `fingerprint -> warm vm`.
//!
//! All bookkeeping lives behind one lock. Long operations (boot, warm-up)
//! never hold it: `ensure_warm_one` records intent in the `warming` set,
//! releases the lock for the boot, and re-checks state on completion. This
//! yields the two concurrency guarantees the rest of the system leans on:
//! attach for the same job id is idempotent, and at most one warm VM exists
//! per fingerprint.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::driver::{HypervisorDriver, LaunchContext};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::metrics;
use crate::net::NetAllocator;
use crate::proxy::ProxyRegistry;
use crate::spec::{Lifecycle, VmSpec};
use crate::store::DesiredStore;
use crate::vm::{self, VmHandle, VmInfo, VmStatus, WARM_TENANT};

/// Ceiling on one attach call, promotion included.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(60);

/// Binding of one job to its VM.
#[derive(Debug, Clone, Serialize)]
pub struct JobBinding {
    pub vm_id: String,
    pub fingerprint: String,
    pub tenant: String,
}

#[derive(Debug, Clone)]
struct WarmEntry {
    vm_id: String,
    spec: VmSpec,
}

#[derive(Default)]
struct PoolState {
    /// At most one entry per live job id.
    jobs: HashMap<String, JobBinding>,
    /// At most one warm VM per fingerprint.
    warm: HashMap<String, WarmEntry>,
    /// Every supervised actor, keyed by vm id. Union of the vm ids in
    /// `jobs` and `warm`.
    vms: HashMap<String, VmHandle>,
    /// Fingerprints with an in-flight warm boot.
    warming: HashSet<String>,
}

impl PoolState {
    /// Drop bindings whose actor task has terminated (crashed or been
    /// aborted); the reconciler re-creates them on its next tick.
    fn prune_dead(&mut self) {
        let dead_jobs: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, b)| !self.vms.get(&b.vm_id).is_some_and(|h| h.is_alive()))
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in dead_jobs {
            if let Some(binding) = self.jobs.remove(&job_id) {
                warn!(job_id = %job_id, vm_id = %binding.vm_id, "pruning dead job vm");
                self.vms.remove(&binding.vm_id);
            }
        }

        let dead_warm: Vec<String> = self
            .warm
            .iter()
            .filter(|(_, e)| !self.vms.get(&e.vm_id).is_some_and(|h| h.is_alive()))
            .map(|(f, _)| f.clone())
            .collect();
        for f in dead_warm {
            if let Some(entry) = self.warm.remove(&f) {
                warn!(fingerprint = %f, vm_id = %entry.vm_id, "pruning dead warm vm");
                self.vms.remove(&entry.vm_id);
            }
        }
    }

    /// Live handle backing an already-bound job. A binding whose actor has
    /// died is pruned and reported as absent.
    fn bound_handle(&mut self, job_id: &str) -> Option<VmHandle> {
        let vm_id = self.jobs.get(job_id).map(|b| b.vm_id.clone())?;
        match self.vms.get(&vm_id).cloned().filter(|h| h.is_alive()) {
            Some(handle) => Some(handle),
            None => {
                self.prune_dead();
                None
            }
        }
    }
}

/// Summary block of `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub jobs: usize,
    pub warm: usize,
    pub vms: usize,
}

/// One job row in `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStat {
    pub job_id: String,
    pub vm_id: String,
    pub tenant: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<VmStatus>,
}

/// One warm-pool row in `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct WarmStat {
    pub fingerprint: String,
    pub vm_id: String,
    pub lifecycle: Lifecycle,
    pub vcpu: u32,
    pub mem_mb: u64,
}

/// Full pool snapshot served at `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub summary: PoolSummary,
    pub jobs: Vec<JobStat>,
    pub warm_pool: Vec<WarmStat>,
}

/// Cheap-to-clone handle over the shared pool state; clones are used to
/// spawn refill tasks without an outer Arc.
#[derive(Clone)]
pub struct PoolManager {
    state: Arc<Mutex<PoolState>>,
    store: DesiredStore,
    driver: Arc<dyn HypervisorDriver>,
    proxy: Arc<dyn ProxyRegistry>,
    net: Arc<NetAllocator>,
    run_dir: PathBuf,
    guest_port: u16,
    max_vms: usize,
    default_warm_min: u32,
    warm_seq: Arc<AtomicU64>,
}

impl PoolManager {
    pub fn new(
        store: DesiredStore,
        driver: Arc<dyn HypervisorDriver>,
        proxy: Arc<dyn ProxyRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            store,
            driver,
            proxy,
            net: Arc::new(NetAllocator::new(settings.subnet_prefix.clone())),
            run_dir: settings.run_dir.clone(),
            guest_port: settings.guest_port,
            max_vms: settings.max_vms,
            default_warm_min: settings.warm_target,
            warm_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fallback `warm_pool.min` applied to specs that declare a warm pool
    /// without sizing it (`FC_WARM`).
    pub fn default_warm_min(&self) -> u32 {
        self.default_warm_min
    }

    /// Bind a job to a VM.
    ///
    /// Idempotent: a job that is already bound returns its existing VM
    /// unchanged. Otherwise the tenant comes from the desired-state store,
    /// and a warm VM matching the spec fingerprint is promoted via
    /// `update_tenant` (which registers it with the proxy). Without a warm
    /// match this fails with `NoWarmVmAvailable` and the caller retries on
    /// the next tick; a successful promotion schedules an async refill.
    pub async fn attach(&self, job_id: &str, spec: &VmSpec) -> Result<VmInfo> {
        match timeout(ATTACH_TIMEOUT, self.attach_inner(job_id, spec)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DriverUnreachable(format!(
                "attach of {} exceeded {:?}",
                job_id, ATTACH_TIMEOUT
            ))),
        }
    }

    async fn attach_inner(&self, job_id: &str, spec: &VmSpec) -> Result<VmInfo> {
        // Idempotent fast path: a job that is already bound answers from
        // its vm, with no store round-trip. A desired row deleted out from
        // under a live binding must not turn a re-attach into UnknownJob.
        {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.bound_handle(job_id) {
                drop(state);
                return handle.info().await.ok_or_else(|| {
                    Error::DriverUnreachable(format!("vm for {} terminated", job_id))
                });
            }
        }

        let tenant = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| Error::UnknownJob(job_id.to_string()))?
            .tenant;

        let f = fingerprint(spec);

        // One lock scope for the bound/warm/miss decision; the promotion
        // itself runs against the vm's own inbox after release.
        let promoted = {
            let mut state = self.state.lock().await;

            // A concurrent attach may have bound the job while the lock
            // was released for the store read.
            if let Some(handle) = state.bound_handle(job_id) {
                drop(state);
                return handle.info().await.ok_or_else(|| {
                    Error::DriverUnreachable(format!("vm for {} terminated", job_id))
                });
            }

            let entry = match state.warm.remove(&f) {
                Some(entry) => entry,
                None => {
                    metrics::global()
                        .attach_warm_misses
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(Error::NoWarmVmAvailable(f));
                }
            };
            let handle = match state.vms.get(&entry.vm_id).cloned() {
                Some(handle) => handle,
                None => {
                    // The warm entry pointed at an unsupervised vm; treat
                    // it as a miss and let the next tick rebuild it.
                    state.prune_dead();
                    return Err(Error::NoWarmVmAvailable(f));
                }
            };
            state.jobs.insert(
                job_id.to_string(),
                JobBinding {
                    vm_id: entry.vm_id.clone(),
                    fingerprint: f.clone(),
                    tenant: tenant.clone(),
                },
            );
            handle
        };

        let info = match promoted.update_tenant(&tenant).await {
            Some(info) => info,
            None => {
                // The actor died mid-promotion; undo the binding so the
                // next tick can retry cleanly.
                let mut state = self.state.lock().await;
                state.jobs.remove(job_id);
                state.vms.remove(promoted.vm_id());
                return Err(Error::DriverUnreachable(format!(
                    "warm vm {} terminated during promotion",
                    promoted.vm_id()
                )));
            }
        };

        metrics::global().attaches.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %job_id, vm_id = %info.vm_id, tenant = %tenant, "job attached");

        // Refill the slot this promotion consumed.
        let pool = self.clone();
        let refill_spec = spec.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.ensure_warm_one(&refill_spec).await {
                warn!(error = %e, "warm refill failed");
            }
        });

        Ok(info)
    }

    /// Unbind a job and stop its VM. Idempotent; unknown jobs are a no-op.
    /// The VM is not returned to the warm pool.
    pub async fn detach(&self, job_id: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            match state.jobs.remove(job_id) {
                Some(binding) => state.vms.remove(&binding.vm_id),
                None => None,
            }
        };

        if let Some(handle) = handle {
            info!(job_id = %job_id, vm_id = %handle.vm_id(), "job detached");
            handle.stop().await;
            metrics::global().detaches.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Make sure one warm VM exists for this spec's fingerprint.
    ///
    /// No-op when a warm VM already exists or another warm boot for the
    /// same fingerprint is in flight. Failures are logged by the caller and
    /// retried on the next reconciler tick.
    pub async fn ensure_warm_one(&self, spec: &VmSpec) -> Result<()> {
        let f = fingerprint(spec);

        {
            let mut state = self.state.lock().await;
            if state.warm.contains_key(&f) || state.warming.contains(&f) {
                return Ok(());
            }
            if state.vms.len() + state.warming.len() >= self.max_vms {
                warn!(fingerprint = %f, max = self.max_vms, "vm limit reached, warm deferred");
                return Ok(());
            }
            state.warming.insert(f.clone());
        }

        let seq = self.warm_seq.fetch_add(1, Ordering::SeqCst);
        let vm_id = format!("{}-w{}", f, seq);
        let ctx = LaunchContext::new(
            vm_id.clone(),
            spec.clone(),
            self.net.allocate(),
            &self.run_dir,
            self.guest_port,
        );
        let handle = vm::spawn(
            WARM_TENANT.to_string(),
            f.clone(),
            ctx,
            self.driver.clone(),
            self.proxy.clone(),
        );

        debug!(vm_id = %vm_id, fingerprint = %f, "booting warm vm");
        let booted = async {
            handle.boot().await?;
            handle.warm_up().await
        }
        .await;

        match booted {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.warming.remove(&f);
                if state.warm.contains_key(&f) {
                    // Re-check after the long boot: someone else won the
                    // slot, keep at most one warm VM per fingerprint.
                    drop(state);
                    handle.stop().await;
                } else {
                    state.warm.insert(
                        f.clone(),
                        WarmEntry {
                            vm_id: vm_id.clone(),
                            spec: spec.clone(),
                        },
                    );
                    state.vms.insert(vm_id.clone(), handle);
                    info!(vm_id = %vm_id, fingerprint = %f, "warm vm ready");
                }
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.warming.remove(&f);
                handle.stop().await;
                Err(e)
            }
        }
    }

    /// Stop warm VMs whose fingerprint is no longer in the desired set.
    pub async fn prune_warm(&self, desired_fingerprints: &HashSet<String>) {
        let mut doomed: Vec<(String, VmHandle)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let stale: Vec<String> = state
                .warm
                .keys()
                .filter(|f| !desired_fingerprints.contains(*f))
                .cloned()
                .collect();
            for f in stale {
                if let Some(entry) = state.warm.remove(&f)
                    && let Some(handle) = state.vms.remove(&entry.vm_id)
                {
                    doomed.push((f, handle));
                }
            }
        }

        for (f, handle) in doomed {
            info!(fingerprint = %f, vm_id = %handle.vm_id(), "stopping undesired warm vm");
            handle.stop().await;
        }
    }

    /// VM info for one job, or `None` when unknown.
    pub async fn lookup(&self, job_id: &str) -> Option<VmInfo> {
        let handle = {
            let state = self.state.lock().await;
            let binding = state.jobs.get(job_id)?;
            state.vms.get(&binding.vm_id).cloned()
        };
        handle?.info().await
    }

    /// Job ids currently backed by a live VM. Dead actors are pruned here,
    /// so a crashed VM shows up as missing and gets re-attached.
    pub async fn actual_ids(&self) -> HashSet<String> {
        let mut state = self.state.lock().await;
        state.prune_dead();
        state.jobs.keys().cloned().collect()
    }

    /// Fingerprints with a live warm VM.
    pub async fn warm_spec_hashes(&self) -> HashSet<String> {
        let mut state = self.state.lock().await;
        state.prune_dead();
        state.warm.keys().cloned().collect()
    }

    /// Whether any warm VM is ready.
    pub async fn has_warm(&self) -> bool {
        !self.warm_spec_hashes().await.is_empty()
    }

    /// Consistent snapshot for `GET /stats`.
    pub async fn stats(&self) -> PoolStats {
        let (bindings, warm_rows, vm_handles) = {
            let state = self.state.lock().await;
            let bindings: Vec<(String, JobBinding)> = state
                .jobs
                .iter()
                .map(|(job_id, b)| (job_id.clone(), b.clone()))
                .collect();
            let warm_rows: Vec<WarmStat> = state
                .warm
                .iter()
                .map(|(f, entry)| WarmStat {
                    fingerprint: f.clone(),
                    vm_id: entry.vm_id.clone(),
                    lifecycle: entry.spec.lifecycle,
                    vcpu: entry.spec.resources.vcpu,
                    mem_mb: entry.spec.resources.mem_mb,
                })
                .collect();
            let vm_handles: HashMap<String, VmHandle> = state
                .vms
                .iter()
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect();
            (bindings, warm_rows, vm_handles)
        };

        let mut jobs = Vec::with_capacity(bindings.len());
        for (job_id, binding) in bindings {
            let status = match vm_handles.get(&binding.vm_id) {
                Some(handle) => handle.info().await.map(|i| i.status),
                None => None,
            };
            jobs.push(JobStat {
                job_id,
                vm_id: binding.vm_id,
                tenant: binding.tenant,
                fingerprint: binding.fingerprint,
                status,
            });
        }

        PoolStats {
            summary: PoolSummary {
                jobs: jobs.len(),
                warm: warm_rows.len(),
                vms: vm_handles.len(),
            },
            jobs,
            warm_pool: warm_rows,
        }
    }

    /// Stop every supervised VM. Called once on control-plane shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<VmHandle> = {
            let mut state = self.state.lock().await;
            state.jobs.clear();
            state.warm.clear();
            state.warming.clear();
            state.vms.drain().map(|(_, h)| h).collect()
        };

        info!(count = handles.len(), "stopping all vms");
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Count of supervised VMs (jobs plus warm).
    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    pub fn store(&self) -> &DesiredStore {
        &self.store
    }

    /// Report a pool-level error without taking the reconciler down.
    pub fn log_error(context: &str, e: &Error) {
        if e.is_retryable() {
            debug!(context, error = %e, "transient pool error");
        } else {
            error!(context, error = %e, "pool error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::proxy::RecordingProxy;

    async fn test_pool() -> (PoolManager, Arc<MockDriver>, Arc<RecordingProxy>, DesiredStore) {
        let store = DesiredStore::in_memory().await.unwrap();
        let driver = Arc::new(MockDriver::new());
        let proxy = Arc::new(RecordingProxy::new());
        let mut settings = Settings::default();
        settings.run_dir = std::env::temp_dir();
        let pool = PoolManager::new(store.clone(), driver.clone(), proxy.clone(), &settings);
        (pool, driver, proxy, store)
    }

    fn warm_spec() -> VmSpec {
        VmSpec::new("/images/vmlinux", "/images/web.ext4")
            .with_lifecycle(Lifecycle::Service)
            .with_warm_pool(1, Some(3))
    }

    #[tokio::test]
    async fn test_attach_unknown_job_fails() {
        let (pool, _, _, _) = test_pool().await;
        let err = pool.attach("ghost", &warm_spec()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_attach_without_warm_vm_fails_retryably() {
        let (pool, _, _, store) = test_pool().await;
        store.put("web-1", "web-1", &warm_spec()).await.unwrap();

        let err = pool.attach("web-1", &warm_spec()).await.unwrap_err();
        assert!(matches!(err, Error::NoWarmVmAvailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_warm_then_attach_promotes() {
        let (pool, driver, proxy, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "acme", &spec).await.unwrap();

        pool.ensure_warm_one(&spec).await.unwrap();
        let f = fingerprint(&spec);
        assert!(pool.warm_spec_hashes().await.contains(&f));

        let info = pool.attach("web-1", &spec).await.unwrap();
        assert_eq!(info.tenant, "acme");
        assert_eq!(info.status, VmStatus::Running);
        assert!(info.vm_id.starts_with(&f));

        // Promotion moved it out of the warm map.
        assert!(!pool.warm_spec_hashes().await.contains(&f) || driver.boot_count() > 1);
        assert_eq!(proxy.registrations_for(&info.vm_id), 1);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (pool, driver, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();

        let first = pool.attach("web-1", &spec).await.unwrap();
        let boots_after_first = driver.boot_count();
        let second = pool.attach("web-1", &spec).await.unwrap();

        assert_eq!(first.vm_id, second.vm_id);
        // The second attach did not create another vm itself (the async
        // refill may add one warm boot).
        assert!(driver.boot_count() <= boots_after_first + 1);
    }

    #[tokio::test]
    async fn test_attach_stays_idempotent_after_store_delete() {
        let (pool, _, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();
        let first = pool.attach("web-1", &spec).await.unwrap();

        // A racing DELETE can clear the desired row before detach runs; a
        // re-attach for the still-bound job returns the existing vm rather
        // than UnknownJob.
        store.delete("web-1").await.unwrap();
        let second = pool.attach("web-1", &spec).await.unwrap();
        assert_eq!(first.vm_id, second.vm_id);
        assert_eq!(second.tenant, "web-1");
    }

    #[tokio::test]
    async fn test_ensure_warm_one_is_at_most_one() {
        let (pool, driver, _, _) = test_pool().await;
        let spec = warm_spec();

        pool.ensure_warm_one(&spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();
        assert_eq!(driver.boot_count(), 1);
        assert_eq!(pool.vm_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_warm_boots_once() {
        let (pool, driver, _, _) = test_pool().await;
        driver.set_boot_delay(Duration::from_millis(50));
        let spec = warm_spec();

        let a = {
            let pool = pool.clone();
            let spec = spec.clone();
            tokio::spawn(async move { pool.ensure_warm_one(&spec).await })
        };
        let b = {
            let pool = pool.clone();
            let spec = spec.clone();
            tokio::spawn(async move { pool.ensure_warm_one(&spec).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(driver.boot_count(), 1);
        assert_eq!(pool.warm_spec_hashes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_vm_in_both_jobs_and_warm() {
        let (pool, _, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();

        pool.ensure_warm_one(&spec).await.unwrap();
        let info = pool.attach("web-1", &spec).await.unwrap();

        // Wait for the async refill to settle, then check the invariant.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = pool.state.lock().await;
        let job_vms: HashSet<&String> = state.jobs.values().map(|b| &b.vm_id).collect();
        let warm_vms: HashSet<&String> = state.warm.values().map(|e| &e.vm_id).collect();
        assert!(job_vms.contains(&info.vm_id));
        assert!(job_vms.is_disjoint(&warm_vms));
        // Supervised set is exactly the union.
        let union: HashSet<&String> = job_vms.union(&warm_vms).copied().collect();
        let supervised: HashSet<&String> = state.vms.keys().collect();
        assert_eq!(union, supervised);
    }

    #[tokio::test]
    async fn test_detach_stops_vm_exactly_once() {
        let (pool, driver, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();
        pool.attach("web-1", &spec).await.unwrap();

        let stops_before = driver.stop_count();
        pool.detach("web-1").await;
        pool.detach("web-1").await;
        assert_eq!(driver.stop_count(), stops_before + 1);
        assert!(pool.lookup("web-1").await.is_none());
        assert!(pool.actual_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_warm_failure_is_surfaced_and_clean() {
        let (pool, driver, _, _) = test_pool().await;
        driver.fail_next_boots(1);
        let spec = warm_spec();

        assert!(pool.ensure_warm_one(&spec).await.is_err());
        assert!(pool.warm_spec_hashes().await.is_empty());
        assert_eq!(pool.vm_count().await, 0);

        // Next attempt succeeds: the warming reservation was released.
        pool.ensure_warm_one(&spec).await.unwrap();
        assert_eq!(pool.warm_spec_hashes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_warm_stops_undesired() {
        let (pool, driver, _, _) = test_pool().await;
        let spec = warm_spec();
        pool.ensure_warm_one(&spec).await.unwrap();

        pool.prune_warm(&HashSet::new()).await;
        assert!(pool.warm_spec_hashes().await.is_empty());
        assert_eq!(driver.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (pool, driver, _, store) = test_pool().await;
        let spec = warm_spec();
        let other = VmSpec::new("/k", "/other.ext4").with_warm_pool(1, None);
        store.put("web-1", "web-1", &spec).await.unwrap();

        pool.ensure_warm_one(&spec).await.unwrap();
        pool.ensure_warm_one(&other).await.unwrap();
        pool.attach("web-1", &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let supervised = pool.vm_count().await;
        pool.shutdown().await;
        assert_eq!(pool.vm_count().await, 0);
        assert_eq!(driver.stop_count(), supervised);
    }

    #[tokio::test]
    async fn test_dead_actor_is_pruned_and_reattachable() {
        let (pool, _, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "web-1", &spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();
        let info = pool.attach("web-1", &spec).await.unwrap();

        // Kill the actor out from under the pool, as a crash would.
        let handle = {
            let state = pool.state.lock().await;
            state.vms.get(&info.vm_id).cloned().unwrap()
        };
        handle.stop().await;

        // The binding is pruned, the reconciler's view shows the job gone,
        // and a fresh warm vm can back it again.
        assert!(!pool.actual_ids().await.contains("web-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.ensure_warm_one(&spec).await.unwrap();
        let reborn = pool.attach("web-1", &spec).await.unwrap();
        assert_ne!(reborn.vm_id, info.vm_id);
        assert_eq!(reborn.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (pool, _, _, store) = test_pool().await;
        let spec = warm_spec();
        store.put("web-1", "acme", &spec).await.unwrap();
        pool.ensure_warm_one(&spec).await.unwrap();
        pool.attach("web-1", &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = pool.stats().await;
        assert_eq!(stats.summary.jobs, 1);
        assert_eq!(stats.jobs[0].job_id, "web-1");
        assert_eq!(stats.jobs[0].tenant, "acme");
        assert_eq!(stats.jobs[0].status, Some(VmStatus::Running));
        assert_eq!(stats.summary.vms, stats.summary.jobs + stats.summary.warm);
    }
}
