//! End-to-end convergence scenarios against the mock backend.

use std::sync::Arc;
use tokio::time::{Duration, sleep};

use vmplane::config::Settings;
use vmplane::driver::MockDriver;
use vmplane::error::Error;
use vmplane::fingerprint::fingerprint;
use vmplane::pool::PoolManager;
use vmplane::proxy::RecordingProxy;
use vmplane::reconciler::Reconciler;
use vmplane::spec::{Lifecycle, VmSpec};
use vmplane::store::DesiredStore;

async fn plane() -> (PoolManager, Arc<MockDriver>, Arc<RecordingProxy>, DesiredStore) {
    let store = DesiredStore::in_memory().await.unwrap();
    let driver = Arc::new(MockDriver::new());
    let proxy = Arc::new(RecordingProxy::new());
    let mut settings = Settings::default();
    settings.run_dir = std::env::temp_dir();
    let pool = PoolManager::new(store.clone(), driver.clone(), proxy.clone(), &settings);
    (pool, driver, proxy, store)
}

fn web_spec() -> VmSpec {
    let mut spec = VmSpec::new("/images/vmlinux", "/images/web.ext4")
        .with_lifecycle(Lifecycle::Service)
        .with_warm_pool(1, Some(3))
        .with_resources(2, 512);
    spec.cmd = vec!["/bin/web".into(), "--port".into(), "4000".into()];
    spec
}

/// Poll a condition until it holds or a generous deadline passes.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn cold_start_warm_first_service() {
    let (pool, _, _, store) = plane().await;
    let spec = web_spec();
    let f = fingerprint(&spec);
    store.put("web-1", "web-1", &spec).await.unwrap();

    let loop_handle = Reconciler::with_interval(pool.clone(), Duration::from_millis(50)).spawn();

    // The job ends up backed by the (promoted) warm vm.
    eventually("web-1 attached", || {
        let pool = pool.clone();
        async move { pool.actual_ids().await.contains("web-1") }
    })
    .await;

    let info = pool.lookup("web-1").await.unwrap();
    assert!(
        info.vm_id.starts_with(&f),
        "job vm {} should be fingerprint-derived",
        info.vm_id
    );
    assert_eq!(info.tenant, "web-1");

    // A replacement warm vm with the same fingerprint appears.
    eventually("warm slot refilled", || {
        let pool = pool.clone();
        let f = f.clone();
        async move { pool.warm_spec_hashes().await.contains(&f) }
    })
    .await;

    loop_handle.shutdown().await;
    pool.shutdown().await;
}

#[tokio::test]
async fn idempotent_attach_same_vm_once() {
    let (pool, driver, _, store) = plane().await;
    let spec = web_spec();
    store.put("web-1", "web-1", &spec).await.unwrap();
    pool.ensure_warm_one(&spec).await.unwrap();
    assert_eq!(driver.boot_count(), 1);

    let (a, b) = tokio::join!(pool.attach("web-1", &spec), pool.attach("web-1", &spec));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.vm_id, b.vm_id);

    // At most the async warm refill booted on top of the original warm vm;
    // the double attach itself created nothing.
    sleep(Duration::from_millis(100)).await;
    assert!(driver.boot_count() <= 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn no_warm_policy_stays_pending() {
    let (pool, driver, _, store) = plane().await;
    let spec = VmSpec::new("/images/vmlinux", "/images/batch.ext4");
    store.put("job-1", "job-1", &spec).await.unwrap();

    let err = pool.attach("job-1", &spec).await.unwrap_err();
    assert!(matches!(err, Error::NoWarmVmAvailable(_)));

    // The reconciler does not cold-boot a spec with no warm policy; the job
    // stays unattached until warm capacity appears by other means.
    let reconciler = Reconciler::with_interval(pool.clone(), Duration::from_millis(50));
    for _ in 0..3 {
        reconciler.tick().await;
    }
    assert!(pool.actual_ids().await.is_empty());
    assert_eq!(driver.boot_count(), 0);
}

#[tokio::test]
async fn delete_converges_and_deregisters_once() {
    let (pool, _, proxy, store) = plane().await;
    let spec = web_spec();
    store.put("web-1", "web-1", &spec).await.unwrap();

    let loop_handle = Reconciler::with_interval(pool.clone(), Duration::from_millis(50)).spawn();
    eventually("web-1 attached", || {
        let pool = pool.clone();
        async move { pool.actual_ids().await.contains("web-1") }
    })
    .await;
    let vm_id = pool.lookup("web-1").await.unwrap().vm_id;
    assert_eq!(proxy.registrations_for(&vm_id), 1);

    store.delete("web-1").await.unwrap();
    eventually("web-1 detached", || {
        let pool = pool.clone();
        async move { !pool.actual_ids().await.contains("web-1") }
    })
    .await;
    assert!(pool.lookup("web-1").await.is_none());

    // Exactly one register over the vm's lifetime, exactly one deregister.
    eventually("vm deregistered", || {
        let proxy = proxy.clone();
        let vm_id = vm_id.clone();
        async move { proxy.deregistrations_for(&vm_id) == 1 }
    })
    .await;
    assert_eq!(proxy.registrations_for(&vm_id), 1);

    loop_handle.shutdown().await;
    pool.shutdown().await;
}

#[tokio::test]
async fn fingerprint_stability_across_key_order() {
    let (pool, driver, _, store) = plane().await;

    let s1: VmSpec = serde_json::from_str(
        r#"{
            "kernel": "/images/vmlinux", "rootfs": "/images/web.ext4",
            "env": {"A": "1", "B": "2"},
            "resources": {"vcpu": 1, "mem_mb": 256},
            "lifecycle": "service",
            "warm_pool": {"min": 1}
        }"#,
    )
    .unwrap();
    let s2: VmSpec = serde_json::from_str(
        r#"{
            "warm_pool": {"min": 1},
            "lifecycle": "service",
            "resources": {"mem_mb": 256, "vcpu": 1},
            "env": {"B": "2", "A": "1"},
            "rootfs": "/images/web.ext4", "kernel": "/images/vmlinux"
        }"#,
    )
    .unwrap();
    assert_eq!(fingerprint(&s1), fingerprint(&s2));

    // A warm vm seeded by s1 satisfies an attach using s2.
    store.put("j", "j", &s2).await.unwrap();
    pool.ensure_warm_one(&s1).await.unwrap();
    let boots = driver.boot_count();

    let info = pool.attach("j", &s2).await.unwrap();
    assert_eq!(info.fingerprint, fingerprint(&s1));
    assert_eq!(driver.boot_count(), boots);

    pool.shutdown().await;
}

#[tokio::test]
async fn converged_state_is_a_fixed_point() {
    let (pool, driver, _, store) = plane().await;
    let spec = web_spec();
    store.put("web-1", "web-1", &spec).await.unwrap();

    let reconciler = Reconciler::with_interval(pool.clone(), Duration::from_millis(50));
    for _ in 0..4 {
        reconciler.tick().await;
    }
    sleep(Duration::from_millis(100)).await;

    assert!(pool.actual_ids().await.contains("web-1"));
    assert_eq!(pool.warm_spec_hashes().await.len(), 1);
    let boots = driver.boot_count();
    let stops = driver.stop_count();

    for _ in 0..4 {
        reconciler.tick().await;
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.boot_count(), boots);
    assert_eq!(driver.stop_count(), stops);

    pool.shutdown().await;
}
