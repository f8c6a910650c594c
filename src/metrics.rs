//! Process-wide counters exposed at `GET /metrics`.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics registry (singleton).
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the global metrics instance.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Control-plane counters.
pub struct Metrics {
    pub vms_booted: AtomicU64,
    pub vms_warmed: AtomicU64,
    pub vms_stopped: AtomicU64,
    pub boot_failures: AtomicU64,
    pub warm_up_failures: AtomicU64,

    pub attaches: AtomicU64,
    pub attach_warm_misses: AtomicU64,
    pub detaches: AtomicU64,

    pub reconcile_ticks: AtomicU64,
    pub reconcile_errors: AtomicU64,

    pub http_requests: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            vms_booted: AtomicU64::new(0),
            vms_warmed: AtomicU64::new(0),
            vms_stopped: AtomicU64::new(0),
            boot_failures: AtomicU64::new(0),
            warm_up_failures: AtomicU64::new(0),
            attaches: AtomicU64::new(0),
            attach_warm_misses: AtomicU64::new(0),
            detaches: AtomicU64::new(0),
            reconcile_ticks: AtomicU64::new(0),
            reconcile_errors: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
        }
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &AtomicU64); 11] = [
            ("vmplane_vms_booted_total", &self.vms_booted),
            ("vmplane_vms_warmed_total", &self.vms_warmed),
            ("vmplane_vms_stopped_total", &self.vms_stopped),
            ("vmplane_boot_failures_total", &self.boot_failures),
            ("vmplane_warm_up_failures_total", &self.warm_up_failures),
            ("vmplane_attaches_total", &self.attaches),
            ("vmplane_attach_warm_misses_total", &self.attach_warm_misses),
            ("vmplane_detaches_total", &self.detaches),
            ("vmplane_reconcile_ticks_total", &self.reconcile_ticks),
            ("vmplane_reconcile_errors_total", &self.reconcile_errors),
            ("vmplane_http_requests_total", &self.http_requests),
        ];
        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }
        out
    }
}
