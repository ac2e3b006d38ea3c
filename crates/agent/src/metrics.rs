use std::sync::atomic::{AtomicU64, Ordering};

/// Simple in-memory metrics exposed at `/metrics` in Prometheus format.
#[derive(Default)]
pub struct Metrics {
    pub pings_ok_total: AtomicU64,
    pub pings_failed_total: AtomicU64,
    pub agents_active: AtomicU64,
    pub lookups_total: AtomicU64,
    pub lookup_hits_total: AtomicU64,
    pub jobs_submitted_total: AtomicU64,
    pub jobs_finished_total: AtomicU64,
    pub jobs_failed_total: AtomicU64,
    pub scheduler_errors_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_agents_active(&self, v: u64) {
        self.agents_active.store(v, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let rows: [(&str, &str, &AtomicU64); 9] = [
            ("agent_pings_ok_total", "counter", &self.pings_ok_total),
            ("agent_pings_failed_total", "counter", &self.pings_failed_total),
            ("agent_agents_active", "gauge", &self.agents_active),
            ("agent_lookups_total", "counter", &self.lookups_total),
            ("agent_lookup_hits_total", "counter", &self.lookup_hits_total),
            ("agent_jobs_submitted_total", "counter", &self.jobs_submitted_total),
            ("agent_jobs_finished_total", "counter", &self.jobs_finished_total),
            ("agent_jobs_failed_total", "counter", &self.jobs_failed_total),
            ("agent_scheduler_errors_total", "counter", &self.scheduler_errors_total),
        ];
        let mut out = String::new();
        for (name, kind, value) in rows {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
        }
        out
    }
}
