//! Per-service call counters.
//!
//! Counters are lock-free atomics; the per-method and per-error maps sit
//! behind an `RwLock` so first use of a method inserts its counter block
//! exactly once and every later record takes the read path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Sentinel meaning "no latency sample yet".
const MIN_UNSET: u64 = u64::MAX;

#[derive(Default)]
struct MethodStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency_sum: AtomicU64,
}

/// Request/latency/error accounting for one service.
pub struct ServiceMonitor {
    service_name: String,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    latency_sum: AtomicU64,
    max_latency: AtomicU64,
    min_latency: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    errors: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl std::fmt::Debug for ServiceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMonitor")
            .field("service_name", &self.service_name)
            .field("total_requests", &self.total_requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServiceMonitor {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            latency_sum: AtomicU64::new(0),
            max_latency: AtomicU64::new(0),
            min_latency: AtomicU64::new(MIN_UNSET),
            methods: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Record one finished call.
    pub fn record_request(&self, method: &str, success: bool, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.latency_sum.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency.fetch_max(latency_ms, Ordering::Relaxed);
        if latency_ms > 0 {
            self.min_latency.fetch_min(latency_ms, Ordering::Relaxed);
        }

        let stats = self.method_stats(method);
        stats.requests.fetch_add(1, Ordering::Relaxed);
        stats.latency_sum.fetch_add(latency_ms, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tally an error by type.
    pub fn record_error(&self, method: &str, error_type: &str) {
        let counter = self.error_counter(error_type);
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            service = %self.service_name,
            method,
            error_type,
            "service call error"
        );
    }

    /// Flat metric map; averages are computed at read time.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("service_name".into(), self.service_name.clone());

        let total = self.total_requests.load(Ordering::Relaxed);
        out.insert("total_requests".into(), total.to_string());
        out.insert(
            "successful_requests".into(),
            self.successful_requests.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "failed_requests".into(),
            self.failed_requests.load(Ordering::Relaxed).to_string(),
        );

        let avg = if total > 0 {
            self.latency_sum.load(Ordering::Relaxed) as f64 / total as f64
        } else {
            0.0
        };
        out.insert("average_latency_ms".into(), format!("{avg:.3}"));
        out.insert("max_latency_ms".into(), self.max_latency.load(Ordering::Relaxed).to_string());
        let min = self.min_latency.load(Ordering::Relaxed);
        out.insert(
            "min_latency_ms".into(),
            if min == MIN_UNSET { "0".into() } else { min.to_string() },
        );

        for (method, stats) in self.methods.read().expect("monitor lock").iter() {
            let prefix = format!("method_{method}_");
            let requests = stats.requests.load(Ordering::Relaxed);
            out.insert(format!("{prefix}requests"), requests.to_string());
            out.insert(
                format!("{prefix}success"),
                stats.successes.load(Ordering::Relaxed).to_string(),
            );
            out.insert(
                format!("{prefix}failures"),
                stats.failures.load(Ordering::Relaxed).to_string(),
            );
            if requests > 0 {
                let avg = stats.latency_sum.load(Ordering::Relaxed) as f64 / requests as f64;
                out.insert(format!("{prefix}avg_latency_ms"), format!("{avg:.3}"));
            }
        }

        for (error_type, count) in self.errors.read().expect("monitor lock").iter() {
            out.insert(format!("error_{error_type}"), count.load(Ordering::Relaxed).to_string());
        }

        out
    }

    /// Zero every counter; min returns to its unset sentinel.
    pub fn reset_stats(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.latency_sum.store(0, Ordering::Relaxed);
        self.max_latency.store(0, Ordering::Relaxed);
        self.min_latency.store(MIN_UNSET, Ordering::Relaxed);

        for stats in self.methods.read().expect("monitor lock").values() {
            stats.requests.store(0, Ordering::Relaxed);
            stats.successes.store(0, Ordering::Relaxed);
            stats.failures.store(0, Ordering::Relaxed);
            stats.latency_sum.store(0, Ordering::Relaxed);
        }
        for count in self.errors.read().expect("monitor lock").values() {
            count.store(0, Ordering::Relaxed);
        }
        tracing::info!(service = %self.service_name, "monitor stats reset");
    }

    fn method_stats(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self.methods.read().expect("monitor lock").get(method) {
            return stats.clone();
        }
        self.methods
            .write()
            .expect("monitor lock")
            .entry(method.to_string())
            .or_default()
            .clone()
    }

    fn error_counter(&self, error_type: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.errors.read().expect("monitor lock").get(error_type) {
            return counter.clone();
        }
        self.errors
            .write()
            .expect("monitor lock")
            .entry(error_type.to_string())
            .or_default()
            .clone()
    }
}
