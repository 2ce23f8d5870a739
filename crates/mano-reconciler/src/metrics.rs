//! Reconciler metrics, all updated under one mutex.

use std::sync::Mutex;
use std::time::Duration;

use mano_core::metrics::PrometheusText;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_reconciles: u64,
    successful_reconciles: u64,
    failed_reconciles: u64,
    cache_hits: u64,
    batch_operations: u64,
    total_duration_ms: u64,
    current_concurrency: u64,
    peak_concurrency: u64,
}

#[derive(Debug, Default)]
pub struct ReconcilerMetrics {
    counters: Mutex<Counters>,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reconcile counts as successful only when the handler returned Ok.
    pub fn record_reconcile(&self, duration: Duration, success: bool) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.total_reconciles += 1;
        if success {
            c.successful_reconciles += 1;
        } else {
            c.failed_reconciles += 1;
        }
        c.total_duration_ms += duration.as_millis() as u64;
    }

    pub fn record_cache_hit(&self) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.cache_hits += 1;
    }

    pub fn record_batch_operation(&self) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.batch_operations += 1;
    }

    pub fn enter_reconcile(&self) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.current_concurrency += 1;
        c.peak_concurrency = c.peak_concurrency.max(c.current_concurrency);
    }

    pub fn exit_reconcile(&self) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.current_concurrency = c.current_concurrency.saturating_sub(1);
    }

    pub fn current_concurrency(&self) -> u64 {
        self.counters.lock().expect("metrics lock poisoned").current_concurrency
    }

    pub fn peak_concurrency(&self) -> u64 {
        self.counters.lock().expect("metrics lock poisoned").peak_concurrency
    }

    pub fn cache_hits(&self) -> u64 {
        self.counters.lock().expect("metrics lock poisoned").cache_hits
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        let c = self.counters.lock().expect("metrics lock poisoned");
        (
            c.total_reconciles,
            c.successful_reconciles,
            c.failed_reconciles,
        )
    }

    pub fn batch_operations(&self) -> u64 {
        self.counters.lock().expect("metrics lock poisoned").batch_operations
    }

    pub fn average_duration_ms(&self) -> f64 {
        let c = self.counters.lock().expect("metrics lock poisoned");
        if c.total_reconciles == 0 {
            0.0
        } else {
            c.total_duration_ms as f64 / c.total_reconciles as f64
        }
    }

    pub fn render(&self) -> String {
        let c = *self.counters.lock().expect("metrics lock poisoned");
        let mut page = PrometheusText::new();
        page.counter(
            "mano_reconcile_total",
            "Total reconcile invocations",
            c.total_reconciles,
        )
        .counter(
            "mano_reconcile_success_total",
            "Reconciles whose handler returned Ok",
            c.successful_reconciles,
        )
        .counter(
            "mano_reconcile_failure_total",
            "Reconciles whose handler returned an error",
            c.failed_reconciles,
        )
        .counter(
            "mano_reconcile_cache_hits_total",
            "Reconciles answered from the result cache",
            c.cache_hits,
        )
        .counter(
            "mano_reconcile_batch_operations_total",
            "Reconciles deferred into the batcher",
            c.batch_operations,
        )
        .gauge(
            "mano_reconcile_duration_avg_ms",
            "Average reconcile duration",
            if c.total_reconciles == 0 {
                0.0
            } else {
                c.total_duration_ms as f64 / c.total_reconciles as f64
            },
        )
        .gauge(
            "mano_reconcile_concurrency",
            "Reconciles currently in flight",
            c.current_concurrency as f64,
        )
        .gauge(
            "mano_reconcile_concurrency_peak",
            "Peak concurrent reconciles",
            c.peak_concurrency as f64,
        );
        page.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_success_and_failure() {
        let metrics = ReconcilerMetrics::new();
        metrics.record_reconcile(Duration::from_millis(10), true);
        metrics.record_reconcile(Duration::from_millis(30), false);
        let (total, ok, failed) = metrics.totals();
        assert_eq!((total, ok, failed), (2, 1, 1));
        assert!((metrics.average_duration_ms() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrency_gauge_tracks_peak() {
        let metrics = ReconcilerMetrics::new();
        metrics.enter_reconcile();
        metrics.enter_reconcile();
        metrics.exit_reconcile();
        metrics.enter_reconcile();
        assert_eq!(metrics.current_concurrency(), 2);
        assert_eq!(metrics.peak_concurrency(), 2);
    }

    #[test]
    fn render_emits_prometheus_text() {
        let metrics = ReconcilerMetrics::new();
        metrics.record_cache_hit();
        let text = metrics.render();
        assert!(text.contains("mano_reconcile_cache_hits_total 1"));
        assert!(text.contains("# TYPE mano_reconcile_total counter"));
    }
}
