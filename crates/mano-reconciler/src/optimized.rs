//! Optimized reconciler layer.
//!
//! Wraps the base reconciler with a concurrency semaphore, a fingerprint
//! result cache, and an operation batcher for non-critical work. Each
//! optimization can be switched off independently so correctness tests can
//! exercise the bare handler.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use mano_core::types::{VnfResource, VnfType};
use mano_core::{ManoError, Result};

use crate::cache::{ReconcileCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::controller::{ReconcileResult, Reconciler};
use crate::metrics::ReconcilerMetrics;
use crate::store::VnfStore;

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_concurrent: usize,
    pub enable_semaphore: bool,
    pub enable_cache: bool,
    pub enable_batching: bool,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub batch_flush_interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            enable_semaphore: true,
            enable_cache: true,
            enable_batching: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
            batch_flush_interval: Duration::from_secs(5),
        }
    }
}

/// Workloads that must never wait in a batch: RAN functions and anything
/// with a low-latency QoS envelope.
fn is_critical(vnf: &VnfResource) -> bool {
    vnf.spec.vnf_type == VnfType::Ran || vnf.spec.qos.is_low_latency()
}

struct Shared {
    inner: Arc<dyn Reconciler>,
    store: Arc<dyn VnfStore>,
    cache: ReconcileCache,
    semaphore: Arc<Semaphore>,
    metrics: Arc<ReconcilerMetrics>,
    config: OptimizerConfig,
    cancel: CancellationToken,
}

impl Shared {
    /// The non-batched path: cache lookup, then the guarded handler.
    async fn process(&self, key: &str) -> Result<ReconcileResult> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Err(ManoError::Internal(format!("malformed key {key:?}")));
        };
        let Some(vnf) = self.store.get(namespace, name).await? else {
            // resource is gone; drop its cache entry
            self.cache.remove(key);
            return Ok(ReconcileResult::done());
        };

        let fingerprint = vnf.fingerprint();
        let phase = vnf.status.phase;
        // deletion must always reach the finalizer flow, never a cached result
        let cacheable = self.config.enable_cache && !vnf.is_deleting();

        if cacheable {
            if let Some(entry) = self.cache.get(key, fingerprint, phase) {
                self.metrics.record_cache_hit();
                return match entry.error {
                    Some(message) => Err(ManoError::Transient(message)),
                    None => Ok(entry.result),
                };
            }
        }

        self.run_guarded(key, fingerprint, phase, cacheable).await
    }

    async fn run_guarded(
        &self,
        key: &str,
        fingerprint: u64,
        phase: Option<mano_core::types::VnfPhase>,
        cacheable: bool,
    ) -> Result<ReconcileResult> {
        let _permit = if self.config.enable_semaphore {
            let acquired = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ManoError::Cancelled),
                permit = self.semaphore.clone().acquire_owned() => permit,
            };
            Some(acquired.map_err(|_| ManoError::Cancelled)?)
        } else {
            None
        };

        self.metrics.enter_reconcile();
        let start = Instant::now();
        let outcome = self.inner.reconcile(key).await;
        let duration = start.elapsed();
        self.metrics.exit_reconcile();
        self.metrics.record_reconcile(duration, outcome.is_ok());

        if cacheable {
            match &outcome {
                Ok(result) => self.cache.insert(key, fingerprint, phase, *result, None),
                Err(err) => self.cache.insert(
                    key,
                    fingerprint,
                    phase,
                    ReconcileResult::done(),
                    Some(err.to_string()),
                ),
            }
        }
        outcome
    }
}

pub struct OptimizedReconciler {
    shared: Arc<Shared>,
    batch_tx: Option<mpsc::UnboundedSender<String>>,
}

impl OptimizedReconciler {
    pub fn new(
        inner: Arc<dyn Reconciler>,
        store: Arc<dyn VnfStore>,
        metrics: Arc<ReconcilerMetrics>,
        config: OptimizerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner,
            store,
            cache: ReconcileCache::new(config.cache_capacity, config.cache_ttl),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            metrics,
            config: config.clone(),
            cancel: cancel.clone(),
        });

        let batch_tx = if config.enable_batching {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_batcher(shared.clone(), rx, cancel));
            Some(tx)
        } else {
            None
        };

        Self { shared, batch_tx }
    }

    pub fn cache_len(&self) -> usize {
        self.shared.cache.len()
    }
}

/// Collect deferred keys and flush them on the configured interval. Results
/// are not fed back to the workqueue: any phase transition a flush produces
/// re-enters through the watch stream.
async fn run_batcher(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut pending: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(shared.config.batch_flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            key = rx.recv() => match key {
                Some(key) => { pending.insert(key); }
                None => break,
            },
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let batch: Vec<String> = pending.drain().collect();
                tracing::debug!(size = batch.len(), "flushing reconcile batch");
                for key in batch {
                    if let Err(err) = shared.process(&key).await {
                        tracing::warn!(key = %key, error = %err, "batched reconcile failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Reconciler for OptimizedReconciler {
    async fn reconcile(&self, key: &str) -> Result<ReconcileResult> {
        if let Some(batch_tx) = &self.batch_tx {
            let Some((namespace, name)) = key.split_once('/') else {
                return Err(ManoError::Internal(format!("malformed key {key:?}")));
            };
            if let Some(vnf) = self.shared.store.get(namespace, name).await? {
                if !is_critical(&vnf) && !vnf.is_deleting() {
                    if batch_tx.send(key.to_string()).is_ok() {
                        self.shared.metrics.record_batch_operation();
                        return Ok(ReconcileResult::done());
                    }
                }
            }
        }
        self.shared.process(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVnfStore;
    use mano_core::types::{CloudType, Placement, QosRequirements, VnfSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vnf(name: &str, vnf_type: VnfType, latency_ms: f64) -> VnfResource {
        VnfResource::new(
            "slices",
            name,
            VnfSpec {
                vnf_type,
                qos: QosRequirements {
                    bandwidth_mbps: 3.0,
                    latency_ms,
                },
                placement: Placement {
                    cloud_type: CloudType::Regional,
                    site: "reg01".to_string(),
                },
                target_clusters: vec!["reg01".to_string()],
                version: None,
            },
        )
    }

    /// Inner reconciler that records call counts and concurrency without
    /// touching the store.
    struct ProbeInner {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ProbeInner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Reconciler for ProbeInner {
        async fn reconcile(&self, _key: &str) -> Result<ReconcileResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ReconcileResult::after(Duration::from_secs(60)))
        }
    }

    fn optimized(
        inner: Arc<ProbeInner>,
        store: Arc<InMemoryVnfStore>,
        config: OptimizerConfig,
    ) -> (Arc<OptimizedReconciler>, Arc<ReconcilerMetrics>) {
        let metrics = Arc::new(ReconcilerMetrics::new());
        let reconciler = Arc::new(OptimizedReconciler::new(
            inner,
            store,
            metrics.clone(),
            config,
            CancellationToken::new(),
        ));
        (reconciler, metrics)
    }

    #[tokio::test]
    async fn semaphore_caps_concurrency() {
        let store = InMemoryVnfStore::new();
        for i in 0..6 {
            store
                .create(vnf(&format!("cn-{i}"), VnfType::Cn, 8.0))
                .await
                .unwrap();
        }
        let inner = ProbeInner::new(Duration::from_millis(30));
        let (reconciler, metrics) = optimized(
            inner.clone(),
            store,
            OptimizerConfig {
                max_concurrent: 2,
                enable_cache: false,
                ..OptimizerConfig::default()
            },
        );

        let mut handles = Vec::new();
        for i in 0..6 {
            let r = reconciler.clone();
            handles.push(tokio::spawn(async move {
                r.reconcile(&format!("slices/cn-{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(inner.peak.load(Ordering::SeqCst) <= 2);
        assert!(metrics.peak_concurrency() <= 2);
        assert_eq!(metrics.totals().0, 6);
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_the_handler() {
        let store = InMemoryVnfStore::new();
        store.create(vnf("cn-a", VnfType::Cn, 8.0)).await.unwrap();
        let inner = ProbeInner::new(Duration::ZERO);
        let (reconciler, metrics) = optimized(inner.clone(), store, OptimizerConfig::default());

        let first = reconciler.reconcile("slices/cn-a").await.unwrap();
        let second = reconciler.reconcile("slices/cn-a").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.cache_hits(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn disabled_cache_always_runs_the_handler() {
        let store = InMemoryVnfStore::new();
        store.create(vnf("cn-b", VnfType::Cn, 8.0)).await.unwrap();
        let inner = ProbeInner::new(Duration::ZERO);
        let (reconciler, metrics) = optimized(
            inner.clone(),
            store,
            OptimizerConfig {
                enable_cache: false,
                ..OptimizerConfig::default()
            },
        );

        reconciler.reconcile("slices/cn-b").await.unwrap();
        reconciler.reconcile("slices/cn-b").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.cache_hits(), 0);
    }

    #[tokio::test]
    async fn deleted_resource_clears_its_cache_entry() {
        let store = InMemoryVnfStore::new();
        store.create(vnf("cn-c", VnfType::Cn, 8.0)).await.unwrap();
        let inner = ProbeInner::new(Duration::ZERO);
        let (reconciler, _) = optimized(inner, store.clone(), OptimizerConfig::default());

        reconciler.reconcile("slices/cn-c").await.unwrap();
        assert_eq!(reconciler.cache_len(), 1);

        store.delete("slices", "cn-c").await.unwrap();
        let result = reconciler.reconcile("slices/cn-c").await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert_eq!(reconciler.cache_len(), 0);
    }

    #[tokio::test]
    async fn non_critical_work_is_batched_and_flushed() {
        let store = InMemoryVnfStore::new();
        store.create(vnf("cn-d", VnfType::Cn, 9.0)).await.unwrap();
        let inner = ProbeInner::new(Duration::ZERO);
        let (reconciler, metrics) = optimized(
            inner.clone(),
            store,
            OptimizerConfig {
                enable_batching: true,
                enable_cache: false,
                batch_flush_interval: Duration::from_millis(30),
                ..OptimizerConfig::default()
            },
        );

        let result = reconciler.reconcile("slices/cn-d").await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.batch_operations(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_work_bypasses_the_batcher() {
        let store = InMemoryVnfStore::new();
        store.create(vnf("ran-a", VnfType::Ran, 2.0)).await.unwrap();
        let inner = ProbeInner::new(Duration::ZERO);
        let (reconciler, metrics) = optimized(
            inner.clone(),
            store,
            OptimizerConfig {
                enable_batching: true,
                enable_cache: false,
                ..OptimizerConfig::default()
            },
        );

        reconciler.reconcile("slices/ran-a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.batch_operations(), 0);
    }
}
