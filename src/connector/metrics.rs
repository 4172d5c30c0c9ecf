//! Metric instruments for connector executors, tagged by tenant.
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Meter, ObservableGauge};
use tracing::debug;

use crate::persistence::TenantId;

pub const SUBMITTED: &str = "helm.connectors.executor.submitted";
pub const RUNNING: &str = "helm.connectors.executor.running";
pub const PENDING: &str = "helm.connectors.executor.pending";
pub const COMPLETED: &str = "helm.connectors.executor.completed";

/// Where a registered instrument reads its value from.
#[derive(Clone)]
pub enum MetricSource {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<dyn Fn() -> u64 + Send + Sync>),
}

impl MetricSource {
    pub fn read(&self) -> u64 {
        match self {
            MetricSource::Counter(c) => c.load(Ordering::SeqCst),
            MetricSource::Gauge(f) => f(),
        }
    }
}

impl Debug for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSource::Counter(c) => write!(f, "Counter({})", c.load(Ordering::SeqCst)),
            MetricSource::Gauge(_) => f.write_str("Gauge(<fn>)"),
        }
    }
}

pub trait MetricsRegistry: Send + Sync + Debug {
    fn register(&self, name: &str, tenant_id: TenantId, source: MetricSource);
    fn unregister(&self, name: &str, tenant_id: TenantId);
    /// Current value of a registered instrument.
    fn value(&self, name: &str, tenant_id: TenantId) -> Option<u64>;
}

type Instruments = DashMap<(String, TenantId), MetricSource>;

#[derive(Debug, Default)]
pub struct InMemoryMetricsRegistry {
    instruments: Instruments,
}

impl InMemoryMetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self, name: &str, tenant_id: TenantId) -> bool {
        self.instruments.contains_key(&(name.to_string(), tenant_id))
    }
}

impl MetricsRegistry for InMemoryMetricsRegistry {
    fn register(&self, name: &str, tenant_id: TenantId, source: MetricSource) {
        self.instruments.insert((name.to_string(), tenant_id), source);
    }

    fn unregister(&self, name: &str, tenant_id: TenantId) {
        self.instruments.remove(&(name.to_string(), tenant_id));
    }

    fn value(&self, name: &str, tenant_id: TenantId) -> Option<u64> {
        self.instruments
            .get(&(name.to_string(), tenant_id))
            .map(|s| s.value().read())
    }
}

/// Exposes every registered instrument as an OpenTelemetry observable gauge with a
/// `tenant_id` attribute. Unregistered instruments simply stop being observed.
pub struct OtelMetricsRegistry {
    meter: Meter,
    instruments: Arc<Instruments>,
    gauges: DashMap<String, ObservableGauge<u64>>,
}

impl OtelMetricsRegistry {
    pub fn new(meter: Meter) -> Arc<Self> {
        Arc::new(Self {
            meter,
            instruments: Arc::new(DashMap::new()),
            gauges: DashMap::new(),
        })
    }

    /// Registry on the globally installed meter provider.
    pub fn global() -> Arc<Self> {
        Self::new(opentelemetry::global::meter("helm"))
    }

    fn ensure_gauge(&self, name: &str) {
        if self.gauges.contains_key(name) {
            return;
        }
        let instruments = Arc::clone(&self.instruments);
        let metric = name.to_string();
        let gauge = self
            .meter
            .u64_observable_gauge(name.to_string())
            .with_callback(move |observer| {
                for entry in instruments.iter() {
                    let (instrument, tenant_id) = entry.key();
                    if instrument == &metric {
                        observer.observe(
                            entry.value().read(),
                            &[KeyValue::new("tenant_id", *tenant_id as i64)],
                        );
                    }
                }
            })
            .build();
        debug!("observable gauge `{}` created", name);
        self.gauges.insert(name.to_string(), gauge);
    }
}

impl Debug for OtelMetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelMetricsRegistry")
            .field("instruments", &self.instruments.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

impl MetricsRegistry for OtelMetricsRegistry {
    fn register(&self, name: &str, tenant_id: TenantId, source: MetricSource) {
        self.instruments.insert((name.to_string(), tenant_id), source);
        self.ensure_gauge(name);
    }

    fn unregister(&self, name: &str, tenant_id: TenantId) {
        self.instruments.remove(&(name.to_string(), tenant_id));
    }

    fn value(&self, name: &str, tenant_id: TenantId) -> Option<u64> {
        self.instruments
            .get(&(name.to_string(), tenant_id))
            .map(|s| s.value().read())
    }
}

/// Counters of one pool generation of one tenant executor.
///
/// pending is derived: submitted - running - completed.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    submitted: Arc<AtomicU64>,
    running: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub running: u64,
    pub pending: u64,
    pub completed: u64,
}

impl ExecutorMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// A submission that never reached a worker (queue closed under it).
    pub(crate) fn on_withdrawn(&self) {
        self.submitted.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn on_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn on_finished(&self) {
        // completed first so pending never dips below zero for a reader in between
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        let submitted = self.submitted();
        let running = self.running();
        let completed = self.completed();
        submitted.saturating_sub(running + completed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted(),
            running: self.running(),
            pending: self.pending(),
            completed: self.completed(),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, registry: &dyn MetricsRegistry, tenant_id: TenantId) {
        registry.register(SUBMITTED, tenant_id, MetricSource::Counter(self.submitted.clone()));
        registry.register(RUNNING, tenant_id, MetricSource::Counter(self.running.clone()));
        registry.register(COMPLETED, tenant_id, MetricSource::Counter(self.completed.clone()));
        let me = Arc::clone(self);
        registry.register(PENDING, tenant_id, MetricSource::Gauge(Arc::new(move || me.pending())));
    }

    pub(crate) fn unregister(registry: &dyn MetricsRegistry, tenant_id: TenantId) {
        for name in [SUBMITTED, RUNNING, PENDING, COMPLETED] {
            registry.unregister(name, tenant_id);
        }
    }
}
