pub mod builtin;
pub mod executor;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod task;

pub use executor::{ConnectorHandle, ExecutorConfig, ExecutorError, ExecutorState, TaskExecutor};
pub use metrics::{ExecutorMetrics, InMemoryMetricsRegistry, MetricsRegistry, MetricsSnapshot, OtelMetricsRegistry};
pub use registry::{ConnectorFactory, ConnectorRegistry};
pub use service::ConnectorExecutorService;
pub use task::{ConnectorError, ConnectorOutputs, ConnectorParameters, ConnectorResult, ConnectorTask, ExecutionContext};
