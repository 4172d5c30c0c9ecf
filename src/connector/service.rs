//! Owns one [`TaskExecutor`] per tenant and follows the node lifecycle.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use super::executor::{ConnectorHandle, ExecutorConfig, ExecutorError, ExecutorState, TaskExecutor};
use super::metrics::{InMemoryMetricsRegistry, MetricsRegistry, MetricsSnapshot};
use super::task::{ConnectorParameters, ConnectorTask, ExecutionContext};
use crate::lifecycle::LifecycleService;
use crate::persistence::TenantId;

#[derive(Debug)]
pub struct ConnectorExecutorService {
    config: ExecutorConfig,
    metrics: Arc<dyn MetricsRegistry>,
    executors: DashMap<TenantId, Arc<TaskExecutor>>,
    // tenants paused on their own, left paused when the node starts again
    paused_tenants: DashSet<TenantId>,
    running: AtomicBool,
}

impl ConnectorExecutorService {
    pub const NAME: &'static str = "connector-executor";

    pub fn new(config: ExecutorConfig, metrics: Arc<dyn MetricsRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            metrics,
            executors: DashMap::new(),
            paused_tenants: DashSet::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Service with in-memory metrics only.
    pub fn standalone(config: ExecutorConfig) -> Arc<Self> {
        Self::new(config, InMemoryMetricsRegistry::new())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn executor(&self, tenant_id: TenantId) -> Option<Arc<TaskExecutor>> {
        self.executors.get(&tenant_id).map(|e| Arc::clone(e.value()))
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.executors.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn metrics(&self, tenant_id: TenantId) -> Option<MetricsSnapshot> {
        self.executor(tenant_id).map(|e| e.metrics())
    }

    fn executor_or_create(&self, tenant_id: TenantId) -> Arc<TaskExecutor> {
        let entry = self.executors.entry(tenant_id).or_insert_with(|| {
            debug!("creating connector executor for tenant {}", tenant_id);
            Arc::new(TaskExecutor::new(tenant_id, self.config, Arc::clone(&self.metrics)))
        });
        Arc::clone(entry.value())
    }

    fn should_run(&self, tenant_id: TenantId) -> bool {
        self.is_running() && !self.paused_tenants.contains(&tenant_id)
    }

    /// Queues a connector on the tenant's executor, creating and starting it on first use.
    pub async fn submit(
        &self,
        task: Box<dyn ConnectorTask>,
        parameters: ConnectorParameters,
        context: ExecutionContext,
    ) -> Result<ConnectorHandle, ExecutorError> {
        let tenant_id = context.tenant_id;
        let executor = self.executor_or_create(tenant_id);
        if executor.state() == ExecutorState::Created && self.should_run(tenant_id) {
            executor.start().await;
        }
        executor.execute(task, parameters, context)
    }

    pub async fn pause_tenant(&self, tenant_id: TenantId) {
        self.paused_tenants.insert(tenant_id);
        if let Some(executor) = self.executor(tenant_id) {
            executor.pause().await;
        }
    }

    pub async fn resume_tenant(&self, tenant_id: TenantId) {
        self.paused_tenants.remove(&tenant_id);
        if !self.is_running() {
            return;
        }
        if let Some(executor) = self.executor(tenant_id) {
            match executor.state() {
                ExecutorState::Paused => executor.resume().await,
                ExecutorState::Created => executor.start().await,
                _ => {}
            }
        }
    }

    /// Stops the tenant's executor, letting queued work finish, and forgets it.
    pub async fn remove_tenant(&self, tenant_id: TenantId) {
        self.paused_tenants.remove(&tenant_id);
        if let Some((_, executor)) = self.executors.remove(&tenant_id) {
            executor.stop().await;
            info!("connector executor of tenant {} removed", tenant_id);
        }
    }

    /// Stops every executor for good.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let executors = self.snapshot();
        self.executors.clear();
        futures::future::join_all(executors.iter().map(|e| e.stop())).await;
        info!("connector executors shut down ({})", executors.len());
    }

    fn snapshot(&self) -> Vec<Arc<TaskExecutor>> {
        self.executors.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[async_trait]
impl LifecycleService for ConnectorExecutorService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        for executor in self.snapshot() {
            if self.paused_tenants.contains(&executor.tenant_id()) {
                continue;
            }
            match executor.state() {
                ExecutorState::Created => executor.start().await,
                ExecutorState::Paused => executor.resume().await,
                _ => {}
            }
        }
        Ok(())
    }

    /// Pauses every executor: queued connectors are discarded, running ones finish.
    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        futures::future::join_all(self.snapshot().iter().map(|e| e.pause())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::builtin::EchoConnector;
    use serde_json::json;
    use std::collections::HashMap;

    fn service() -> Arc<ConnectorExecutorService> {
        ConnectorExecutorService::standalone(ExecutorConfig {
            pool_size: 2,
            queue_capacity: None,
        })
    }

    fn echo() -> Box<dyn ConnectorTask> {
        Box::new(EchoConnector::default())
    }

    fn params() -> ConnectorParameters {
        HashMap::from([("k".to_string(), json!("v"))])
    }

    #[tokio::test]
    async fn test_submit_creates_executor_lazily() {
        let service = service();
        service.start().await.unwrap();
        assert!(service.tenants().is_empty());

        let result = service
            .submit(echo(), params(), ExecutionContext::for_tenant(5))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.outputs["k"], json!("v"));
        assert_eq!(service.tenants(), vec![5]);
        assert_eq!(service.metrics(5).unwrap().completed, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_before_start_is_rejected() {
        let service = service();
        let err = service
            .submit(echo(), params(), ExecutionContext::for_tenant(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotRunning { state: ExecutorState::Created, .. }));
    }

    #[tokio::test]
    async fn test_node_stop_pauses_and_start_resumes() {
        let service = service();
        service.start().await.unwrap();
        service
            .submit(echo(), params(), ExecutionContext::for_tenant(1))
            .await
            .unwrap()
            .await
            .unwrap();

        service.stop().await.unwrap();
        assert_eq!(service.executor(1).unwrap().state(), ExecutorState::Paused);

        service.start().await.unwrap();
        let executor = service.executor(1).unwrap();
        assert_eq!(executor.state(), ExecutorState::Running);
        assert_eq!(executor.metrics(), MetricsSnapshot::default());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_paused_tenant_survives_node_restart() {
        let service = service();
        service.start().await.unwrap();
        service
            .submit(echo(), params(), ExecutionContext::for_tenant(1))
            .await
            .unwrap()
            .await
            .unwrap();
        service.pause_tenant(1).await;

        service.stop().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.executor(1).unwrap().state(), ExecutorState::Paused);
        assert!(service.submit(echo(), params(), ExecutionContext::for_tenant(1)).await.is_err());

        service.resume_tenant(1).await;
        assert_eq!(service.executor(1).unwrap().state(), ExecutorState::Running);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_tenant_stops_executor() {
        let service = service();
        service.start().await.unwrap();
        let handle = service
            .submit(echo(), params(), ExecutionContext::for_tenant(9))
            .await
            .unwrap();
        let executor = service.executor(9).unwrap();

        service.remove_tenant(9).await;
        assert!(handle.await.is_ok());
        assert_eq!(executor.state(), ExecutorState::Stopped);
        assert!(service.executor(9).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let service = service();
        service.start().await.unwrap();
        for tenant in 1..=3 {
            let _ = service
                .submit(echo(), params(), ExecutionContext::for_tenant(tenant))
                .await
                .unwrap();
        }
        let executors: Vec<_> = (1..=3).filter_map(|t| service.executor(t)).collect();
        service.shutdown().await;
        assert!(service.tenants().is_empty());
        assert!(executors.iter().all(|e| e.state() == ExecutorState::Stopped));
    }
}
