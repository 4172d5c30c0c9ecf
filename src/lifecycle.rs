//! Node start/stop, tenant transitions and connector submission.
//!
//! The orchestrator never holds a lock while a subordinate service runs: concurrent
//! start/stop attempts are settled by the [`StateGate`] alone.
use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::connector::{
    ConnectorError, ConnectorExecutorService, ConnectorHandle, ConnectorParameters, ConnectorRegistry, ConnectorTask,
    ExecutionContext, ExecutorConfig, ExecutorError,
};
use crate::logger::EVENT_TARGET;
use crate::persistence::{PersistenceError, PersistenceReader, TenantId, TenantStatus};
use crate::state::{NodeState, StateGate};
use crate::tenant::{TenantError, TenantManagerFactory};
use crate::version::{VersionCheck, VersionGate};

/// A platform service started and stopped with the node.
#[async_trait]
pub trait LifecycleService: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error("node is {0}, connectors can only run on a started node")]
    NodeNotStarted(NodeState),
    #[error("cluster is inconsistent: {0}")]
    ClusterInconsistent(String),
    #[error("service `{service}` failed")]
    Subordinate {
        service: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl From<PersistenceError> for LifecycleError {
    fn from(err: PersistenceError) -> Self {
        LifecycleError::Tenant(err.into())
    }
}

#[derive(Debug)]
pub struct LifecycleOrchestrator {
    gate: StateGate,
    version_gate: Arc<VersionGate>,
    services: Vec<Arc<dyn LifecycleService>>,
    persistence: Arc<dyn PersistenceReader>,
    tenants: Arc<dyn TenantManagerFactory>,
    connectors: Arc<ConnectorExecutorService>,
    registry: ConnectorRegistry,
}

pub struct LifecycleOrchestratorBuilder {
    gate: StateGate,
    version_gate: Arc<VersionGate>,
    persistence: Arc<dyn PersistenceReader>,
    tenants: Arc<dyn TenantManagerFactory>,
    services: Vec<Arc<dyn LifecycleService>>,
    connectors: Option<Arc<ConnectorExecutorService>>,
    registry: Option<ConnectorRegistry>,
}

impl LifecycleOrchestratorBuilder {
    /// Services start in the order they are added and stop in reverse.
    pub fn service(mut self, service: Arc<dyn LifecycleService>) -> Self {
        self.services.push(service);
        self
    }

    /// Also registers the executor service as a lifecycle service at this position.
    pub fn connectors(mut self, connectors: Arc<ConnectorExecutorService>) -> Self {
        self.services.push(connectors.clone());
        self.connectors = Some(connectors);
        self
    }

    pub fn registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Without explicit connectors a default executor service is appended last.
    pub fn build(mut self) -> LifecycleOrchestrator {
        let connectors = match self.connectors {
            Some(connectors) => connectors,
            None => {
                let connectors = ConnectorExecutorService::standalone(ExecutorConfig::default());
                self.services.push(connectors.clone());
                connectors
            }
        };
        LifecycleOrchestrator {
            gate: self.gate,
            version_gate: self.version_gate,
            services: self.services,
            persistence: self.persistence,
            tenants: self.tenants,
            connectors,
            registry: self.registry.unwrap_or_else(ConnectorRegistry::with_builtins),
        }
    }
}

impl LifecycleOrchestrator {
    pub fn builder(
        gate: StateGate,
        version_gate: Arc<VersionGate>,
        persistence: Arc<dyn PersistenceReader>,
        tenants: Arc<dyn TenantManagerFactory>,
    ) -> LifecycleOrchestratorBuilder {
        LifecycleOrchestratorBuilder {
            gate,
            version_gate,
            persistence,
            tenants,
            services: Vec::new(),
            connectors: None,
            registry: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.gate.state()
    }

    pub fn gate(&self) -> &StateGate {
        &self.gate
    }

    pub fn connectors(&self) -> &Arc<ConnectorExecutorService> {
        &self.connectors
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// `Ok(false)` when the node is not STOPPED; nothing else happens then.
    ///
    /// On error the node stays STARTING and the remaining services are not started.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<bool, LifecycleError> {
        if !self.gate.initialize_start() {
            return Ok(false);
        }
        info!("starting node");

        let check = self.version_gate.check().await;
        if !check.ok {
            return Err(LifecycleError::ClusterInconsistent(check.message));
        }

        for service in &self.services {
            info!("starting service `{}`", service.name());
            if let Err(e) = service.start().await {
                error!("service `{}` failed to start: {:#}", service.name(), e);
                return Err(LifecycleError::Subordinate {
                    service: service.name().to_string(),
                    source: e.into(),
                });
            }
        }

        self.gate.set_started();
        info!(target: EVENT_TARGET, event = "node_started", "node started");
        Ok(true)
    }

    /// `Ok(false)` when the node is not STARTED. On error the node stays STOPPING.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        if !self.gate.initialize_stop() {
            return Ok(false);
        }
        info!("stopping node");

        for service in self.services.iter().rev() {
            info!("stopping service `{}`", service.name());
            if let Err(e) = service.stop().await {
                error!("service `{}` failed to stop: {:#}", service.name(), e);
                return Err(LifecycleError::Subordinate {
                    service: service.name().to_string(),
                    source: e.into(),
                });
            }
        }

        self.gate.set_stopped();
        info!(target: EVENT_TARGET, event = "node_stopped", "node stopped");
        Ok(true)
    }

    /// Stops the node if it runs, then every connector executor for good.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        if self.gate.state() == NodeState::Started {
            self.stop().await?;
        }
        self.connectors.shutdown().await;
        Ok(())
    }

    pub async fn check_cluster_version_consistency(&self) -> VersionCheck {
        self.version_gate.check().await
    }

    async fn tenant_status(&self, tenant_id: TenantId) -> Result<TenantStatus, LifecycleError> {
        Ok(self.persistence.tenant(tenant_id).await?.status)
    }

    #[tracing::instrument(skip(self))]
    pub async fn activate_tenant(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        match self.tenant_status(tenant_id).await? {
            TenantStatus::Deactivated => {}
            _ => {
                warn!("tenant {} is already activated", tenant_id);
                return Err(TenantError::AlreadyActivated(tenant_id).into());
            }
        }
        self.tenants.for_tenant(tenant_id).activate().await?;
        info!(target: EVENT_TARGET, event = "tenant_activated", tenant_id, "tenant {} activated", tenant_id);
        Ok(())
    }

    /// Running connectors of the tenant finish before this returns.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate_tenant(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        match self.tenant_status(tenant_id).await? {
            TenantStatus::Activated => {}
            TenantStatus::Deactivated => {
                warn!("tenant {} is already deactivated", tenant_id);
                return Err(TenantError::AlreadyDeactivated(tenant_id).into());
            }
            status => {
                return Err(TenantError::NotActivated { id: tenant_id, status }.into());
            }
        }
        self.tenants.for_tenant(tenant_id).deactivate().await?;
        self.connectors.remove_tenant(tenant_id).await;
        info!(target: EVENT_TARGET, event = "tenant_deactivated", tenant_id, "tenant {} deactivated", tenant_id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn pause_tenant(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        let status = self.tenant_status(tenant_id).await?;
        if status != TenantStatus::Activated {
            return Err(TenantError::NotActivated { id: tenant_id, status }.into());
        }
        self.tenants.for_tenant(tenant_id).pause().await?;
        self.connectors.pause_tenant(tenant_id).await;
        info!(target: EVENT_TARGET, event = "tenant_paused", tenant_id, "tenant {} paused", tenant_id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn resume_tenant(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        let status = self.tenant_status(tenant_id).await?;
        if status != TenantStatus::Paused {
            return Err(TenantError::NotPaused { id: tenant_id, status }.into());
        }
        self.tenants.for_tenant(tenant_id).resume().await?;
        self.connectors.resume_tenant(tenant_id).await;
        info!(target: EVENT_TARGET, event = "tenant_resumed", tenant_id, "tenant {} resumed", tenant_id);
        Ok(())
    }

    pub async fn submit_connector_task(
        &self,
        tenant_id: TenantId,
        task: Box<dyn ConnectorTask>,
        parameters: ConnectorParameters,
    ) -> Result<ConnectorHandle, LifecycleError> {
        self.submit_with_context(ExecutionContext::for_tenant(tenant_id), task, parameters)
            .await
    }

    /// Resolves `connector_type` through the registry and submits a fresh instance.
    pub async fn submit_registered_connector(
        &self,
        context: ExecutionContext,
        connector_type: &str,
        parameters: ConnectorParameters,
    ) -> Result<ConnectorHandle, LifecycleError> {
        let task = self.registry.create(connector_type)?;
        let context = match context.connector_definition {
            Some(_) => context,
            None => context.with_definition(connector_type),
        };
        self.submit_with_context(context, task, parameters).await
    }

    pub async fn submit_with_context(
        &self,
        context: ExecutionContext,
        task: Box<dyn ConnectorTask>,
        parameters: ConnectorParameters,
    ) -> Result<ConnectorHandle, LifecycleError> {
        let state = self.gate.state();
        if state != NodeState::Started {
            return Err(LifecycleError::NodeNotStarted(state));
        }
        let status = self.tenant_status(context.tenant_id).await?;
        if status != TenantStatus::Activated {
            return Err(TenantError::NotActivated {
                id: context.tenant_id,
                status,
            }
            .into());
        }
        Ok(self.connectors.submit(task, parameters, context).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::cluster::SingleNode;
    use crate::connector::ConnectorResult;
    use crate::connector::builtin::EchoConnector;
    use crate::persistence::{InMemoryPersistence, PlatformVersionInfo, TenantRecord};
    use crate::tenant::StatusTenantManagerFactory;
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct RecordingService {
        name: String,
        calls: Calls,
        fail_start: bool,
        fail_stop: bool,
    }

    impl RecordingService {
        fn new(name: &str, calls: &Calls) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: calls.clone(),
                fail_start: false,
                fail_stop: false,
            })
        }

        fn failing_start(name: &str, calls: &Calls) -> Arc<Self> {
            Arc::new(Self {
                fail_start: true,
                ..Arc::into_inner(Self::new(name, calls)).unwrap()
            })
        }

        fn failing_stop(name: &str, calls: &Calls) -> Arc<Self> {
            Arc::new(Self {
                fail_stop: true,
                ..Arc::into_inner(Self::new(name, calls)).unwrap()
            })
        }
    }

    #[async_trait]
    impl LifecycleService for RecordingService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("start {}", self.name));
            if self.fail_start {
                return Err(anyhow!("{} could not bind", self.name));
            }
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err(anyhow!("{} could not flush", self.name));
            }
            Ok(())
        }
    }

    fn store(binary: &str, schema: &str) -> Arc<InMemoryPersistence> {
        InMemoryPersistence::new(
            PlatformVersionInfo {
                platform_version: binary.into(),
                db_schema_version: schema.into(),
                initial_version: schema.into(),
            },
            vec![
                TenantRecord::new(1, "default", TenantStatus::Activated),
                TenantRecord::new(2, "acme", TenantStatus::Deactivated),
            ],
        )
    }

    fn builder(store: Arc<InMemoryPersistence>) -> LifecycleOrchestratorBuilder {
        let gate = StateGate::new();
        let version_gate = VersionGate::new(
            "n1",
            store.clone(),
            Arc::new(SingleNode),
            TieredCache::standalone(Duration::from_secs(60)),
        );
        LifecycleOrchestrator::builder(
            gate,
            Arc::new(version_gate),
            store.clone(),
            StatusTenantManagerFactory::new(store),
        )
    }

    fn orchestrator(calls: &Calls) -> LifecycleOrchestrator {
        builder(store("7.11.0", "7.11"))
            .service(RecordingService::new("scheduler", calls))
            .service(RecordingService::new("work", calls))
            .build()
    }

    fn echo() -> Box<dyn ConnectorTask> {
        Box::new(EchoConnector::default())
    }

    fn calls() -> Calls {
        Arc::new(Mutex::new(vec![]))
    }

    #[tokio::test]
    async fn test_start_and_stop_order() {
        let calls = calls();
        let node = orchestrator(&calls);
        assert!(node.start().await.unwrap());
        assert_eq!(node.state(), NodeState::Started);
        assert!(node.stop().await.unwrap());
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["start scheduler", "start work", "stop work", "stop scheduler"]
        );
    }

    #[tokio::test]
    async fn test_stop_on_stopped_node_does_nothing() {
        let calls = calls();
        let node = orchestrator(&calls);
        assert!(!node.stop().await.unwrap());
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_refused() {
        let calls = calls();
        let node = orchestrator(&calls);
        assert!(node.start().await.unwrap());
        assert!(!node.start().await.unwrap());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_starts_single_winner() {
        let calls = calls();
        let node = Arc::new(orchestrator(&calls));
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                tokio::spawn(async move { node.start().await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_service_aborts_start() {
        let calls = calls();
        let node = builder(store("7.11.0", "7.11"))
            .service(RecordingService::new("scheduler", &calls))
            .service(RecordingService::failing_start("work", &calls))
            .service(RecordingService::new("api", &calls))
            .build();

        let err = node.start().await.unwrap_err();
        match err {
            LifecycleError::Subordinate { service, source } => {
                assert_eq!(service, "work");
                assert!(source.to_string().contains("could not bind"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*calls.lock().unwrap(), vec!["start scheduler", "start work"]);
        assert_eq!(node.state(), NodeState::Starting);
    }

    #[tokio::test]
    async fn test_failing_stop_leaves_node_stopping() {
        let calls = calls();
        let node = builder(store("7.11.0", "7.11"))
            .service(RecordingService::failing_stop("scheduler", &calls))
            .service(RecordingService::new("work", &calls))
            .build();
        node.start().await.unwrap();
        assert!(matches!(node.stop().await, Err(LifecycleError::Subordinate { .. })));
        assert_eq!(node.state(), NodeState::Stopping);
    }

    #[tokio::test]
    async fn test_version_mismatch_blocks_start() {
        let calls = calls();
        let node = builder(store("7.12.0", "7.11"))
            .service(RecordingService::new("scheduler", &calls))
            .build();
        let err = node.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ClusterInconsistent(ref m) if m.contains("7.12.0")));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(node.state(), NodeState::Starting);
        assert!(!node.check_cluster_version_consistency().await.ok);
    }

    #[tokio::test]
    async fn test_tenant_transitions() {
        let node = orchestrator(&calls());
        assert!(matches!(
            node.activate_tenant(1).await,
            Err(LifecycleError::Tenant(TenantError::AlreadyActivated(1)))
        ));
        assert!(matches!(
            node.deactivate_tenant(2).await,
            Err(LifecycleError::Tenant(TenantError::AlreadyDeactivated(2)))
        ));
        assert!(matches!(
            node.activate_tenant(42).await,
            Err(LifecycleError::Tenant(TenantError::NotFound(42)))
        ));

        node.activate_tenant(2).await.unwrap();
        node.deactivate_tenant(1).await.unwrap();
        assert!(matches!(
            node.activate_tenant(2).await,
            Err(LifecycleError::Tenant(TenantError::AlreadyActivated(2)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_activations_single_winner() {
        let node = Arc::new(orchestrator(&calls()));
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                tokio::spawn(async move { node.activate_tenant(2).await })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => winners += 1,
                Err(LifecycleError::Tenant(TenantError::AlreadyActivated(2))) => {}
                Err(e) => panic!("unexpected activation error: {}", e),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_submit_requires_started_node_and_active_tenant() {
        let node = orchestrator(&calls());
        let params: ConnectorParameters = HashMap::from([("a".to_string(), json!(1))]);

        assert!(matches!(
            node.submit_connector_task(1, echo(), params.clone()).await,
            Err(LifecycleError::NodeNotStarted(NodeState::Stopped))
        ));

        node.start().await.unwrap();
        let result: ConnectorResult = node
            .submit_connector_task(1, echo(), params.clone())
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.outputs["a"], json!(1));

        assert!(matches!(
            node.submit_connector_task(2, echo(), params.clone()).await,
            Err(LifecycleError::Tenant(TenantError::NotActivated { id: 2, .. }))
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume_tenant() {
        let node = orchestrator(&calls());
        node.start().await.unwrap();
        let params = ConnectorParameters::new();
        node.submit_connector_task(1, echo(), params.clone()).await.unwrap().await.unwrap();

        node.pause_tenant(1).await.unwrap();
        assert!(matches!(
            node.pause_tenant(1).await,
            Err(LifecycleError::Tenant(TenantError::NotActivated { .. }))
        ));
        assert!(node.submit_connector_task(1, echo(), params.clone()).await.is_err());

        node.resume_tenant(1).await.unwrap();
        assert!(matches!(
            node.resume_tenant(1).await,
            Err(LifecycleError::Tenant(TenantError::NotPaused { .. }))
        ));
        // counters restart with the new pool
        assert_eq!(node.connectors().metrics(1).unwrap().completed, 0);
        node.submit_connector_task(1, echo(), params).await.unwrap().await.unwrap();
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registered_connector_and_unknown_type() {
        let node = orchestrator(&calls());
        node.start().await.unwrap();
        let result = node
            .submit_registered_connector(
                ExecutionContext::for_tenant(1),
                "echo",
                HashMap::from([("x".to_string(), json!("y"))]),
            )
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.outputs["x"], json!("y"));

        assert!(matches!(
            node.submit_registered_connector(ExecutionContext::for_tenant(1), "smtp", HashMap::new())
                .await,
            Err(LifecycleError::Connector(ConnectorError::UnknownType(_)))
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivation_stops_executor() {
        let node = orchestrator(&calls());
        node.start().await.unwrap();
        node.submit_connector_task(1, echo(), ConnectorParameters::new())
            .await
            .unwrap()
            .await
            .unwrap();
        let executor = node.connectors().executor(1).unwrap();
        node.deactivate_tenant(1).await.unwrap();
        assert_eq!(executor.state(), crate::connector::ExecutorState::Stopped);
        assert!(node.connectors().executor(1).is_none());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_started_node() {
        let calls = calls();
        let node = orchestrator(&calls);
        node.start().await.unwrap();
        node.shutdown().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(calls.lock().unwrap().contains(&"stop scheduler".to_string()));
    }
}
