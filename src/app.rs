//! Wires one node together from its settings.
use std::sync::Arc;

use tracing::info;

use crate::cache::{ClusterCacheStore, TieredCache};
use crate::cluster::{Broadcast, ClusterBroadcast, LocalCluster, NodeCommandHandler, SingleNode};
use crate::config::NodeSettings;
use crate::connector::{ConnectorExecutorService, ConnectorRegistry, MetricsRegistry};
use crate::lifecycle::{LifecycleError, LifecycleOrchestrator, LifecycleService};
use crate::persistence::InMemoryPersistence;
use crate::state::StateGate;
use crate::tenant::StatusTenantManagerFactory;
use crate::version::VersionGate;

/// The in-process cluster a node joins, with the cache every member shares.
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    pub cluster: Arc<LocalCluster>,
    pub cache: Arc<dyn ClusterCacheStore>,
}

#[derive(Debug)]
pub struct App {
    settings: NodeSettings,
    persistence: Arc<InMemoryPersistence>,
    orchestrator: Arc<LifecycleOrchestrator>,
    cache: TieredCache,
    cluster: Option<Arc<LocalCluster>>,
}

impl App {
    /// Builds the node. Nothing starts until [`LifecycleOrchestrator::start`] is called.
    pub fn bootstrap(
        settings: NodeSettings,
        binary_version: &str,
        persistence: Arc<InMemoryPersistence>,
        membership: Option<ClusterMembership>,
        metrics: Arc<dyn MetricsRegistry>,
        services: Vec<Arc<dyn LifecycleService>>,
    ) -> Self {
        // 1) state and cache
        let gate = StateGate::new();
        let cache = match &membership {
            Some(m) => TieredCache::new(Arc::clone(&m.cache), settings.cache_ttl()),
            None => TieredCache::standalone(settings.cache_ttl()),
        };

        // 2) answer peers and reach them
        let broadcast: Arc<dyn Broadcast> = match &membership {
            Some(m) => {
                m.cluster.join(
                    settings.node_id.clone(),
                    NodeCommandHandler::new(binary_version, gate.clone()),
                );
                Arc::new(ClusterBroadcast::new(
                    Arc::clone(&m.cluster),
                    settings.node_id.clone(),
                    settings.broadcast_timeout(),
                ))
            }
            None => Arc::new(SingleNode),
        };

        // 3) version gate, executors and orchestrator
        let version_gate = VersionGate::new(settings.node_id.clone(), persistence.clone(), broadcast, cache.clone());
        let connectors = ConnectorExecutorService::new(settings.executor_config(), metrics);
        let mut builder = LifecycleOrchestrator::builder(
            gate,
            Arc::new(version_gate),
            persistence.clone(),
            StatusTenantManagerFactory::new(persistence.clone()),
        );
        for service in services {
            builder = builder.service(service);
        }
        let orchestrator = builder
            .connectors(connectors)
            .registry(ConnectorRegistry::with_builtins())
            .build();

        info!(
            node = %settings.node_id,
            clustered = membership.is_some(),
            pool_size = settings.connector_pool_size,
            "node assembled"
        );
        Self {
            settings,
            persistence,
            orchestrator: Arc::new(orchestrator),
            cache,
            cluster: membership.map(|m| m.cluster),
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn persistence(&self) -> &Arc<InMemoryPersistence> {
        &self.persistence
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// Stops the node and its executors, then leaves the cluster.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        let result = self.orchestrator.shutdown().await;
        if let Some(cluster) = &self.cluster {
            cluster.leave(&self.settings.node_id);
        }
        info!(node = %self.settings.node_id, "node shut down");
        result
    }
}
