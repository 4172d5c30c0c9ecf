//! Cluster fan-out. The real transport is provided by the host; `LocalCluster` wires nodes
//! living in the same process together, which is what the binary and the tests use.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

pub type NodeId = String;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BroadcastError {
    #[error("node `{0}` did not answer in time")]
    Timeout(NodeId),
    #[error("node `{0}` is unreachable")]
    Unreachable(NodeId),
    #[error("remote failure: {0}")]
    Remote(String),
}

/// Commands a node can ask its peers to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClusterCommand {
    /// Answer with the version of the running binaries.
    BinaryVersion,
    /// Answer with the current node state.
    NodeState,
    Ping,
}

pub type BroadcastReport = HashMap<NodeId, Result<Value, BroadcastError>>;

#[async_trait]
pub trait Broadcast: Send + Sync + Debug {
    /// Runs `command` on every other known node. One entry per peer, errors included.
    async fn execute_on_other_nodes(&self, command: ClusterCommand) -> Result<BroadcastReport, BroadcastError>;
}

/// Node-side handler for commands received from peers.
#[async_trait]
pub trait CommandHandler: Send + Sync + Debug {
    async fn handle(&self, command: ClusterCommand) -> Result<Value, BroadcastError>;
}

/// A node that only knows about itself. Every broadcast is vacuously complete.
#[derive(Debug, Clone, Default)]
pub struct SingleNode;

#[async_trait]
impl Broadcast for SingleNode {
    async fn execute_on_other_nodes(&self, _command: ClusterCommand) -> Result<BroadcastReport, BroadcastError> {
        Ok(HashMap::new())
    }
}

/// Membership of an in-process cluster.
#[derive(Debug, Default)]
pub struct LocalCluster {
    members: DashMap<NodeId, Arc<dyn CommandHandler>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, node_id: impl Into<NodeId>, handler: Arc<dyn CommandHandler>) {
        let node_id = node_id.into();
        debug!("node `{}` joined the local cluster", node_id);
        self.members.insert(node_id, handler);
    }

    pub fn leave(&self, node_id: &str) {
        self.members.remove(node_id);
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.iter().map(|e| e.key().clone()).collect()
    }
}

/// `Broadcast` over a `LocalCluster`, bounding every peer call with `timeout`.
#[derive(Debug, Clone)]
pub struct ClusterBroadcast {
    cluster: Arc<LocalCluster>,
    node_id: NodeId,
    timeout: Duration,
}

impl ClusterBroadcast {
    pub fn new(cluster: Arc<LocalCluster>, node_id: impl Into<NodeId>, timeout: Duration) -> Self {
        Self {
            cluster,
            node_id: node_id.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Broadcast for ClusterBroadcast {
    #[tracing::instrument(name = "broadcast", skip(self), fields(node = %self.node_id))]
    async fn execute_on_other_nodes(&self, command: ClusterCommand) -> Result<BroadcastReport, BroadcastError> {
        // snapshot the peers so no shard lock is held across an await
        let peers: Vec<(NodeId, Arc<dyn CommandHandler>)> = self
            .cluster
            .members
            .iter()
            .filter(|e| e.key() != &self.node_id)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let calls = peers.into_iter().map(|(peer, handler)| {
            let command = command.clone();
            let timeout = self.timeout;
            async move {
                let answer = match tokio::time::timeout(timeout, handler.handle(command)).await {
                    Ok(answer) => answer,
                    Err(_) => {
                        warn!("peer `{}` did not answer within {:?}", peer, timeout);
                        Err(BroadcastError::Timeout(peer.clone()))
                    }
                };
                (peer, answer)
            }
        });

        Ok(join_all(calls).await.into_iter().collect())
    }
}

/// Answers peer commands on behalf of a node.
#[derive(Debug, Clone)]
pub struct NodeCommandHandler {
    binary_version: String,
    state: crate::state::StateGate,
}

impl NodeCommandHandler {
    pub fn new(binary_version: impl Into<String>, state: crate::state::StateGate) -> Arc<Self> {
        Arc::new(Self {
            binary_version: binary_version.into(),
            state,
        })
    }
}

#[async_trait]
impl CommandHandler for NodeCommandHandler {
    async fn handle(&self, command: ClusterCommand) -> Result<Value, BroadcastError> {
        match command {
            ClusterCommand::BinaryVersion => Ok(json!(self.binary_version)),
            ClusterCommand::NodeState => Ok(json!(self.state.state())),
            ClusterCommand::Ping => Ok(json!("pong")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::StateGate;

    /// A peer that never answers.
    #[derive(Debug)]
    pub(crate) struct SilentPeer;

    #[async_trait]
    impl CommandHandler for SilentPeer {
        async fn handle(&self, _command: ClusterCommand) -> Result<Value, BroadcastError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_single_node_has_no_peers() {
        let report = SingleNode.execute_on_other_nodes(ClusterCommand::Ping).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_self() {
        let cluster = LocalCluster::new();
        cluster.join("a", NodeCommandHandler::new("7.11.0", StateGate::new()));
        cluster.join("b", NodeCommandHandler::new("7.11.1", StateGate::new()));

        let broadcast = ClusterBroadcast::new(cluster.clone(), "a", Duration::from_secs(1));
        let report = broadcast
            .execute_on_other_nodes(ClusterCommand::BinaryVersion)
            .await
            .unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report["b"], Ok(json!("7.11.1")));
    }

    #[tokio::test]
    async fn test_broadcast_timeout_is_reported_per_peer() {
        let cluster = LocalCluster::new();
        cluster.join("a", NodeCommandHandler::new("7.11.0", StateGate::new()));
        cluster.join("slow", Arc::new(SilentPeer));

        let broadcast = ClusterBroadcast::new(cluster, "a", Duration::from_millis(20));
        let report = broadcast.execute_on_other_nodes(ClusterCommand::Ping).await.unwrap();
        assert_eq!(report["slow"], Err(BroadcastError::Timeout("slow".into())));
    }

    #[tokio::test]
    async fn test_node_state_command() {
        let gate = StateGate::new();
        let handler = NodeCommandHandler::new("1.0.0", gate.clone());
        assert_eq!(handler.handle(ClusterCommand::NodeState).await.unwrap(), json!("STOPPED"));
        gate.initialize_start();
        assert_eq!(handler.handle(ClusterCommand::NodeState).await.unwrap(), json!("STARTING"));
    }

    #[test]
    fn test_membership() {
        let cluster = LocalCluster::new();
        cluster.join("a", Arc::new(SilentPeer));
        cluster.leave("a");
        assert!(cluster.members().is_empty());
    }
}
