//! Cluster version consistency.
//!
//! A node may only start when the binaries agree with the persisted schema on `major.minor`
//! and every peer runs exactly the same binaries. One peer that cannot be asked fails the
//! whole check: consistency is preferred over availability here.
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cache::{CacheTier, TieredCache};
use crate::cluster::{Broadcast, ClusterCommand, NodeId};
use crate::persistence::{PersistenceReader, PlatformVersionInfo};

pub const PLATFORM_CACHE: &str = "platform";
pub const VERSION_INFO_KEY: &str = "version_info";
pub const BINARY_VERSIONS_CACHE: &str = "binary_versions";

pub const PEERS_UNREACHABLE_MESSAGE: &str = "Unable to retrieve the binary version of all nodes of the cluster; \
     the platform cannot start until every node answers";

/// Outcome of one consistency check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct VersionCheck {
    pub ok: bool,
    pub message: String,
}

/// First two numeric components, e.g. "6.1.1-SNAPSHOT" -> (6, 1).
/// Digits after the leading ones of a component are ignored, so "1-SNAPSHOT" reads as 1.
pub fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().split('.').map(leading_number);
    let major = parts.next()??;
    let minor = parts.next()??;
    Some((major, minor))
}

fn leading_number(component: &str) -> Option<u64> {
    let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Schema and binaries are compatible iff both parse and share `major.minor`.
pub fn is_compatible(schema_version: &str, binary_version: &str) -> bool {
    match (major_minor(schema_version), major_minor(binary_version)) {
        (Some(schema), Some(binaries)) => schema == binaries,
        _ => false,
    }
}

#[derive(Debug)]
pub struct VersionGate {
    node_id: NodeId,
    persistence: Arc<dyn PersistenceReader>,
    broadcast: Arc<dyn Broadcast>,
    cache: TieredCache,
    error_message: Mutex<Option<String>>,
}

impl VersionGate {
    pub fn new(
        node_id: impl Into<NodeId>,
        persistence: Arc<dyn PersistenceReader>,
        broadcast: Arc<dyn Broadcast>,
        cache: TieredCache,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            persistence,
            broadcast,
            cache,
            error_message: Mutex::new(None),
        }
    }

    /// Message of the last failed `execute`, cleared by a successful one.
    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().ok().and_then(|m| m.clone())
    }

    pub async fn check(&self) -> VersionCheck {
        match self.verify().await {
            Ok(message) => {
                self.set_error(None);
                VersionCheck { ok: true, message }
            }
            Err(message) => {
                error!("{}", message);
                self.set_error(Some(message.clone()));
                VersionCheck { ok: false, message }
            }
        }
    }

    pub async fn execute(&self) -> bool {
        self.check().await.ok
    }

    fn set_error(&self, message: Option<String>) {
        if let Ok(mut slot) = self.error_message.lock() {
            *slot = message;
        }
    }

    async fn version_info(&self) -> Result<PlatformVersionInfo, String> {
        if let Some(cached) = self
            .cache
            .get(CacheTier::Local, PLATFORM_CACHE, VERSION_INFO_KEY)
            .await
        {
            match serde_json::from_value(cached) {
                Ok(info) => return Ok(info),
                Err(e) => warn!("ignoring unreadable cached version info: {}", e),
            }
        }

        let info = self
            .persistence
            .platform_version_info()
            .await
            .map_err(|e| format!("Unable to read the platform version information: {}", e))?;
        self.cache
            .put(CacheTier::Local, PLATFORM_CACHE, VERSION_INFO_KEY, json!(info))
            .await;
        Ok(info)
    }

    #[tracing::instrument(name = "version_check", skip(self), fields(node = %self.node_id))]
    async fn verify(&self) -> Result<String, String> {
        let info = self.version_info().await?;
        let binary = &info.platform_version;
        let schema = &info.db_schema_version;

        if !is_compatible(schema, binary) {
            return Err(format!(
                "The version of the platform (binaries) is {} but the platform schema in the database is {}: \
                 the major and minor versions must be the same",
                binary, schema
            ));
        }

        let report = self
            .broadcast
            .execute_on_other_nodes(ClusterCommand::BinaryVersion)
            .await
            .map_err(|e| {
                warn!("broadcast failed: {}", e);
                PEERS_UNREACHABLE_MESSAGE.to_string()
            })?;

        // every peer must answer before any of them is compared
        let mut peers = Vec::with_capacity(report.len());
        for (peer, answer) in report {
            match answer {
                Ok(value) => peers.push((peer, value)),
                Err(e) => {
                    warn!("peer `{}` did not report its version: {}", peer, e);
                    return Err(PEERS_UNREACHABLE_MESSAGE.to_string());
                }
            }
        }
        peers.sort_by(|a, b| a.0.cmp(&b.0));

        for (peer, value) in &peers {
            let peer_version = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            if &peer_version != binary {
                return Err(format!(
                    "The version of the platform (binaries) of node `{}` is {} but this node runs {}: \
                     every node of the cluster must run the same version",
                    peer, peer_version, binary
                ));
            }
        }

        self.cache
            .put(CacheTier::Cluster, BINARY_VERSIONS_CACHE, &self.node_id, json!(binary))
            .await;
        info!(
            binary_version = %binary,
            schema_version = %schema,
            peers = peers.len(),
            "platform version check passed"
        );
        Ok(format!(
            "binary version {} and schema version {} are consistent across {} node(s)",
            binary,
            schema,
            peers.len() + 1
        ))
    }
}
