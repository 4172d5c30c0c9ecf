//! Persistence collaborators: platform version info and tenant records.
//!
//! The real store lives outside this crate. `InMemoryPersistence` backs the binary and the tests,
//! and can be loaded from (and saved back to) a YAML platform file.
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub type TenantId = u64;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("could not access platform file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse platform file: {0}")]
    Parse(String),
    #[error("tenant {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: TenantId,
        expected: TenantStatus,
        actual: TenantStatus,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TenantStatus {
    Activated,
    Deactivated,
    Paused,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantStatus::Activated => f.write_str("ACTIVATED"),
            TenantStatus::Deactivated => f.write_str("DEACTIVATED"),
            TenantStatus::Paused => f.write_str("PAUSED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TenantRecord {
    pub id: TenantId,
    pub status: TenantStatus,
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TenantRecord {
    pub fn new(id: TenantId, name: impl Into<String>, status: TenantStatus) -> Self {
        Self {
            id,
            status,
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Versions recorded for the platform. The schema version is written once at platform creation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PlatformVersionInfo {
    /// Version of the running binaries.
    pub platform_version: String,
    /// Version recorded in persisted storage.
    pub db_schema_version: String,
    /// Version the platform was first created with.
    pub initial_version: String,
}

#[async_trait]
pub trait PersistenceReader: Send + Sync + Debug {
    async fn platform_version_info(&self) -> Result<PlatformVersionInfo, PersistenceError>;
    async fn tenant(&self, id: TenantId) -> Result<TenantRecord, PersistenceError>;
}

#[async_trait]
pub trait PersistenceWriter: Send + Sync + Debug {
    async fn set_tenant_status(&self, id: TenantId, status: TenantStatus) -> Result<(), PersistenceError>;

    /// Writes `status` only if the tenant is still `expected`, atomically with the check.
    /// Fails with [`PersistenceError::StatusConflict`] otherwise.
    async fn transition_tenant_status(
        &self,
        id: TenantId,
        expected: TenantStatus,
        status: TenantStatus,
    ) -> Result<(), PersistenceError>;
}

/// On-disk shape of a platform file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PlatformFile {
    /// Schema version recorded at platform creation.
    pub db_schema_version: String,
    /// Defaults to `db_schema_version`.
    #[serde(default)]
    pub initial_version: Option<String>,
    #[serde(default)]
    pub tenants: Vec<TenantRecord>,
}

#[derive(Debug)]
pub struct InMemoryPersistence {
    version_info: RwLock<PlatformVersionInfo>,
    tenants: RwLock<HashMap<TenantId, TenantRecord>>,
    file: Option<PathBuf>,
}

impl InMemoryPersistence {
    pub fn new(version_info: PlatformVersionInfo, tenants: Vec<TenantRecord>) -> Arc<Self> {
        Arc::new(Self {
            version_info: RwLock::new(version_info),
            tenants: RwLock::new(tenants.into_iter().map(|t| (t.id, t)).collect()),
            file: None,
        })
    }

    /// Loads a YAML platform file. `binary_version` is the version of the running binaries.
    /// Status changes are written back to the same file.
    pub fn load(path: &Path, binary_version: &str) -> Result<Arc<Self>, PersistenceError> {
        let text = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let platform: PlatformFile =
            serde_yaml_bw::from_str(&text).map_err(|e| PersistenceError::Parse(e.to_string()))?;
        info!(
            "loaded platform file {} ({} tenants, schema {})",
            path.display(),
            platform.tenants.len(),
            platform.db_schema_version
        );
        let initial_version = platform
            .initial_version
            .clone()
            .unwrap_or_else(|| platform.db_schema_version.clone());
        Ok(Arc::new(Self {
            version_info: RwLock::new(PlatformVersionInfo {
                platform_version: binary_version.to_string(),
                db_schema_version: platform.db_schema_version,
                initial_version,
            }),
            tenants: RwLock::new(platform.tenants.into_iter().map(|t| (t.id, t)).collect()),
            file: Some(path.to_path_buf()),
        }))
    }

    pub async fn tenants(&self) -> Vec<TenantRecord> {
        let mut all: Vec<TenantRecord> = self.tenants.read().await.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// Persists the tenants as they will be once `id` is `status`, then commits the change in
    /// memory. The write lock is held throughout so saves land in the order of the changes.
    async fn write_status(
        &self,
        id: TenantId,
        expected: Option<TenantStatus>,
        status: TenantStatus,
    ) -> Result<(), PersistenceError> {
        let mut tenants = self.tenants.write().await;
        let actual = tenants
            .get(&id)
            .map(|t| t.status)
            .ok_or(PersistenceError::TenantNotFound(id))?;
        if let Some(expected) = expected
            && expected != actual
        {
            return Err(PersistenceError::StatusConflict { id, expected, actual });
        }
        if let Some(path) = &self.file {
            let mut records: Vec<TenantRecord> = tenants.values().cloned().collect();
            records.sort_by_key(|t| t.id);
            for record in records.iter_mut().filter(|t| t.id == id) {
                record.status = status;
            }
            self.save(path, records).await?;
        }
        if let Some(record) = tenants.get_mut(&id) {
            record.status = status;
        }
        Ok(())
    }

    async fn save(&self, path: &Path, tenants: Vec<TenantRecord>) -> Result<(), PersistenceError> {
        let info = self.version_info.read().await.clone();
        let platform = PlatformFile {
            db_schema_version: info.db_schema_version,
            initial_version: Some(info.initial_version),
            tenants,
        };
        let text =
            serde_yaml_bw::to_string(&platform).map_err(|e| PersistenceError::Parse(e.to_string()))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|source| PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("saved platform file {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl PersistenceReader for InMemoryPersistence {
    async fn platform_version_info(&self) -> Result<PlatformVersionInfo, PersistenceError> {
        Ok(self.version_info.read().await.clone())
    }

    async fn tenant(&self, id: TenantId) -> Result<TenantRecord, PersistenceError> {
        self.tenants
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::TenantNotFound(id))
    }
}

#[async_trait]
impl PersistenceWriter for InMemoryPersistence {
    async fn set_tenant_status(&self, id: TenantId, status: TenantStatus) -> Result<(), PersistenceError> {
        self.write_status(id, None, status).await
    }

    async fn transition_tenant_status(
        &self,
        id: TenantId,
        expected: TenantStatus,
        status: TenantStatus,
    ) -> Result<(), PersistenceError> {
        self.write_status(id, Some(expected), status).await
    }
}
