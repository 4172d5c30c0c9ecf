//! Tenant-scoped managers performing the actual status flip once a transition was validated.
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::persistence::{PersistenceError, PersistenceWriter, TenantId, TenantStatus};

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),
    #[error("tenant {0} is already activated")]
    AlreadyActivated(TenantId),
    #[error("tenant {0} is already deactivated")]
    AlreadyDeactivated(TenantId),
    #[error("tenant {id} is {status}, expected PAUSED")]
    NotPaused { id: TenantId, status: TenantStatus },
    #[error("tenant {id} is {status}, expected ACTIVATED")]
    NotActivated { id: TenantId, status: TenantStatus },
    #[error(transparent)]
    Persistence(PersistenceError),
}

impl From<PersistenceError> for TenantError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::TenantNotFound(id) => TenantError::NotFound(id),
            other => TenantError::Persistence(other),
        }
    }
}

#[async_trait]
pub trait TenantManager: Send + Sync + Debug {
    async fn activate(&self) -> Result<(), TenantError>;
    async fn deactivate(&self) -> Result<(), TenantError>;
    async fn pause(&self) -> Result<(), TenantError>;
    async fn resume(&self) -> Result<(), TenantError>;
}

pub trait TenantManagerFactory: Send + Sync + Debug {
    fn for_tenant(&self, id: TenantId) -> Arc<dyn TenantManager>;
}

/// Flips the persisted status and nothing else.
#[derive(Debug, Clone)]
pub struct StatusTenantManager {
    id: TenantId,
    writer: Arc<dyn PersistenceWriter>,
}

impl StatusTenantManager {
    /// The status only moves when it is still `from`, so concurrent transitions have one winner.
    async fn flip(&self, from: TenantStatus, to: TenantStatus) -> Result<(), TenantError> {
        match self.writer.transition_tenant_status(self.id, from, to).await {
            Ok(()) => {
                info!("tenant {} is now {}", self.id, to);
                Ok(())
            }
            Err(PersistenceError::StatusConflict { id, actual, .. }) => Err(conflict(id, from, to, actual)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Maps a lost transition to the error the orchestrator reports for the same status.
fn conflict(id: TenantId, from: TenantStatus, to: TenantStatus, actual: TenantStatus) -> TenantError {
    match from {
        TenantStatus::Deactivated => TenantError::AlreadyActivated(id),
        TenantStatus::Paused => TenantError::NotPaused { id, status: actual },
        TenantStatus::Activated if to == TenantStatus::Deactivated && actual == TenantStatus::Deactivated => {
            TenantError::AlreadyDeactivated(id)
        }
        TenantStatus::Activated => TenantError::NotActivated { id, status: actual },
    }
}

#[async_trait]
impl TenantManager for StatusTenantManager {
    async fn activate(&self) -> Result<(), TenantError> {
        self.flip(TenantStatus::Deactivated, TenantStatus::Activated).await
    }

    async fn deactivate(&self) -> Result<(), TenantError> {
        self.flip(TenantStatus::Activated, TenantStatus::Deactivated).await
    }

    async fn pause(&self) -> Result<(), TenantError> {
        self.flip(TenantStatus::Activated, TenantStatus::Paused).await
    }

    async fn resume(&self) -> Result<(), TenantError> {
        self.flip(TenantStatus::Paused, TenantStatus::Activated).await
    }
}

#[derive(Debug, Clone)]
pub struct StatusTenantManagerFactory {
    writer: Arc<dyn PersistenceWriter>,
}

impl StatusTenantManagerFactory {
    pub fn new(writer: Arc<dyn PersistenceWriter>) -> Arc<Self> {
        Arc::new(Self { writer })
    }
}

impl TenantManagerFactory for StatusTenantManagerFactory {
    fn for_tenant(&self, id: TenantId) -> Arc<dyn TenantManager> {
        Arc::new(StatusTenantManager {
            id,
            writer: self.writer.clone(),
        })
    }
}
