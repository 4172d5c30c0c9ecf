use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::persistence::TenantId;

pub type ConnectorParameters = HashMap<String, Value>;
pub type ConnectorOutputs = HashMap<String, Value>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectorError {
    #[error("connector validation failed: {0}")]
    Validation(String),
    #[error("connector could not connect: {0}")]
    Connection(String),
    #[error("connector execution failed: {0}")]
    Execution(String),
    #[error("connector could not disconnect: {0}")]
    Disconnect(String),
    #[error("no connector registered for type `{0}`")]
    UnknownType(String),
    #[error("connector was discarded before it ran")]
    Cancelled,
}

/// A pluggable, short-lived unit of work invoked while a process runs.
#[async_trait]
pub trait ConnectorTask: Send + Sync + Debug {
    fn set_input_parameters(&mut self, parameters: ConnectorParameters);
    fn validate(&self) -> Result<(), ConnectorError>;
    async fn connect(&mut self) -> Result<(), ConnectorError>;
    async fn execute(&mut self) -> Result<ConnectorOutputs, ConnectorError>;
    async fn disconnect(&mut self) -> Result<(), ConnectorError>;
}

/// Who is running the connector. Passed explicitly with every submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ExecutionContext {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub process_instance_id: Option<u64>,
    #[serde(default)]
    pub flow_node_instance_id: Option<u64>,
    /// Connector definition id, used in logs only.
    #[serde(default)]
    pub connector_definition: Option<String>,
}

impl ExecutionContext {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ..Default::default()
        }
    }

    pub fn with_process(mut self, process_instance_id: u64, flow_node_instance_id: u64) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self.flow_node_instance_id = Some(flow_node_instance_id);
        self
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.connector_definition = Some(definition.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorResult {
    pub outputs: ConnectorOutputs,
    pub elapsed_millis: u64,
}
