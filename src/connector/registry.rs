use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::builtin::{ECHO, EchoConnector, HTTP, HttpConnector};
use super::task::{ConnectorError, ConnectorTask};

/// Builds a fresh connector instance for every execution.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn ConnectorTask>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Box<dyn ConnectorTask> + Send + Sync,
{
    fn create(&self) -> Box<dyn ConnectorTask> {
        self()
    }
}

/// Connector implementations by type identifier.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: Arc<DashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `echo` and `http` connectors.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ECHO, || Box::new(EchoConnector::default()) as Box<dyn ConnectorTask>);
        registry.register(HTTP, || Box::new(HttpConnector::default()) as Box<dyn ConnectorTask>);
        registry
    }

    /// Replaces any factory already registered under `connector_type`.
    pub fn register(&self, connector_type: impl Into<String>, factory: impl ConnectorFactory + 'static) {
        let connector_type = connector_type.into();
        if self
            .factories
            .insert(connector_type.clone(), Arc::new(factory))
            .is_some()
        {
            info!("connector type `{}` re-registered", connector_type);
        } else {
            debug!("connector type `{}` registered", connector_type);
        }
    }

    pub fn unregister(&self, connector_type: &str) -> bool {
        self.factories.remove(connector_type).is_some()
    }

    pub fn create(&self, connector_type: &str) -> Result<Box<dyn ConnectorTask>, ConnectorError> {
        // clone the factory out so no shard lock is held while it runs
        let factory = self
            .factories
            .get(connector_type)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ConnectorError::UnknownType(connector_type.to_string()))?;
        Ok(factory.create())
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.factories.contains_key(connector_type)
    }

    /// Sorted type identifiers.
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("types", &self.list())
            .finish()
    }
}
