use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connector::ExecutorConfig;

pub const NODE_ID: &str = "HELM_NODE_ID";
pub const CONNECTOR_POOL_SIZE: &str = "HELM_CONNECTOR_POOL_SIZE";
pub const CONNECTOR_QUEUE_CAPACITY: &str = "HELM_CONNECTOR_QUEUE_CAPACITY";
pub const BROADCAST_TIMEOUT_MS: &str = "HELM_BROADCAST_TIMEOUT_MS";
pub const CACHE_TTL_SECS: &str = "HELM_CACHE_TTL_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// Parses the value of `key`, `None` when it is unset or blank.
    pub async fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key).await {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file which `set`/`del` keep in sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded settings from {}", env_file.display()),
                Err(e) => warn!("could not read {}: {}", env_file.display(), e),
            }
        } else {
            debug!("no env file at {}, using the process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let lines = env_file_lines(&content, key, value);
        write_lines(&self.env_file, &lines)
    }
}

/// Lines of an env file with `key` replaced by `value`, or dropped when `value` is None.
fn env_file_lines(content: &str, key: &str, value: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut found = false;
    for line in content.lines() {
        let matches = line
            .split_once('=')
            .map(|(k, _)| k.trim() == key)
            .unwrap_or(false);
        match (matches, value) {
            (false, _) => lines.push(line.to_string()),
            (true, Some(value)) => {
                lines.push(format!("{key}={value}"));
                found = true;
            }
            (true, None) => {}
        }
    }
    if let (false, Some(value)) = (found, value) {
        lines.push(format!("{key}={value}"));
    }
    lines
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), ConfigError> {
    fs::write(path, lines.join("\n")).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(e) = self.rewrite(key, None) {
                warn!("{}", e);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let manager = Self::default();
        for (k, v) in pairs {
            manager.map.insert(k.to_string(), v.to_string());
        }
        Box::new(manager)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed node settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeSettings {
    pub node_id: String,
    pub connector_pool_size: usize,
    pub connector_queue_capacity: Option<usize>,
    pub broadcast_timeout_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            connector_pool_size: 10,
            connector_queue_capacity: None,
            broadcast_timeout_ms: 5000,
            cache_ttl_secs: 3600,
        }
    }
}

impl NodeSettings {
    pub async fn from_config(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let connector_pool_size = config
            .parse::<usize>(CONNECTOR_POOL_SIZE)
            .await?
            .unwrap_or(defaults.connector_pool_size);
        if connector_pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: CONNECTOR_POOL_SIZE.to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            node_id: config
                .get(NODE_ID)
                .await
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.node_id),
            connector_pool_size,
            connector_queue_capacity: config.parse(CONNECTOR_QUEUE_CAPACITY).await?,
            broadcast_timeout_ms: config
                .parse(BROADCAST_TIMEOUT_MS)
                .await?
                .unwrap_or(defaults.broadcast_timeout_ms),
            cache_ttl_secs: config
                .parse(CACHE_TTL_SECS)
                .await?
                .unwrap_or(defaults.cache_ttl_secs),
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            pool_size: self.connector_pool_size,
            queue_capacity: self.connector_queue_capacity,
        }
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::{TempDir, tempdir};

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_settings_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let settings = NodeSettings::from_config(&config).await.unwrap();
        assert_eq!(settings, NodeSettings::default());
        assert_eq!(settings.executor_config().pool_size, 10);
        assert_eq!(settings.broadcast_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_settings_from_values() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            (NODE_ID, "node-b"),
            (CONNECTOR_POOL_SIZE, "4"),
            (CONNECTOR_QUEUE_CAPACITY, "100"),
            (BROADCAST_TIMEOUT_MS, "250"),
            (CACHE_TTL_SECS, " 60 "),
        ]));
        let settings = NodeSettings::from_config(&config).await.unwrap();
        assert_eq!(
            settings,
            NodeSettings {
                node_id: "node-b".into(),
                connector_pool_size: 4,
                connector_queue_capacity: Some(100),
                broadcast_timeout_ms: 250,
                cache_ttl_secs: 60,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_values_are_reported() {
        let config = ConfigManager(MapConfigManager::from_pairs([(CONNECTOR_POOL_SIZE, "ten")]));
        match NodeSettings::from_config(&config).await {
            Err(ConfigError::Invalid { key, value }) => {
                assert_eq!(key, CONNECTOR_POOL_SIZE);
                assert_eq!(value, "ten");
            }
            other => panic!("unexpected {other:?}"),
        }

        let config = ConfigManager(MapConfigManager::from_pairs([(CONNECTOR_POOL_SIZE, "0")]));
        assert!(NodeSettings::from_config(&config).await.is_err());
    }

    #[test]
    fn test_env_file_lines() {
        let content = "# helm\nHELM_NODE_ID=a\nOTHER=1";
        assert_eq!(
            env_file_lines(content, "HELM_NODE_ID", Some("b")),
            vec!["# helm", "HELM_NODE_ID=b", "OTHER=1"]
        );
        assert_eq!(
            env_file_lines(content, "NEW", Some("x")),
            vec!["# helm", "HELM_NODE_ID=a", "OTHER=1", "NEW=x"]
        );
        assert_eq!(env_file_lines(content, "OTHER", None), vec!["# helm", "HELM_NODE_ID=a"]);
    }

    #[tokio::test]
    async fn test_env_config_manager_set_and_delete() {
        let key = "HELM_TEST_ENV_SET_DELETE";
        let tmp = TempDir::new().unwrap();
        let env = tmp.path().join(".env");

        let mgr = EnvConfigManager::new(env.clone());
        mgr.set(key, "secret").await.unwrap();
        assert_eq!(mgr.get(key).await, Some("secret".to_string()));
        assert!(fs::read_to_string(&env).unwrap().contains("HELM_TEST_ENV_SET_DELETE=secret"));

        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
        assert!(!fs::read_to_string(&env).unwrap().contains(key));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "HELM_TEST_POOL=3\nHELM_TEST_NODE=node-z\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("HELM_TEST_POOL").await, Some("3".to_string()));
        assert_eq!(mgr.get("HELM_TEST_NODE").await, Some("node-z".to_string()));
    }
}
