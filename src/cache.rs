//! Two tier cache: a node-local moka tier and a cluster-wide tier shared between nodes.
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, trace};

/// Which tier a cache operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Visible to this node only.
    Local,
    /// Visible to every node sharing the same cluster store.
    Cluster,
}

/// Cluster-wide key/value store. Every operation is atomic per key only.
#[async_trait]
pub trait ClusterCacheStore: Send + Sync + Debug {
    async fn get(&self, cache: &str, key: &str) -> Option<Value>;
    async fn put(&self, cache: &str, key: &str, value: Value);
    async fn remove(&self, cache: &str, key: &str) -> Option<Value>;
    async fn clear(&self, cache: &str);
    async fn keys(&self, cache: &str) -> Vec<String>;
}

/// A cluster store living in this process. Nodes of an in-process cluster share one `Arc` of it.
#[derive(Debug, Default)]
pub struct InMemoryClusterCache {
    caches: DashMap<String, DashMap<String, Value>>,
}

impl InMemoryClusterCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ClusterCacheStore for InMemoryClusterCache {
    async fn get(&self, cache: &str, key: &str) -> Option<Value> {
        self.caches
            .get(cache)
            .and_then(|entries| entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, cache: &str, key: &str, value: Value) {
        self.caches
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn remove(&self, cache: &str, key: &str) -> Option<Value> {
        self.caches
            .get(cache)
            .and_then(|entries| entries.remove(key).map(|(_, v)| v))
    }

    async fn clear(&self, cache: &str) {
        if let Some(entries) = self.caches.get(cache) {
            entries.clear();
        }
    }

    async fn keys(&self, cache: &str) -> Vec<String> {
        self.caches
            .get(cache)
            .map(|entries| entries.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }
}

/// Callers must tolerate misses and fall back to the authoritative store.
#[derive(Clone, Debug)]
pub struct TieredCache {
    local: Arc<DashMap<String, Cache<String, Value>>>,
    cluster: Arc<dyn ClusterCacheStore>,
    ttl: Duration,
}

impl TieredCache {
    pub fn new(cluster: Arc<dyn ClusterCacheStore>, ttl: Duration) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            cluster,
            ttl,
        }
    }

    /// A cache whose cluster tier is private to this node.
    pub fn standalone(ttl: Duration) -> Self {
        Self::new(InMemoryClusterCache::new(), ttl)
    }

    fn local_cache(&self, cache: &str) -> Cache<String, Value> {
        // moka handles are cheap to clone, they share the same storage
        self.local
            .entry(cache.to_string())
            .or_insert_with(|| {
                debug!("creating local cache `{}` (ttl {:?})", cache, self.ttl);
                Cache::builder().time_to_live(self.ttl).build()
            })
            .clone()
    }

    pub async fn get(&self, tier: CacheTier, cache: &str, key: &str) -> Option<Value> {
        let value = match tier {
            CacheTier::Local => self.local_cache(cache).get(key).await,
            CacheTier::Cluster => self.cluster.get(cache, key).await,
        };
        trace!(?tier, cache, key, hit = value.is_some(), "cache get");
        value
    }

    pub async fn put(&self, tier: CacheTier, cache: &str, key: &str, value: Value) {
        match tier {
            CacheTier::Local => self.local_cache(cache).insert(key.to_string(), value).await,
            CacheTier::Cluster => self.cluster.put(cache, key, value).await,
        }
    }

    pub async fn remove(&self, tier: CacheTier, cache: &str, key: &str) -> Option<Value> {
        match tier {
            CacheTier::Local => self.local_cache(cache).remove(key).await,
            CacheTier::Cluster => self.cluster.remove(cache, key).await,
        }
    }

    pub async fn clear(&self, tier: CacheTier, cache: &str) {
        match tier {
            CacheTier::Local => {
                let local = self.local.get(cache).map(|c| c.value().clone());
                if let Some(local) = local {
                    local.invalidate_all();
                    local.run_pending_tasks().await;
                }
            }
            CacheTier::Cluster => self.cluster.clear(cache).await,
        }
    }

    pub async fn keys(&self, tier: CacheTier, cache: &str) -> Vec<String> {
        match tier {
            CacheTier::Local => match self.local.get(cache) {
                Some(local) => local.iter().map(|(k, _)| k.as_ref().clone()).collect(),
                None => vec![],
            },
            CacheTier::Cluster => self.cluster.keys(cache).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_put_get_remove() {
        let cache = TieredCache::standalone(Duration::from_secs(60));
        assert!(cache.get(CacheTier::Local, "platform", "info").await.is_none());

        cache.put(CacheTier::Local, "platform", "info", json!({"v": 1})).await;
        assert_eq!(
            cache.get(CacheTier::Local, "platform", "info").await,
            Some(json!({"v": 1}))
        );

        let removed = cache.remove(CacheTier::Local, "platform", "info").await;
        assert_eq!(removed, Some(json!({"v": 1})));
        assert!(cache.get(CacheTier::Local, "platform", "info").await.is_none());
    }

    #[tokio::test]
    async fn test_tiers_are_isolated() {
        let cache = TieredCache::standalone(Duration::from_secs(60));
        cache.put(CacheTier::Local, "c", "k", json!("local")).await;
        assert!(cache.get(CacheTier::Cluster, "c", "k").await.is_none());

        cache.put(CacheTier::Cluster, "c", "k", json!("cluster")).await;
        assert_eq!(cache.get(CacheTier::Local, "c", "k").await, Some(json!("local")));
        assert_eq!(cache.get(CacheTier::Cluster, "c", "k").await, Some(json!("cluster")));
    }

    #[tokio::test]
    async fn test_cluster_tier_is_shared_between_nodes() {
        let shared = InMemoryClusterCache::new();
        let node_a = TieredCache::new(shared.clone(), Duration::from_secs(60));
        let node_b = TieredCache::new(shared, Duration::from_secs(60));

        node_a.put(CacheTier::Cluster, "versions", "node-a", json!("7.11.0")).await;
        assert_eq!(
            node_b.get(CacheTier::Cluster, "versions", "node-a").await,
            Some(json!("7.11.0"))
        );

        node_a.put(CacheTier::Local, "versions", "mine", json!(true)).await;
        assert!(node_b.get(CacheTier::Local, "versions", "mine").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_and_keys() {
        let cache = TieredCache::standalone(Duration::from_secs(60));
        cache.put(CacheTier::Cluster, "c", "a", json!(1)).await;
        cache.put(CacheTier::Cluster, "c", "b", json!(2)).await;
        let mut keys = cache.keys(CacheTier::Cluster, "c").await;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        cache.clear(CacheTier::Cluster, "c").await;
        assert!(cache.keys(CacheTier::Cluster, "c").await.is_empty());

        cache.put(CacheTier::Local, "c", "a", json!(1)).await;
        cache.clear(CacheTier::Local, "c").await;
        assert!(cache.get(CacheTier::Local, "c", "a").await.is_none());
    }
}
