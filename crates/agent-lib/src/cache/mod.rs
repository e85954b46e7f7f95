//! Node capacity cache
//!
//! Keeps a name -> [`NodeRecord`] map in step with the node observer so that
//! usage records can be related to node allocatable resources.
//!
//! All writes happen on one worker task that consumes observer events in
//! order. Readers only ever take the read lock. Deleted nodes stay visible
//! for a grace period, so records of workloads finalized right after their
//! node went away still carry the node snapshot.

mod eviction;

pub use eviction::EvictionQueue;

use crate::health::{components, HealthRegistry};
use crate::models::NodeRecord;
use crate::observability::AgentMetrics;
use crate::observer::{ObjectStore, Subscription, WatchEvent};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Node cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("node cache cold start did not complete within {0:?}")]
    ColdStartTimeout(Duration),

    #[error("node cache cold start cancelled")]
    ColdStartCancelled,
}

/// Configuration for the node cache
#[derive(Debug, Clone)]
pub struct NodeCacheConfig {
    /// Delay between a node delete event and its removal (default: 5 minutes)
    pub eviction_grace: Duration,
    /// Full reconciliation period (default: 15 minutes)
    pub resync_interval: Duration,
    /// How often due evictions are applied (default: 10 seconds)
    pub sweep_interval: Duration,
    /// Cold start deadline (default: 60 seconds)
    pub sync_timeout: Duration,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            eviction_grace: Duration::from_secs(300),
            resync_interval: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Concurrently readable node snapshot cache
pub struct NodeCache {
    cluster: String,
    config: NodeCacheConfig,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
}

impl NodeCache {
    pub fn new(cluster: impl Into<String>, config: NodeCacheConfig, metrics: AgentMetrics) -> Self {
        Self {
            cluster: cluster.into(),
            config,
            nodes: RwLock::new(HashMap::new()),
            metrics,
            health: None,
        }
    }

    /// Report worker failures to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Snapshot of the named node, if cached
    pub async fn get_node(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Wait for the node observer's initial listing, fill the cache from it
    /// and start the background worker.
    ///
    /// Returns a readiness signal carrying the store version of the last
    /// reconciliation. It changes every time a reconciliation observes a new
    /// version.
    pub async fn load(
        self: &Arc<Self>,
        subscription: Subscription<Node>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<watch::Receiver<u64>, CacheError> {
        let Subscription { store, events } = subscription;

        tokio::select! {
            biased;
            _ = store.wait_synced() => {}
            _ = shutdown.recv() => return Err(CacheError::ColdStartCancelled),
            _ = tokio::time::sleep(self.config.sync_timeout) => {
                return Err(CacheError::ColdStartTimeout(self.config.sync_timeout));
            }
        }

        let mut worker = CacheWorker {
            cache: Arc::clone(self),
            store,
            evictions: EvictionQueue::new(),
            last_version: None,
            ready: watch::channel(0).0,
        };
        worker.reconcile().await;

        let ready = worker.ready.subscribe();
        let version = *ready.borrow();
        let nodes = self.len().await;
        info!(cluster = %self.cluster, nodes, version, "Node cache synchronized");

        tokio::spawn(worker.run(events, shutdown));
        Ok(ready)
    }
}

/// Owner of all node map writes
struct CacheWorker {
    cache: Arc<NodeCache>,
    store: Arc<ObjectStore<Node>>,
    evictions: EvictionQueue,
    last_version: Option<u64>,
    ready: watch::Sender<u64>,
}

impl CacheWorker {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent<Node>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let config = self.cache.config.clone();
        let mut sweep = interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync = interval_at(Instant::now() + config.resync_interval, config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down node cache");
                    break;
                }
                event = events.recv() => match event {
                    Some(WatchEvent::Applied(node)) => self.handle_applied(&node).await,
                    Some(WatchEvent::Deleted(node)) => self.handle_deleted(&node),
                    None => {
                        warn!("Node observer closed, node cache is no longer updated");
                        if let Some(health) = &self.cache.health {
                            health
                                .set_unhealthy(components::NODE_CACHE, "Node observer closed")
                                .await;
                        }
                        break;
                    }
                },
                _ = sweep.tick() => self.evict_expired().await,
                _ = resync.tick() => self.reconcile().await,
            }
        }
    }

    async fn handle_applied(&mut self, node: &Node) {
        let name = node.name_any();
        if self.evictions.cancel(&name) {
            debug!(node = %name, "Node re-added, eviction cancelled");
        }

        let record = NodeRecord::from_node(&self.cache.cluster, node);
        let mut nodes = self.cache.nodes.write().await;
        nodes.insert(name, record);
        self.cache.metrics.set_nodes_cached(nodes.len() as i64);
    }

    fn handle_deleted(&mut self, node: &Node) {
        let name = node.name_any();
        let due = Instant::now() + self.cache.config.eviction_grace;
        if self.evictions.schedule(&name, due) {
            debug!(
                node = %name,
                grace_secs = self.cache.config.eviction_grace.as_secs(),
                "Node deleted, eviction scheduled"
            );
        }
    }

    async fn evict_expired(&mut self) {
        let expired = self.evictions.pop_expired(Instant::now());
        if expired.is_empty() {
            return;
        }

        let mut nodes = self.cache.nodes.write().await;
        for name in expired {
            if nodes.remove(&name).is_some() {
                info!(node = %name, "Evicted node from cache");
            }
        }
        self.cache.metrics.set_nodes_cached(nodes.len() as i64);
    }

    /// Rebuild the map from the store if it changed since the last pass.
    ///
    /// Cached nodes missing from the store are kept and scheduled for
    /// eviction, so a reconciliation never removes a node before its grace
    /// period.
    async fn reconcile(&mut self) {
        let version = self.store.version();
        if self.last_version == Some(version) {
            debug!(version, "Node store unchanged, skipping reconciliation");
            return;
        }

        let mut fresh: HashMap<String, NodeRecord> = self
            .store
            .list()
            .await
            .iter()
            .map(|node| (node.name_any(), NodeRecord::from_node(&self.cache.cluster, node)))
            .collect();

        for name in fresh.keys() {
            self.evictions.cancel(name);
        }

        let due = Instant::now() + self.cache.config.eviction_grace;
        let mut nodes = self.cache.nodes.write().await;
        for (name, record) in nodes.drain() {
            if !fresh.contains_key(&name) {
                self.evictions.schedule(&name, due);
                fresh.insert(name, record);
            }
        }
        *nodes = fresh;
        let count = nodes.len();
        drop(nodes);

        self.last_version = Some(version);
        self.ready.send_replace(version);
        self.cache.metrics.set_nodes_cached(count as i64);
        self.cache.metrics.inc_node_reconciliations();
        debug!(version, nodes = count, "Node cache reconciled");
    }
}
