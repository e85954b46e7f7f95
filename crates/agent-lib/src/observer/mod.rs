//! Local view of watched cluster objects
//!
//! An observer keeps an [`ObjectStore`] in step with the cluster and
//! forwards every change as a [`WatchEvent`] to a single subscriber. The
//! store answers "what exists right now" instantly; the event queue tells the
//! subscriber what changed, in order.

mod informer;

pub use informer::spawn_informer;

use kube::{Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};

/// Capacity of the event queue between an observer and its subscriber
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// A change to a watched object
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object was created or updated
    Applied(K),
    /// Object was removed, or stopped matching the watch selector
    Deleted(K),
}

/// The subscriber side of an observer went away
#[derive(Debug, Error)]
#[error("observer subscription closed")]
pub struct SubscriptionClosed;

/// `namespace/name`, or `name` for cluster-scoped objects
pub fn object_key<K: Resource>(object: &K) -> String {
    match object.namespace() {
        Some(namespace) => format!("{}/{}", namespace, object.name_any()),
        None => object.name_any(),
    }
}

/// Locally cached set of watched objects with a change counter
pub struct ObjectStore<K> {
    objects: RwLock<HashMap<String, K>>,
    version: AtomicU64,
    synced: watch::Sender<bool>,
}

impl<K> ObjectStore<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            objects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            synced,
        }
    }

    /// Insert or overwrite an object
    pub async fn apply(&self, object: K) {
        let mut objects = self.objects.write().await;
        objects.insert(object_key(&object), object);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove an object; returns whether it was present
    pub async fn delete(&self, object: &K) -> bool {
        let mut objects = self.objects.write().await;
        let removed = objects.remove(&object_key(object)).is_some();
        self.version.fetch_add(1, Ordering::SeqCst);
        removed
    }

    /// Replace the whole set, returning the objects that are gone
    pub async fn replace(&self, fresh: Vec<K>) -> Vec<K> {
        let fresh: HashMap<String, K> = fresh
            .into_iter()
            .map(|object| (object_key(&object), object))
            .collect();

        let mut objects = self.objects.write().await;
        let previous = std::mem::replace(&mut *objects, fresh);
        self.version.fetch_add(1, Ordering::SeqCst);

        let live: HashSet<&String> = objects.keys().collect();
        previous
            .into_iter()
            .filter(|(key, _)| !live.contains(key))
            .map(|(_, object)| object)
            .collect()
    }

    /// Snapshot of every object currently in the store
    pub async fn list(&self) -> Vec<K> {
        self.objects.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Monotonic counter bumped on every mutation
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Record that the initial listing has been loaded
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial listing has been loaded
    pub async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives as long as `self`, so this only returns once synced
        let _ = synced.wait_for(|synced| *synced).await;
    }
}

impl<K> Default for ObjectStore<K>
where
    K: Resource + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of an observer: the shared store plus the change queue
pub struct Subscription<K> {
    pub store: Arc<ObjectStore<K>>,
    pub events: mpsc::Receiver<WatchEvent<K>>,
}

/// Producer side of an observer: mutates the store, then reports the change
pub struct Publisher<K> {
    store: Arc<ObjectStore<K>>,
    events: mpsc::Sender<WatchEvent<K>>,
}

/// Create a connected publisher and subscription over a fresh store
pub fn subscription<K>(capacity: usize) -> (Publisher<K>, Subscription<K>)
where
    K: Resource + Clone,
{
    let store = Arc::new(ObjectStore::new());
    let (tx, rx) = mpsc::channel(capacity);
    (
        Publisher {
            store: Arc::clone(&store),
            events: tx,
        },
        Subscription { store, events: rx },
    )
}

impl<K> Publisher<K>
where
    K: Resource + Clone,
{
    pub fn store(&self) -> &Arc<ObjectStore<K>> {
        &self.store
    }

    pub async fn apply(&self, object: K) -> Result<(), SubscriptionClosed> {
        self.store.apply(object.clone()).await;
        self.send(WatchEvent::Applied(object)).await
    }

    pub async fn delete(&self, object: K) -> Result<(), SubscriptionClosed> {
        self.store.delete(&object).await;
        self.send(WatchEvent::Deleted(object)).await
    }

    /// Load a complete listing. The store is marked synced before any event
    /// is queued, so a subscriber blocked on sync never stalls the queue.
    pub async fn restart(&self, objects: Vec<K>) -> Result<(), SubscriptionClosed> {
        let removed = self.store.replace(objects.clone()).await;
        self.store.mark_synced();

        for object in objects {
            self.send(WatchEvent::Applied(object)).await?;
        }
        for object in removed {
            self.send(WatchEvent::Deleted(object)).await?;
        }
        Ok(())
    }

    async fn send(&self, event: WatchEvent<K>) -> Result<(), SubscriptionClosed> {
        self.events.send(event).await.map_err(|_| SubscriptionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Node, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&node("ip-10-0-0-1")), "ip-10-0-0-1");
        assert_eq!(object_key(&pod("shop", "web-1")), "shop/web-1");
    }

    #[tokio::test]
    async fn test_store_apply_delete_bumps_version() {
        let store = ObjectStore::new();
        assert_eq!(store.version(), 0);

        store.apply(pod("a", "web")).await;
        store.apply(pod("b", "web")).await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.version(), 2);

        assert!(store.delete(&pod("a", "web")).await);
        assert!(!store.delete(&pod("a", "web")).await);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.version(), 4);
    }

    #[tokio::test]
    async fn test_store_replace_reports_removed() {
        let store = ObjectStore::new();
        store.apply(node("a")).await;
        store.apply(node("b")).await;

        let removed = store.replace(vec![node("b"), node("c")]).await;

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name_any(), "a");
        let mut names: Vec<String> = store.list().await.iter().map(|n| n.name_any()).collect();
        names.sort();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let store = Arc::new(ObjectStore::<Node>::new());
        assert!(!store.is_synced());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_synced().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store.mark_synced();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(store.is_synced());
    }

    #[tokio::test]
    async fn test_publisher_restart_emits_applied_and_deleted() {
        let (publisher, mut subscription) = subscription::<Node>(16);
        publisher.apply(node("old")).await.unwrap();

        publisher.restart(vec![node("new")]).await.unwrap();

        assert!(subscription.store.is_synced());
        assert_eq!(
            subscription.events.recv().await,
            Some(WatchEvent::Applied(node("old")))
        );
        assert_eq!(
            subscription.events.recv().await,
            Some(WatchEvent::Applied(node("new")))
        );
        assert_eq!(
            subscription.events.recv().await,
            Some(WatchEvent::Deleted(node("old")))
        );
        assert_eq!(subscription.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_publisher_reports_closed_subscription() {
        let (publisher, subscription) = subscription::<Node>(4);
        drop(subscription);

        assert!(publisher.apply(node("a")).await.is_err());
    }
}
