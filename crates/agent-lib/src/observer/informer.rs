//! Kubernetes list+watch feeding an observer

use super::{subscription, Publisher, Subscription, SubscriptionClosed, EVENT_QUEUE_CAPACITY};
use futures::StreamExt;
use kube::runtime::{watcher, watcher::Event, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Start watching `api` and return the subscription it feeds.
///
/// The watch reconnects with backoff on errors; every relist replaces the
/// store wholesale. The task ends on shutdown or once the subscription is
/// dropped.
pub fn spawn_informer<K>(
    api: Api<K>,
    config: watcher::Config,
    shutdown: broadcast::Receiver<()>,
) -> (Subscription<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let (publisher, subscription) = subscription(EVENT_QUEUE_CAPACITY);
    let handle = tokio::spawn(run_informer(api, config, publisher, shutdown));
    (subscription, handle)
}

async fn run_informer<K>(
    api: Api<K>,
    config: watcher::Config,
    publisher: Publisher<K>,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    info!(kind = %kind, "Starting informer");

    let stream = watcher(api, config).default_backoff();
    tokio::pin!(stream);

    // Objects of a relist in progress
    let mut listing: Vec<K> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(kind = %kind, "Shutting down informer");
                break;
            }
            event = stream.next() => {
                let result = match event {
                    Some(Ok(Event::Init)) => {
                        listing.clear();
                        Ok(())
                    }
                    Some(Ok(Event::InitApply(object))) => {
                        listing.push(object);
                        Ok(())
                    }
                    Some(Ok(Event::InitDone)) => {
                        let objects = std::mem::take(&mut listing);
                        debug!(kind = %kind, count = objects.len(), "Relist complete");
                        publisher.restart(objects).await
                    }
                    Some(Ok(Event::Apply(object))) => publisher.apply(object).await,
                    Some(Ok(Event::Delete(object))) => publisher.delete(object).await,
                    Some(Err(e)) => {
                        warn!(kind = %kind, error = %e, "Watch error, retrying with backoff");
                        Ok(())
                    }
                    None => {
                        warn!(kind = %kind, "Watch stream ended");
                        break;
                    }
                };

                if let Err(SubscriptionClosed) = result {
                    debug!(kind = %kind, "Subscriber gone, stopping informer");
                    break;
                }
            }
        }
    }
}
