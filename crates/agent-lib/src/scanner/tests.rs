//! Tests for the usage scanner

use super::*;
use crate::cache::NodeCacheConfig;
use crate::health::ComponentStatus;
use crate::observer::{subscription, Publisher};
use crate::record::node::INSTANCE_TYPE_LABEL;
use crate::upload::{SinkError, UploadError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Uploader that keeps every batch; fails while `failing` is set
#[derive(Default)]
struct MockUploader {
    batches: std::sync::Mutex<Vec<Vec<UsageRecord>>>,
    failing: AtomicBool,
}

impl MockUploader {
    fn batches(&self) -> Vec<Vec<UsageRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, records: &[UsageRecord]) -> Result<UploadReport, UploadError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UploadError::Submit {
                chunk: 1,
                total: 1,
                source: SinkError::Submit("throttled".to_string()),
            });
        }
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(UploadReport {
            chunks: 1,
            records: records.len(),
            dropped: 0,
        })
    }
}

fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                INSTANCE_TYPE_LABEL.to_string(),
                "m5.large".to_string(),
            )])),
            ..Default::default()
        },
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("1".to_string())),
                ("memory".to_string(), Quantity("1Gi".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod(name: &str, node_name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("shop".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity("100m".to_string())),
                        ("memory".to_string(), Quantity("256Mi".to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

struct Harness {
    scanner: Arc<UsageScanner>,
    uploader: Arc<MockUploader>,
    health: HealthRegistry,
    pods: Publisher<Pod>,
    pod_subscription: Option<Subscription<Pod>>,
    shutdown: broadcast::Sender<()>,
    // Dropping it would close the node cache's event stream
    _nodes: Publisher<Node>,
}

async fn harness(nodes: Vec<Node>) -> Harness {
    let (shutdown, _) = broadcast::channel(1);

    let (node_publisher, node_subscription) = subscription::<Node>(64);
    node_publisher.restart(nodes).await.unwrap();
    let cache = Arc::new(NodeCache::new(
        "prod",
        NodeCacheConfig::default(),
        AgentMetrics::new(),
    ));
    cache
        .load(node_subscription, shutdown.subscribe())
        .await
        .unwrap();

    let health = HealthRegistry::new();
    health.register_all(&components::ALL).await;
    let uploader = Arc::new(MockUploader::default());
    let scanner = UsageScannerBuilder::new()
        .node_cache(cache)
        .uploader(uploader.clone())
        .metrics(AgentMetrics::new())
        .health(health.clone())
        .build()
        .unwrap();

    let (pods, pod_subscription) = subscription::<Pod>(64);
    Harness {
        scanner: Arc::new(scanner),
        uploader,
        health,
        pods,
        pod_subscription: Some(pod_subscription),
        shutdown,
        _nodes: node_publisher,
    }
}

#[tokio::test]
async fn test_scan_builds_record_per_running_workload() {
    let h = harness(vec![node("node-a")]).await;
    h.pods.apply(pod("web-1", "node-a", "Running")).await.unwrap();
    h.pods.apply(pod("web-2", "node-a", "Running")).await.unwrap();

    let summary = h.scanner.scan_once(h.pods.store()).await;

    assert_eq!(summary.running, 2);
    assert_eq!(summary.missing_nodes, 0);
    assert_eq!(summary.upload.map(|r| r.records), Some(2));
    let batch = &h.uploader.batches()[0];
    assert_eq!(batch.len(), 2);
    for record in batch {
        assert_eq!(record.node.name, "node-a");
        assert_eq!(record.node.cluster, "prod");
        assert_eq!(record.allocations.requests.cpu, 10.0);
        assert_eq!(record.allocations.requests.memory, 25.0);
        assert_eq!(
            record.end_time - record.begin_time,
            chrono::Duration::minutes(15)
        );
    }
}

#[tokio::test]
async fn test_missing_node_does_not_abort_scan() {
    let h = harness(vec![node("node-a")]).await;
    h.pods.apply(pod("web-1", "node-a", "Running")).await.unwrap();
    h.pods.apply(pod("web-2", "node-gone", "Running")).await.unwrap();

    let summary = h.scanner.scan_once(h.pods.store()).await;

    assert_eq!(summary.running, 2);
    assert_eq!(summary.missing_nodes, 1);
    let batch = &h.uploader.batches()[0];
    let orphan = batch.iter().find(|r| r.name == "web-2").unwrap();
    assert_eq!(orphan.node, NodeRecord::default());
    assert_eq!(orphan.allocations.requests.cpu, 0.0);
    assert_eq!(orphan.resources.requests.cpu, 100);
}

#[tokio::test]
async fn test_deleted_workloads_join_next_batch_once() {
    let h = harness(vec![node("node-a")]).await;
    h.pods.apply(pod("web-1", "node-a", "Running")).await.unwrap();

    h.scanner
        .handle_deleted(&pod("job-1", "node-a", "Succeeded"))
        .await;
    h.scanner
        .handle_deleted(&pod("ds-placeholder", "node-a", "Failed"))
        .await;
    assert_eq!(h.scanner.pending_deleted().await, 1);

    let first = h.scanner.scan_once(h.pods.store()).await;
    let second = h.scanner.scan_once(h.pods.store()).await;

    assert_eq!((first.running, first.deleted), (1, 1));
    assert_eq!((second.running, second.deleted), (1, 0));
    let batches = h.uploader.batches();
    let names: Vec<&str> = batches[0].iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["web-1", "job-1"]);
    assert_eq!(batches[1].len(), 1);
    assert_eq!(h.scanner.pending_deleted().await, 0);
}

#[tokio::test]
async fn test_upload_failure_degrades_uploader_and_recovers() {
    let h = harness(vec![node("node-a")]).await;
    h.pods.apply(pod("web-1", "node-a", "Running")).await.unwrap();

    h.uploader.failing.store(true, Ordering::SeqCst);
    let failed = h.scanner.scan_once(h.pods.store()).await;
    assert_eq!(failed.upload, None);
    assert_eq!(
        h.health.status(components::UPLOADER).await,
        Some(ComponentStatus::Degraded)
    );

    h.uploader.failing.store(false, Ordering::SeqCst);
    let recovered = h.scanner.scan_once(h.pods.store()).await;
    assert!(recovered.upload.is_some());
    assert_eq!(
        h.health.status(components::UPLOADER).await,
        Some(ComponentStatus::Healthy)
    );
}

#[tokio::test]
async fn test_empty_cycle_skips_upload() {
    let h = harness(vec![]).await;

    let summary = h.scanner.scan_once(h.pods.store()).await;

    assert_eq!(summary.upload, Some(UploadReport::default()));
    assert!(h.uploader.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_cancelled_before_sync_uploads_nothing() {
    let mut h = harness(vec![node("node-a")]).await;
    let subscription = h.pod_subscription.take().unwrap();
    let task = tokio::spawn(h.scanner.clone().run(subscription, h.shutdown.subscribe()));

    h.shutdown.send(()).unwrap();
    task.await.unwrap();

    assert!(h.uploader.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_scans_immediately_then_every_period() {
    let mut h = harness(vec![node("node-a")]).await;
    let subscription = h.pod_subscription.take().unwrap();
    let task = tokio::spawn(h.scanner.clone().run(subscription, h.shutdown.subscribe()));

    h.pods
        .restart(vec![pod("web-1", "node-a", "Running")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.uploader.batches().len(), 1);

    // A deletion between ticks is finalized in the next batch
    h.pods
        .delete(pod("web-1", "node-a", "Succeeded"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(900)).await;

    let batches = h.uploader.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].len(), 1);
    assert_eq!(batches[1][0].name, "web-1");

    h.shutdown.send(()).unwrap();
    task.await.unwrap();
}

#[test]
fn test_builder_requires_collaborators() {
    assert!(UsageScannerBuilder::new().build().is_err());
}

#[test]
fn test_usage_window() {
    let end = chrono::Utc::now();
    let (begin, window_end) = usage_window(end, Duration::from_secs(900));
    assert_eq!(window_end, end);
    assert_eq!(end - begin, chrono::Duration::minutes(15));
}

#[tokio::test]
async fn test_deleted_workload_window_is_fixed_at_delete_time() {
    let h = harness(vec![node("node-a")]).await;
    h.pods.apply(pod("web-1", "node-a", "Running")).await.unwrap();

    let before = chrono::Utc::now();
    h.scanner
        .handle_deleted(&pod("job-1", "node-a", "Succeeded"))
        .await;
    let after = chrono::Utc::now();
    std::thread::sleep(std::time::Duration::from_millis(5));

    h.scanner.scan_once(h.pods.store()).await;

    let batch = &h.uploader.batches()[0];
    let finalized = batch.iter().find(|r| r.name == "job-1").unwrap();
    assert!(finalized.end_time >= before && finalized.end_time <= after);
    assert_eq!(
        finalized.end_time - finalized.begin_time,
        chrono::Duration::minutes(15)
    );
    // The running snapshot gets the later window of the scan itself
    let running = batch.iter().find(|r| r.name == "web-1").unwrap();
    assert!(running.end_time > after);
}

#[test]
fn test_usage_window_saturates_for_huge_interval() {
    let end = chrono::Utc::now();

    let (begin, window_end) = usage_window(end, Duration::from_secs(1_000_000_000_000_000));

    assert_eq!(window_end, end);
    assert_eq!(begin, chrono::DateTime::<chrono::Utc>::MIN_UTC);
}
