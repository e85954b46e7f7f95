//! Periodic usage collection
//!
//! The scanner snapshots every running workload once per period, adds the
//! finalization records of workloads deleted since the previous cycle and
//! hands the batch to the uploader.

use crate::cache::NodeCache;
use crate::health::{components, HealthRegistry};
use crate::models::{NodeRecord, UsageRecord};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::observer::{ObjectStore, Subscription, WatchEvent};
use crate::record::build_usage_record;
use crate::upload::{UploadReport, Uploader};
use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Pod phase of workloads that never ran
const FAILED_PHASE: &str = "Failed";

/// Configuration for the usage scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Scan period, also the length of each usage window (default: 15 minutes)
    pub interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
        }
    }
}

/// Outcome of one scan cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Records built for running workloads
    pub running: usize,
    /// Buffered finalization records included in the batch
    pub deleted: usize,
    /// Records built without a node snapshot
    pub missing_nodes: usize,
    /// Upload report, `None` if the upload failed
    pub upload: Option<UploadReport>,
}

/// Periodic usage collection loop
pub struct UsageScanner {
    node_cache: Arc<NodeCache>,
    uploader: Arc<dyn Uploader>,
    config: ScannerConfig,
    deleted: Mutex<Vec<UsageRecord>>,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

impl UsageScanner {
    /// Create a new scanner
    pub fn new(
        node_cache: Arc<NodeCache>,
        uploader: Arc<dyn Uploader>,
        config: ScannerConfig,
        metrics: AgentMetrics,
        health: Option<HealthRegistry>,
    ) -> Self {
        let logger = StructuredLogger::new(node_cache.cluster());
        Self {
            node_cache,
            uploader,
            config,
            deleted: Mutex::new(Vec::new()),
            metrics,
            health,
            logger,
        }
    }

    /// Run until shutdown.
    ///
    /// Waits for the workload view's initial sync, scans immediately and then
    /// once per period. Delete events are turned into finalization records
    /// as they arrive.
    pub async fn run(
        self: Arc<Self>,
        subscription: Subscription<Pod>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let Subscription { store, mut events } = subscription;

        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!("Usage scanner cancelled before workload sync");
                return;
            }
            _ = store.wait_synced() => {}
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting usage scanner"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down usage scanner");
                    break;
                }
                _ = ticker.tick() => {
                    self.scan_once(&store).await;
                }
                event = events.recv(), if events_open => match event {
                    Some(WatchEvent::Deleted(pod)) => self.handle_deleted(&pod).await,
                    Some(WatchEvent::Applied(_)) => {}
                    None => {
                        warn!("Workload observer closed, deleted workloads are no longer finalized");
                        events_open = false;
                    }
                },
            }
        }
    }

    /// Build records for every running workload, append the buffered
    /// finalization records and upload the batch
    pub async fn scan_once(&self, store: &ObjectStore<Pod>) -> ScanSummary {
        let started = Instant::now();
        let (begin, end) = usage_window(Utc::now(), self.config.interval);

        let pods = store.list().await;
        let mut records = Vec::with_capacity(pods.len());
        let mut missing_nodes = 0;
        for pod in &pods {
            let node = self.lookup_node(pod).await;
            if node.is_none() {
                missing_nodes += 1;
            }
            records.push(build_usage_record(pod, begin, end, node.as_ref()));
        }
        let running = records.len();
        self.metrics.add_records_built(running as u64);

        let deleted = std::mem::take(&mut *self.deleted.lock().await);
        self.metrics.set_deleted_records_buffered(0);
        let deleted_count = deleted.len();
        if deleted_count > 0 {
            debug!(count = deleted_count, "Adding deleted workloads to the batch");
        }
        records.extend(deleted);

        let upload = self.upload(&records).await;

        let elapsed = started.elapsed();
        self.metrics.observe_scan_latency(elapsed);
        self.logger.log_scan_cycle(
            running,
            deleted_count,
            missing_nodes,
            upload.map(|r| r.records).unwrap_or(0),
            elapsed,
        );

        ScanSummary {
            running,
            deleted: deleted_count,
            missing_nodes,
            upload,
        }
    }

    /// Buffer the finalization record of a deleted workload
    pub async fn handle_deleted(&self, pod: &Pod) {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase == Some(FAILED_PHASE) {
            debug!(
                pod = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                "Skipping failed workload"
            );
            return;
        }

        let (begin, end) = usage_window(Utc::now(), self.config.interval);
        let node = self.lookup_node(pod).await;
        let record = build_usage_record(pod, begin, end, node.as_ref());

        let mut deleted = self.deleted.lock().await;
        deleted.push(record);
        self.metrics.add_records_built(1);
        self.metrics.set_deleted_records_buffered(deleted.len() as i64);
        debug!(
            pod = %pod.name_any(),
            namespace = %pod.namespace().unwrap_or_default(),
            buffered = deleted.len(),
            "Workload deleted, finalization record buffered"
        );
    }

    /// Finalization records waiting for the next cycle
    pub async fn pending_deleted(&self) -> usize {
        self.deleted.lock().await.len()
    }

    async fn lookup_node(&self, pod: &Pod) -> Option<NodeRecord> {
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default();

        let node = self.node_cache.get_node(node_name).await;
        if node.is_none() {
            warn!(
                pod = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                node = %node_name,
                "Node not found in cache, building record without node snapshot"
            );
            self.metrics.inc_node_lookup_misses();
        }
        node
    }

    async fn upload(&self, records: &[UsageRecord]) -> Option<UploadReport> {
        if records.is_empty() {
            debug!("No usage records to upload");
            return Some(UploadReport::default());
        }

        debug!(count = records.len(), "Uploading usage records");
        let outcome = self.uploader.upload(records).await;
        if let Some(health) = &self.health {
            health
                .record_outcome(components::UPLOADER, outcome.as_ref().map(|_| ()))
                .await;
        }

        match outcome {
            Ok(report) => Some(report),
            Err(e) => {
                self.logger.log_upload_failure(records.len(), &e);
                self.metrics.inc_upload_failures();
                None
            }
        }
    }
}

/// Builder for creating the usage scanner
pub struct UsageScannerBuilder {
    node_cache: Option<Arc<NodeCache>>,
    uploader: Option<Arc<dyn Uploader>>,
    config: ScannerConfig,
    metrics: Option<AgentMetrics>,
    health: Option<HealthRegistry>,
}

impl UsageScannerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            node_cache: None,
            uploader: None,
            config: ScannerConfig::default(),
            metrics: None,
            health: None,
        }
    }

    /// Set the node cache
    pub fn node_cache(mut self, node_cache: Arc<NodeCache>) -> Self {
        self.node_cache = Some(node_cache);
        self
    }

    /// Set the uploader
    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Set the scan interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report upload outcomes to a health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the scanner
    pub fn build(self) -> Result<UsageScanner> {
        let node_cache = self
            .node_cache
            .ok_or_else(|| anyhow::anyhow!("Node cache is required"))?;
        let uploader = self
            .uploader
            .ok_or_else(|| anyhow::anyhow!("Uploader is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Scan interval must be positive");
        }

        Ok(UsageScanner::new(
            node_cache,
            uploader,
            self.config,
            self.metrics.unwrap_or_default(),
            self.health,
        ))
    }
}

impl Default for UsageScannerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The usage window of length `interval` ending at `end`
pub fn usage_window(end: DateTime<Utc>, interval: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let begin = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|span| end.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    (begin, end)
}

#[cfg(test)]
mod tests;
