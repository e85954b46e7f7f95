//! Observability infrastructure for the usage agent
//!
//! Provides:
//! - Prometheus metrics (scan latency, records built, upload outcomes, node cache size)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for scan cycle latency (in seconds)
const SCAN_LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    scan_latency_seconds: Histogram,
    records_built: IntCounter,
    deleted_records_buffered: IntGauge,
    node_lookup_misses: IntCounter,
    serialization_failures: IntCounter,
    chunks_submitted: IntCounter,
    upload_failures: IntCounter,
    nodes_cached: IntGauge,
    node_reconciliations: IntCounter,
    build_info: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            scan_latency_seconds: register_histogram!(
                "usage_agent_scan_latency_seconds",
                "Time spent building and uploading one scan cycle",
                SCAN_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scan_latency_seconds"),

            records_built: register_int_counter!(
                "usage_agent_records_built_total",
                "Total number of usage records built"
            )
            .expect("Failed to register records_built"),

            deleted_records_buffered: register_int_gauge!(
                "usage_agent_deleted_records_buffered",
                "Finalization records of deleted workloads waiting for the next upload"
            )
            .expect("Failed to register deleted_records_buffered"),

            node_lookup_misses: register_int_counter!(
                "usage_agent_node_lookup_misses_total",
                "Usage records built without a cached node snapshot"
            )
            .expect("Failed to register node_lookup_misses"),

            serialization_failures: register_int_counter!(
                "usage_agent_serialization_failures_total",
                "Records dropped because they could not be serialized"
            )
            .expect("Failed to register serialization_failures"),

            chunks_submitted: register_int_counter!(
                "usage_agent_chunks_submitted_total",
                "Record batches accepted by the sink"
            )
            .expect("Failed to register chunks_submitted"),

            upload_failures: register_int_counter!(
                "usage_agent_upload_failures_total",
                "Upload calls aborted by a sink error"
            )
            .expect("Failed to register upload_failures"),

            nodes_cached: register_int_gauge!(
                "usage_agent_nodes_cached",
                "Number of nodes in the node cache"
            )
            .expect("Failed to register nodes_cached"),

            node_reconciliations: register_int_counter!(
                "usage_agent_node_reconciliations_total",
                "Full node cache reconciliations performed"
            )
            .expect("Failed to register node_reconciliations"),

            build_info: register_gauge_vec!(
                "usage_agent_build_info",
                "Agent version and the cluster it reports for",
                &["version", "cluster"]
            )
            .expect("Failed to register build_info"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_scan_latency(&self, elapsed: Duration) {
        self.inner().scan_latency_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn add_records_built(&self, count: u64) {
        self.inner().records_built.inc_by(count);
    }

    pub fn set_deleted_records_buffered(&self, count: i64) {
        self.inner().deleted_records_buffered.set(count);
    }

    pub fn inc_node_lookup_misses(&self) {
        self.inner().node_lookup_misses.inc();
    }

    pub fn inc_serialization_failures(&self) {
        self.inner().serialization_failures.inc();
    }

    pub fn inc_chunks_submitted(&self) {
        self.inner().chunks_submitted.inc();
    }

    pub fn inc_upload_failures(&self) {
        self.inner().upload_failures.inc();
    }

    pub fn set_nodes_cached(&self, count: i64) {
        self.inner().nodes_cached.set(count);
    }

    pub fn inc_node_reconciliations(&self) {
        self.inner().node_reconciliations.inc();
    }

    /// Publish the agent version and cluster as a constant gauge
    pub fn set_build_info(&self, version: &str, cluster: &str) {
        self.inner().build_info.reset();
        self.inner()
            .build_info
            .with_label_values(&[version, cluster])
            .set(1.0);
    }
}

/// Structured logger for agent lifecycle events
///
/// Every event carries a stable `event` field and the cluster name.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, sink: &str) {
        info!(
            event = "agent_started",
            cluster = %self.cluster,
            agent_version = %version,
            sink = %sink,
            "Usage agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Usage agent shutting down"
        );
    }

    /// Log node cache cold start completion
    pub fn log_cache_ready(&self, nodes: usize, version: u64) {
        info!(
            event = "node_cache_ready",
            cluster = %self.cluster,
            nodes = nodes,
            version = version,
            "Node cache ready"
        );
    }

    /// Log a completed scan cycle
    pub fn log_scan_cycle(
        &self,
        running: usize,
        deleted: usize,
        missing_nodes: usize,
        uploaded: usize,
        elapsed: Duration,
    ) {
        if missing_nodes > 0 {
            warn!(
                event = "scan_cycle",
                cluster = %self.cluster,
                running = running,
                deleted = deleted,
                missing_nodes = missing_nodes,
                uploaded = uploaded,
                elapsed_ms = elapsed.as_millis() as u64,
                "Scan cycle complete with missing node snapshots"
            );
        } else {
            info!(
                event = "scan_cycle",
                cluster = %self.cluster,
                running = running,
                deleted = deleted,
                uploaded = uploaded,
                elapsed_ms = elapsed.as_millis() as u64,
                "Scan cycle complete"
            );
        }
    }

    /// Log an upload that was aborted
    pub fn log_upload_failure(&self, records: usize, error: &dyn std::error::Error) {
        error!(
            event = "upload_failed",
            cluster = %self.cluster,
            records = records,
            error = %error,
            "Upload failed, batch dropped"
        );
    }
}
