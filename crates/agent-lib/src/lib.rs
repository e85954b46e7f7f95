//! Agent library for Kubernetes workload usage reporting
//!
//! This crate provides the core functionality for:
//! - Observing pods and nodes through the Kubernetes watch API
//! - Caching node snapshots with delayed eviction
//! - Building per-workload usage records
//! - Batched upload to Amazon Kinesis Data Firehose
//! - Health checks and observability

pub mod api;
pub mod cache;
pub mod health;
pub mod models;
pub mod observability;
pub mod observer;
pub mod quantity;
pub mod record;
pub mod resources;
pub mod scanner;
pub mod upload;

pub use cache::{CacheError, NodeCache, NodeCacheConfig};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use scanner::{ScanSummary, ScannerConfig, UsageScanner, UsageScannerBuilder};
pub use upload::{BatchUploader, DiscardSink, FirehoseSink, RecordSink, UploadReport, Uploader};
