//! Batched record upload
//!
//! Records are serialized to compact JSON and handed to a [`RecordSink`] in
//! chunks no larger than the sink's batch ceiling. A record that fails to
//! serialize is dropped on its own; a chunk the sink rejects aborts the call.

mod firehose;

pub use firehose::FirehoseSink;

use crate::models::UsageRecord;
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

/// Largest batch accepted by a single sink call
pub const MAX_BATCH_SIZE: usize = 500;

/// Failure reported by a sink for one batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("batch submission failed: {0}")]
    Submit(String),
}

/// Upload errors
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("chunk {chunk} of {total} rejected by sink")]
    Submit {
        chunk: usize,
        total: usize,
        #[source]
        source: SinkError,
    },
}

/// Destination accepting batches of serialized records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Submit one batch; the batch never exceeds [`MAX_BATCH_SIZE`] records
    async fn put_batch(&self, records: Vec<Vec<u8>>) -> Result<(), SinkError>;
}

/// Uploads usage records
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, records: &[UsageRecord]) -> Result<UploadReport, UploadError>;
}

/// Summary of a fully successful upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Chunks submitted to the sink
    pub chunks: usize,
    /// Records submitted to the sink
    pub records: usize,
    /// Records dropped because they could not be serialized
    pub dropped: usize,
}

/// Chunking uploader in front of a [`RecordSink`]
pub struct BatchUploader<S> {
    sink: S,
    max_batch_size: usize,
    metrics: Option<AgentMetrics>,
}

impl<S: RecordSink> BatchUploader<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            max_batch_size: MAX_BATCH_SIZE,
            metrics: None,
        }
    }

    /// Use smaller chunks; the value is clamped to `1..=MAX_BATCH_SIZE`
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Serialize and submit `records` chunk by chunk
    pub async fn upload_serializable<T>(&self, records: &[T]) -> Result<UploadReport, UploadError>
    where
        T: Serialize + Sync,
    {
        let total = records.len().div_ceil(self.max_batch_size);
        let mut report = UploadReport::default();

        for (index, chunk) in records.chunks(self.max_batch_size).enumerate() {
            let mut batch = Vec::with_capacity(chunk.len());
            for record in chunk {
                match serde_json::to_vec(record) {
                    Ok(data) => batch.push(data),
                    Err(e) => {
                        error!(chunk = index + 1, error = %e, "Failed to serialize record, dropping it");
                        report.dropped += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_serialization_failures();
                        }
                    }
                }
            }

            if batch.is_empty() {
                debug!(chunk = index + 1, "Skipping empty chunk");
                continue;
            }

            let size = batch.len();
            self.sink
                .put_batch(batch)
                .await
                .map_err(|source| UploadError::Submit {
                    chunk: index + 1,
                    total,
                    source,
                })?;

            report.chunks += 1;
            report.records += size;
            if let Some(metrics) = &self.metrics {
                metrics.inc_chunks_submitted();
            }
            debug!(
                sink = %self.sink.name(),
                chunk = index + 1,
                total = total,
                records = size,
                "Submitted chunk"
            );
        }

        Ok(report)
    }
}

#[async_trait]
impl<S: RecordSink> Uploader for BatchUploader<S> {
    async fn upload(&self, records: &[UsageRecord]) -> Result<UploadReport, UploadError> {
        self.upload_serializable(records).await
    }
}

/// Sink that drops every batch; used in dry-run mode
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl RecordSink for DiscardSink {
    fn name(&self) -> &str {
        "discard"
    }

    async fn put_batch(&self, records: Vec<Vec<u8>>) -> Result<(), SinkError> {
        let bytes: usize = records.iter().map(Vec::len).sum();
        info!(records = records.len(), bytes, "Dry run, discarding batch");
        Ok(())
    }
}
