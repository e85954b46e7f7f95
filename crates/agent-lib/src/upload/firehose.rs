//! Amazon Kinesis Data Firehose sink

use super::{RecordSink, SinkError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_firehose::error::DisplayErrorContext;
use aws_sdk_firehose::primitives::Blob;
use aws_sdk_firehose::types::Record;
use aws_sdk_firehose::Client;
use tracing::{debug, info, warn};

/// Delivers record batches to a Firehose delivery stream with `PutRecordBatch`
#[derive(Debug, Clone)]
pub struct FirehoseSink {
    client: Client,
    stream: String,
}

impl FirehoseSink {
    pub fn new(client: Client, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    /// Build a client from the default AWS credential and region chain
    pub async fn from_env(stream: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let stream = stream.into();
        info!(
            stream = %stream,
            region = ?config.region(),
            "Configured Firehose delivery stream"
        );
        Self::new(Client::new(&config), stream)
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl RecordSink for FirehoseSink {
    fn name(&self) -> &str {
        "firehose"
    }

    async fn put_batch(&self, records: Vec<Vec<u8>>) -> Result<(), SinkError> {
        let count = records.len();
        let records = records
            .into_iter()
            .map(|data| {
                Record::builder()
                    .data(Blob::new(data))
                    .build()
                    .map_err(|e| SinkError::InvalidRecord(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .put_record_batch()
            .delivery_stream_name(self.stream.clone())
            .set_records(Some(records))
            .send()
            .await
            .map_err(|e| SinkError::Submit(DisplayErrorContext(&e).to_string()))?;

        // Individually rejected records are not retried
        let failed = output.failed_put_count();
        if failed > 0 {
            warn!(
                stream = %self.stream,
                failed = failed,
                submitted = count,
                "Firehose rejected part of the batch"
            );
        } else {
            debug!(stream = %self.stream, records = count, "Batch delivered to Firehose");
        }

        Ok(())
    }
}
