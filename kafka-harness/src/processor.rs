use async_trait::async_trait;
use common_kafka::session::Record;
use tracing::debug;

use crate::error::ProcessingError;
use crate::metrics_consts::RECORDS_PROCESSED;

/// Handles one record. An error keeps the record's offset uncommitted.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError>;
}

/// Logs each record and counts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl RecordProcessor for LoggingProcessor {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError> {
        let payload = record
            .payload
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        debug!(
            partition = record.partition,
            offset = record.offset,
            payload = %payload,
            "Consumed record"
        );
        metrics::counter!(RECORDS_PROCESSED, "partition" => record.partition.to_string())
            .increment(1);
        Ok(())
    }
}
