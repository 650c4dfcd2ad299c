use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use tracing::{debug, error, info};

use crate::error::{ConnectionError, FlushError, SessionError};
use crate::metrics_consts::{PRODUCER_DELIVERY_ERRORS, PRODUCER_QUEUE_MESSAGES};
use crate::session::{ProduceBatch, ProducerSession};
use crate::session_config::SessionConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaContext;

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_MESSAGES).set(stats.msg_cnt as f64);
    }
}

pub struct KafkaProducerSession {
    producer: FutureProducer<KafkaContext>,
    closed: AtomicBool,
}

impl KafkaProducerSession {
    pub async fn connect(config: &SessionConfig, topic: &str) -> Result<Self, ConnectionError> {
        let client_config = config.producer_client_config();
        let username = config.credential.username();

        let producer: FutureProducer<KafkaContext> = client_config
            .create_with_context(KafkaContext)
            .map_err(|e| ConnectionError::from_kafka(e, username))?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(ConnectionError::from_kafka(error, username));
            }
        }

        info!(
            compression = config.producer.compression.as_rdkafka(),
            acks = config.producer.acks.as_rdkafka(),
            idempotent = config.producer.idempotent,
            "Producer ready"
        );
        Ok(Self {
            producer,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ProducerSession for KafkaProducerSession {
    async fn send(&self, batch: ProduceBatch) -> Result<(), FlushError> {
        let total = batch.records.len();
        let reject = |records: usize, reason: String| FlushError {
            topic: batch.topic.clone(),
            records,
            reason,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(reject(total, "producer is closed".to_string()));
        }

        let mut handles = Vec::with_capacity(total);
        let mut failures: Vec<KafkaError> = Vec::new();

        for record in &batch.records {
            let future_record = FutureRecord {
                topic: batch.topic.as_str(),
                key: record.key.as_deref(),
                payload: Some(record.payload.as_slice()),
                timestamp: None,
                partition: None,
                headers: None,
            };

            match self.producer.send_result(future_record) {
                Ok(handle) => handles.push(handle),
                Err((e, _)) => failures.push(e),
            }
        }

        let mut canceled = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => failures.push(e),
                Err(_) => canceled += 1,
            }
        }

        let failed = failures.len() + canceled;
        if failed == 0 {
            debug!(topic = %batch.topic, records = total, "Batch delivered");
            return Ok(());
        }
        metrics::counter!(PRODUCER_DELIVERY_ERRORS).increment(failed as u64);
        let reason = failures
            .first()
            .map_or_else(|| "delivery canceled".to_string(), ToString::to_string);
        Err(reject(failed, reason))
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SessionError> {
        self.producer.flush(timeout)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.producer.flush(CLOSE_FLUSH_TIMEOUT);
        info!(in_flight = self.producer.in_flight_count(), "Producer session closed");
        result.map_err(SessionError::from)
    }
}
