use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{ConnectionError, FlushError, SessionError};
use crate::kafka_consumer::KafkaConsumerSession;
use crate::kafka_producer::KafkaProducerSession;
use crate::session_config::SessionConfig;

/// A record read from a partition. Offsets are dense and strictly increasing
/// within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
}

impl Record {
    pub fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.payload.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OutgoingRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// One producer flush. Partitioning is left to the transport.
#[derive(Debug, Clone)]
pub struct ProduceBatch {
    pub topic: String,
    pub records: Vec<OutgoingRecord>,
}

/// Partitions currently owned by this group member. A new generation is
/// published on every rebalance.
///
/// Each owned partition carries the generation it was assigned in. A
/// partition that is revoked and handed back gets a new epoch, so holders of
/// the old one can tell even when both updates land between two reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    generation: u64,
    partitions: BTreeMap<i32, u64>,
}

impl Assignment {
    pub fn new(generation: u64, partitions: impl IntoIterator<Item = i32>) -> Self {
        Self {
            generation,
            partitions: partitions.into_iter().map(|p| (p, generation)).collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, partition: i32) -> bool {
        self.partitions.contains_key(&partition)
    }

    /// Generation in which `partition` was assigned, if it is owned.
    pub fn epoch(&self, partition: i32) -> Option<u64> {
        self.partitions.get(&partition).copied()
    }

    pub fn partitions(&self) -> impl Iterator<Item = i32> + '_ {
        self.partitions.keys().copied()
    }

    /// Owned partitions with their epochs.
    pub fn epochs(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        self.partitions.iter().map(|(p, epoch)| (*p, *epoch))
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Next generation with `partitions` added. Partitions already owned keep
    /// their epoch.
    pub fn with(&self, partitions: &[i32]) -> Self {
        let generation = self.generation + 1;
        let mut next = self.partitions.clone();
        for partition in partitions {
            next.entry(*partition).or_insert(generation);
        }
        Self {
            generation,
            partitions: next,
        }
    }

    /// Next generation with `partitions` removed.
    pub fn without(&self, partitions: &[i32]) -> Self {
        let mut next = self.partitions.clone();
        next.retain(|p, _| !partitions.contains(p));
        Self {
            generation: self.generation + 1,
            partitions: next,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub max_wait: Duration,
    pub max_records: usize,
    pub max_bytes: usize,
}

impl FetchOptions {
    pub fn with_max_wait(self, max_wait: Duration) -> Self {
        Self { max_wait, ..self }
    }
}

/// A group member subscribed to one topic.
///
/// Offsets passed to `commit` are the offset of the last processed record;
/// `resume_offset` returns the first offset still to be processed.
#[async_trait]
pub trait ConsumerSession: Send + Sync {
    fn topic(&self) -> &str;

    /// Watch the owned partitions. Revocations are published before the
    /// partition is handed to another member.
    fn assignment(&self) -> watch::Receiver<Assignment>;

    async fn resume_offset(&self, partition: i32) -> Result<i64, SessionError>;

    /// Records from `partition` starting at `offset`, waiting at most
    /// `options.max_wait` for the first one. An empty result is not an error.
    async fn fetch(
        &self,
        partition: i32,
        offset: i64,
        options: &FetchOptions,
    ) -> Result<Vec<Record>, SessionError>;

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), SessionError>;

    /// Leave the group. Idempotent.
    async fn close(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait ProducerSession: Send + Sync {
    /// Resolves once the batch is acknowledged at the configured level.
    async fn send(&self, batch: ProduceBatch) -> Result<(), FlushError>;

    async fn flush(&self, timeout: Duration) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens sessions against a cluster. Connecting includes the TLS and SASL
/// handshakes and a metadata round trip, so a returned session is usable.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_consumer(
        &self,
        config: &SessionConfig,
        topic: &str,
    ) -> Result<Arc<dyn ConsumerSession>, ConnectionError>;

    async fn connect_producer(
        &self,
        config: &SessionConfig,
        topic: &str,
    ) -> Result<Arc<dyn ProducerSession>, ConnectionError>;
}

/// Connects to real brokers through librdkafka.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaConnector;

#[async_trait]
impl Connector for KafkaConnector {
    async fn connect_consumer(
        &self,
        config: &SessionConfig,
        topic: &str,
    ) -> Result<Arc<dyn ConsumerSession>, ConnectionError> {
        let session = KafkaConsumerSession::connect(config, topic).await?;
        Ok(Arc::new(session))
    }

    async fn connect_producer(
        &self,
        config: &SessionConfig,
        topic: &str,
    ) -> Result<Arc<dyn ProducerSession>, ConnectionError> {
        let session = KafkaProducerSession::connect(config, topic).await?;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_generations() {
        let initial = Assignment::default();
        assert!(initial.is_empty());
        assert_eq!(initial.generation(), 0);

        let assigned = initial.with(&[2, 0, 1]);
        assert_eq!(assigned.generation(), 1);
        assert_eq!(assigned.partitions().collect::<Vec<_>>(), vec![0, 1, 2]);

        let revoked = assigned.without(&[1]);
        assert_eq!(revoked.generation(), 2);
        assert!(!revoked.contains(1));
        assert!(revoked.contains(0));
        assert_eq!(revoked.len(), 2);
    }

    #[test]
    fn test_reassigned_partition_gets_new_epoch() {
        let assigned = Assignment::default().with(&[0, 1]);
        assert_eq!(assigned.epoch(0), Some(1));

        let grown = assigned.with(&[1, 2]);
        assert_eq!(grown.epoch(1), Some(1));
        assert_eq!(grown.epoch(2), Some(2));

        let bounced = grown.without(&[0]).with(&[0]);
        assert!(bounced.contains(0));
        assert_eq!(bounced.epoch(0), Some(4));
        assert_eq!(bounced.epoch(1), Some(1));
        assert_eq!(bounced.epoch(3), None);
    }

    #[test]
    fn test_record_size_counts_key_and_payload() {
        let record = Record {
            topic: "t".to_string(),
            partition: 0,
            offset: 0,
            key: Some(b"ab".to_vec()),
            payload: Some(b"cde".to_vec()),
            timestamp_ms: None,
        };
        assert_eq!(record.size(), 5);
    }
}
