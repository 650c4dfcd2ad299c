use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectionError, SessionError};
use crate::metrics_consts::{
    CONSUMER_COMMITS, CONSUMER_PARTITION_PAUSES, CONSUMER_RECV_ERRORS, CONSUMER_UNOWNED_DROPPED,
    REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS,
};
use crate::session::{Assignment, ConsumerSession, FetchOptions, Record};
use crate::session_config::{InitialOffset, SessionConfig};

const PARTITION_QUEUE_CAPACITY: usize = 1000;
const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const OFFSET_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

type Queues = Arc<Mutex<HashMap<i32, Arc<PartitionQueue>>>>;

/// Buffered records for one owned partition. Records handed out by `fetch`
/// stay in `replay` until committed, so a claim that aborts can read them
/// again without seeking the underlying consumer.
///
/// The pump never waits on a full queue. Records that do not fit are parked
/// in `overflow` and the partition is paused until its reader catches up.
struct PartitionQueue {
    tx: mpsc::Sender<Record>,
    reader: tokio::sync::Mutex<QueueReader>,
    overflow: Mutex<Overflow>,
}

#[derive(Default)]
struct Overflow {
    paused: bool,
    records: VecDeque<Record>,
}

#[derive(Debug, PartialEq, Eq)]
enum Offered {
    Queued,
    /// The queue is full. `pause` is set for the record that filled it.
    Parked { pause: bool },
    Closed,
}

struct QueueReader {
    rx: mpsc::Receiver<Record>,
    replay: VecDeque<Record>,
}

impl PartitionQueue {
    fn new() -> Self {
        Self::with_capacity(PARTITION_QUEUE_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            reader: tokio::sync::Mutex::new(QueueReader {
                rx,
                replay: VecDeque::new(),
            }),
            overflow: Mutex::new(Overflow::default()),
        }
    }

    fn offer(&self, record: Record) -> Offered {
        let mut overflow = self.overflow.lock().unwrap_or_else(PoisonError::into_inner);
        if overflow.paused {
            overflow.records.push_back(record);
            return Offered::Parked { pause: false };
        }
        match self.tx.try_send(record) {
            Ok(()) => Offered::Queued,
            Err(TrySendError::Full(record)) => {
                overflow.paused = true;
                overflow.records.push_back(record);
                Offered::Parked { pause: true }
            }
            Err(TrySendError::Closed(_)) => Offered::Closed,
        }
    }

    /// Move parked records into the queue in order. Returns true once the
    /// backlog is gone and the partition should be resumed.
    fn refill(&self) -> bool {
        let mut overflow = self.overflow.lock().unwrap_or_else(PoisonError::into_inner);
        if !overflow.paused {
            return false;
        }
        while let Some(record) = overflow.records.pop_front() {
            match self.tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(record)) => {
                    overflow.records.push_front(record);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    overflow.records.clear();
                    return false;
                }
            }
        }
        overflow.paused = false;
        true
    }
}

/// Publishes rebalance events into the assignment watch and keeps one queue
/// per owned partition. Runs inside librdkafka's poll, so revocations are
/// visible before the partition is handed over.
pub struct HarnessConsumerContext {
    assignment: watch::Sender<Assignment>,
    queues: Queues,
}

impl HarnessConsumerContext {
    fn new(assignment: watch::Sender<Assignment>, queues: Queues) -> Self {
        Self { assignment, queues }
    }

    fn revoke(&self, partitions: &[i32]) {
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            for partition in partitions {
                queues.remove(partition);
            }
        }
        self.assignment
            .send_modify(|current| *current = current.without(partitions));
    }

    fn assign(&self, partitions: &[i32]) {
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            for partition in partitions {
                queues
                    .entry(*partition)
                    .or_insert_with(|| Arc::new(PartitionQueue::new()));
            }
        }
        self.assignment
            .send_modify(|current| *current = current.with(partitions));
    }

    fn clear(&self) {
        let owned: Vec<i32> = self.assignment.borrow().partitions().collect();
        if !owned.is_empty() {
            self.revoke(&owned);
        }
    }
}

fn partition_numbers(partitions: &TopicPartitionList) -> Vec<i32> {
    partitions
        .elements()
        .iter()
        .map(|element| element.partition())
        .collect()
}

impl ClientContext for HarnessConsumerContext {}

impl ConsumerContext for HarnessConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }
                let revoked = partition_numbers(partitions);
                info!(?revoked, "Revoking partitions");
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
                self.revoke(&revoked);
            }
            Rebalance::Assign(partitions) => {
                debug!(count = partitions.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                debug!("Skipping empty assign rebalance");
                metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
                return;
            }
            let assigned = partition_numbers(partitions);
            info!(?assigned, "Assigned partitions");
            metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
            self.assign(&assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!("Offset commit failed: {}", e);
        }
    }
}

/// Group consumer backed by librdkafka. A background task polls the
/// consumer and routes messages to per-partition queues.
pub struct KafkaConsumerSession {
    consumer: Arc<StreamConsumer<HarnessConsumerContext>>,
    topic: String,
    initial_offset: InitialOffset,
    assignment: watch::Receiver<Assignment>,
    queues: Queues,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl KafkaConsumerSession {
    pub async fn connect(config: &SessionConfig, topic: &str) -> Result<Self, ConnectionError> {
        let client_config = config.consumer_client_config();
        let username = config.credential.username();

        let (assignment_tx, assignment_rx) = watch::channel(Assignment::default());
        let queues: Queues = Arc::new(Mutex::new(HashMap::new()));
        let context = HarnessConsumerContext::new(assignment_tx, queues.clone());

        let consumer: StreamConsumer<HarnessConsumerContext> = client_config
            .create_with_context(context)
            .map_err(|e| ConnectionError::from_kafka(e, username))?;

        // "Ping" the brokers, which runs the TLS and SASL handshakes
        match consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT) {
            Ok(metadata) => {
                let partitions = metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == topic)
                    .map_or(0, |t| t.partitions().len());
                info!(topic, partitions, "Connected to Kafka brokers");
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(ConnectionError::from_kafka(error, username));
            }
        }

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConnectionError::from_kafka(e, username))?;
        info!(
            topic,
            group = %config.group.group_id,
            rebalance = config.group.rebalance.as_rdkafka(),
            offset_retention_minutes = config.group.offset_retention.as_secs() / 60,
            "Subscribed to topic"
        );

        let consumer = Arc::new(consumer);
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(pump_messages(
            consumer.clone(),
            topic.to_string(),
            queues.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            initial_offset: config.group.initial_offset,
            assignment: assignment_rx,
            queues,
            shutdown,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    fn queue(&self, partition: i32) -> Result<Arc<PartitionQueue>, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .cloned()
            .ok_or(SessionError::NotOwned { partition })
    }

    fn refill(&self, partition: i32, queue: &PartitionQueue) {
        if !queue.refill() {
            return;
        }
        match self
            .consumer
            .resume(&partition_list(&self.topic, partition))
        {
            Ok(()) => debug!(partition, "Resumed partition fetches"),
            Err(e) => warn!(partition, "Failed to resume partition: {}", e),
        }
    }
}

fn partition_list(topic: &str, partition: i32) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    tpl
}

fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

async fn pump_messages(
    consumer: Arc<StreamConsumer<HarnessConsumerContext>>,
    topic: String,
    queues: Queues,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => received,
        };

        let record = match received {
            Ok(message) => record_from_message(&message),
            Err(e) => {
                warn!("Kafka consumer error: {}", e);
                metrics::counter!(CONSUMER_RECV_ERRORS).increment(1);
                continue;
            }
        };

        let queue = queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record.partition)
            .cloned();
        let Some(queue) = queue else {
            debug!(
                partition = record.partition,
                offset = record.offset,
                "Dropping message for unowned partition"
            );
            metrics::counter!(CONSUMER_UNOWNED_DROPPED).increment(1);
            continue;
        };

        let partition = record.partition;
        match queue.offer(record) {
            Offered::Queued | Offered::Parked { pause: false } => {}
            Offered::Parked { pause: true } => {
                debug!(partition, "Partition queue full, pausing fetches");
                metrics::counter!(CONSUMER_PARTITION_PAUSES).increment(1);
                if let Err(e) = consumer.pause(&partition_list(&topic, partition)) {
                    warn!(partition, "Failed to pause partition: {}", e);
                }
            }
            Offered::Closed => {
                metrics::counter!(CONSUMER_UNOWNED_DROPPED).increment(1);
            }
        }
    }
    debug!("Consumer pump stopped");
}

#[async_trait]
impl ConsumerSession for KafkaConsumerSession {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assignment(&self) -> watch::Receiver<Assignment> {
        self.assignment.clone()
    }

    async fn resume_offset(&self, partition: i32) -> Result<i64, SessionError> {
        if !self.assignment.borrow().contains(partition) {
            return Err(SessionError::NotOwned { partition });
        }
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, partition);
        let committed = self.consumer.committed_offsets(tpl, OFFSET_QUERY_TIMEOUT)?;
        if let Some(Offset::Offset(next)) = committed
            .find_partition(&self.topic, partition)
            .map(|element| element.offset())
        {
            return Ok(next);
        }

        let (low, high) =
            self.consumer
                .fetch_watermarks(&self.topic, partition, OFFSET_QUERY_TIMEOUT)?;
        Ok(match self.initial_offset {
            InitialOffset::Oldest => low,
            InitialOffset::Newest => high,
        })
    }

    async fn fetch(
        &self,
        partition: i32,
        offset: i64,
        options: &FetchOptions,
    ) -> Result<Vec<Record>, SessionError> {
        let queue = self.queue(partition)?;
        let mut guard = queue.reader.lock().await;
        let reader = &mut *guard;

        let mut records = Vec::new();
        let mut bytes = 0;
        let full = |records: &Vec<Record>, bytes: usize| {
            records.len() >= options.max_records || (!records.is_empty() && bytes >= options.max_bytes)
        };

        for record in reader.replay.iter().filter(|r| r.offset >= offset) {
            if full(&records, bytes) {
                return Ok(records);
            }
            bytes += record.size();
            records.push(record.clone());
        }

        self.refill(partition, &queue);
        if records.is_empty() {
            let deadline = Instant::now() + options.max_wait;
            loop {
                match tokio::time::timeout_at(deadline, reader.rx.recv()).await {
                    Ok(Some(record)) if record.offset < offset => continue,
                    Ok(Some(record)) => {
                        bytes += record.size();
                        reader.replay.push_back(record.clone());
                        records.push(record);
                        break;
                    }
                    Ok(None) => return Err(SessionError::NotOwned { partition }),
                    Err(_) => return Ok(records),
                }
            }
        }

        while !full(&records, bytes) {
            match reader.rx.try_recv() {
                Ok(record) if record.offset < offset => continue,
                Ok(record) => {
                    bytes += record.size();
                    reader.replay.push_back(record.clone());
                    records.push(record);
                }
                Err(_) => break,
            }
        }
        self.refill(partition, &queue);
        Ok(records)
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<(), SessionError> {
        let queue = self.queue(partition)?;
        {
            let mut reader = queue.reader.lock().await;
            while reader.replay.front().is_some_and(|r| r.offset <= offset) {
                reader.replay.pop_front();
            }
        }

        // Kafka stores the next offset to read
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        metrics::counter!(CONSUMER_COMMITS).increment(1);
        debug!(partition, offset, "Committed offset");
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("Consumer pump task failed: {}", e);
            }
        }
        self.consumer.unsubscribe();
        self.consumer.context().clear();
        info!(topic = %self.topic, "Consumer session closed");
        Ok(())
    }
}
