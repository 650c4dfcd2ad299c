use std::sync::Arc;
use std::time::Duration;

use common_kafka::session::{Connector, OutgoingRecord, ProduceBatch, ProducerSession};
use common_kafka::session_config::SessionConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::done::{DoneListener, DoneSignal};
use crate::error::{DrainTimeoutError, HarnessError};
use crate::metrics_consts::{
    BATCHES_FLUSHED, DRAIN_DROPPED_RECORDS, FLUSH_FAILURES, RECORDS_PRODUCED,
};

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    pub max_messages: usize,
    pub frequency: Duration,
    pub drain_timeout: Duration,
}

impl From<&SessionConfig> for FlushSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_messages: config.producer.flush_max_messages,
            frequency: config.producer.flush_frequency,
            drain_timeout: config.lifecycle.drain_timeout,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProduceReport {
    pub records_sent: usize,
    pub batches_sent: usize,
    pub records_failed: usize,
    pub batches_failed: usize,
}

struct Running {
    session: Arc<dyn ProducerSession>,
    stop: DoneSignal,
    handle: JoinHandle<Result<ProduceReport, DrainTimeoutError>>,
}

/// Buffers records from a channel and flushes them by count or by time,
/// whichever comes first.
pub struct ProducerStrategy {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    source: Option<mpsc::Receiver<OutgoingRecord>>,
    running: Option<Running>,
}

impl ProducerStrategy {
    pub fn new(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        source: mpsc::Receiver<OutgoingRecord>,
    ) -> Self {
        Self {
            config,
            connector,
            source: Some(source),
            running: None,
        }
    }

    pub async fn start(&mut self, done: DoneListener, topic: &str) -> Result<(), HarnessError> {
        let Some(source) = self.source.take() else {
            return Err(HarnessError::AlreadyStarted);
        };

        let session = self.connector.connect_producer(&self.config, topic).await?;
        let settings = FlushSettings::from(self.config.as_ref());
        let stop = done.child();
        let handle = tokio::spawn(run(
            session.clone(),
            topic.to_string(),
            source,
            settings,
            stop.listener(),
        ));

        info!(
            topic,
            max_messages = settings.max_messages,
            frequency_ms = settings.frequency.as_millis() as u64,
            compression = self.config.producer.compression.as_rdkafka(),
            acks = self.config.producer.acks.as_rdkafka(),
            idempotent = self.config.producer.idempotent,
            "Producer strategy started"
        );
        self.running = Some(Running {
            session,
            stop,
            handle,
        });
        Ok(())
    }

    /// Flush what is buffered, then release the session. A drain that runs
    /// out of time is returned as an error after the session is closed.
    pub async fn close(self) -> Result<ProduceReport, HarnessError> {
        let Some(running) = self.running else {
            return Ok(ProduceReport::default());
        };
        running.stop.close();
        let joined = running.handle.await;
        let closed = running.session.close().await;

        let report = joined??;
        closed?;
        info!(
            records_sent = report.records_sent,
            batches_sent = report.batches_sent,
            records_failed = report.records_failed,
            "Producer strategy closed"
        );
        Ok(report)
    }
}

async fn flush(
    session: &dyn ProducerSession,
    topic: &str,
    records: Vec<OutgoingRecord>,
    trigger: &'static str,
    report: &mut ProduceReport,
) {
    let count = records.len();
    let batch = ProduceBatch {
        topic: topic.to_string(),
        records,
    };
    match session.send(batch).await {
        Ok(()) => {
            report.records_sent += count;
            report.batches_sent += 1;
            metrics::counter!(BATCHES_FLUSHED, "trigger" => trigger).increment(1);
            metrics::counter!(RECORDS_PRODUCED).increment(count as u64);
            debug!(records = count, trigger, "Flushed batch");
        }
        Err(e) => {
            report.records_failed += count;
            report.batches_failed += 1;
            metrics::counter!(FLUSH_FAILURES).increment(1);
            error!(error = %e, trigger, "Batch rejected by transport");
        }
    }
}

/// Flush `records` unless `done` closes first, in which case the batch is
/// handed back so the drain can account for it. An interrupted send may
/// already have reached the broker, so the drain can deliver it twice.
async fn flush_until_done(
    session: &dyn ProducerSession,
    topic: &str,
    records: Vec<OutgoingRecord>,
    trigger: &'static str,
    report: &mut ProduceReport,
    done: &DoneListener,
) -> Option<Vec<OutgoingRecord>> {
    tokio::select! {
        biased;
        _ = flush(session, topic, records.clone(), trigger, report) => None,
        _ = done.closed() => {
            warn!(records = records.len(), trigger, "Flush interrupted by shutdown, moving batch to drain");
            Some(records)
        }
    }
}

/// The flush loop. Returns once `done` closes or the source is exhausted,
/// after draining the buffer within the drain timeout.
pub async fn run(
    session: Arc<dyn ProducerSession>,
    topic: String,
    mut source: mpsc::Receiver<OutgoingRecord>,
    settings: FlushSettings,
    done: DoneListener,
) -> Result<ProduceReport, DrainTimeoutError> {
    let mut report = ProduceReport::default();
    let mut buffer: Vec<OutgoingRecord> = Vec::with_capacity(settings.max_messages);
    let mut ticker = tokio::time::interval_at(Instant::now() + settings.frequency, settings.frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done.closed() => break,
            received = source.recv() => match received {
                Some(record) => {
                    buffer.push(record);
                    if buffer.len() >= settings.max_messages {
                        let batch = std::mem::take(&mut buffer);
                        if let Some(interrupted) =
                            flush_until_done(&*session, &topic, batch, "size", &mut report, &done).await
                        {
                            buffer = interrupted;
                            break;
                        }
                        ticker.reset();
                    }
                }
                None => {
                    debug!("Record source exhausted");
                    break;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    let batch = std::mem::take(&mut buffer);
                    if let Some(interrupted) =
                        flush_until_done(&*session, &topic, batch, "interval", &mut report, &done).await
                    {
                        buffer = interrupted;
                        break;
                    }
                }
            }
        }
    }

    while let Ok(record) = source.try_recv() {
        buffer.push(record);
    }
    if buffer.is_empty() {
        return Ok(report);
    }

    info!(buffered = buffer.len(), "Draining producer buffer");
    let mut in_flight = 0;
    let drained = tokio::time::timeout(settings.drain_timeout, async {
        while !buffer.is_empty() {
            let take = buffer.len().min(settings.max_messages);
            let batch: Vec<OutgoingRecord> = buffer.drain(..take).collect();
            in_flight = batch.len();
            flush(&*session, &topic, batch, "drain", &mut report).await;
            in_flight = 0;
        }
        if let Err(e) = session.flush(settings.drain_timeout).await {
            warn!(error = %e, "Transport flush failed during drain");
        }
    })
    .await;

    match drained {
        Ok(()) => Ok(report),
        Err(_) => {
            let dropped = buffer.len() + in_flight;
            metrics::counter!(DRAIN_DROPPED_RECORDS).increment(dropped as u64);
            error!(dropped, "Drain timed out, dropping unflushed records");
            Err(DrainTimeoutError { dropped })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use common_kafka::error::{FlushError, SessionError};

    use crate::done::DoneSignal;

    use super::*;

    #[derive(Default)]
    struct RecordingSession {
        batches: Mutex<Vec<(Instant, usize)>>,
        stall: AtomicBool,
        reject: AtomicBool,
    }

    #[async_trait]
    impl ProducerSession for RecordingSession {
        async fn send(&self, batch: ProduceBatch) -> Result<(), FlushError> {
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.reject.swap(false, Ordering::SeqCst) {
                return Err(FlushError {
                    topic: batch.topic,
                    records: batch.records.len(),
                    reason: "rejected".to_string(),
                });
            }
            self.batches
                .lock()
                .unwrap()
                .push((Instant::now(), batch.records.len()));
            Ok(())
        }

        async fn flush(&self, _timeout: Duration) -> Result<(), SessionError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn settings(max_messages: usize, frequency_ms: u64) -> FlushSettings {
        FlushSettings {
            max_messages,
            frequency: Duration::from_millis(frequency_ms),
            drain_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_happens_once_at_interval() {
        let session = Arc::new(RecordingSession::default());
        let (tx, rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let start = Instant::now();
        let handle = tokio::spawn(run(
            session.clone(),
            "events".to_string(),
            rx,
            settings(100, 500),
            done.listener(),
        ));

        for i in 0..3 {
            tx.send(OutgoingRecord::new(format!("r{i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(session.batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        {
            let batches = session.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].1, 3);
            assert_eq!(batches[0].0 - start, Duration::from_millis(500));
        }

        done.close();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.records_sent, 3);
        assert_eq!(report.batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_immediately() {
        let session = Arc::new(RecordingSession::default());
        let (tx, rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let handle = tokio::spawn(run(
            session.clone(),
            "events".to_string(),
            rx,
            settings(2, 10_000),
            done.listener(),
        ));

        for i in 0..5 {
            tx.send(OutgoingRecord::new(format!("r{i}"))).await.unwrap();
        }
        drop(tx);
        let report = handle.await.unwrap().unwrap();

        let sizes: Vec<usize> = session.batches.lock().unwrap().iter().map(|b| b.1).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(report.records_sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_does_not_stop_later_batches() {
        let session = Arc::new(RecordingSession::default());
        session.reject.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let handle = tokio::spawn(run(
            session.clone(),
            "events".to_string(),
            rx,
            settings(1, 10_000),
            done.listener(),
        ));

        tx.send(OutgoingRecord::new("a")).await.unwrap();
        tx.send(OutgoingRecord::new("b")).await.unwrap();
        drop(tx);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.records_failed, 1);
        assert_eq!(report.records_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_reports_dropped_records() {
        let session = Arc::new(RecordingSession::default());
        session.stall.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let handle = tokio::spawn(run(
            session.clone(),
            "events".to_string(),
            rx,
            settings(2, 10_000),
            done.listener(),
        ));

        tx.send(OutgoingRecord::new("a")).await.unwrap();
        tokio::task::yield_now().await;
        tx.send(OutgoingRecord::new("b")).await.unwrap();
        tx.send(OutgoingRecord::new("c")).await.unwrap();
        done.close();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, DrainTimeoutError { dropped: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_stalled_flush_is_bounded_by_drain_timeout() {
        let session = Arc::new(RecordingSession::default());
        session.stall.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let handle = tokio::spawn(run(
            session.clone(),
            "events".to_string(),
            rx,
            settings(2, 10_000),
            done.listener(),
        ));

        // Fill a batch so the size flush starts and hangs
        tx.send(OutgoingRecord::new("a")).await.unwrap();
        tx.send(OutgoingRecord::new("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(OutgoingRecord::new("c")).await.unwrap();

        let closed_at = Instant::now();
        done.close();
        let err = tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("run should return within the drain timeout")
            .unwrap()
            .unwrap_err();

        assert_eq!(err, DrainTimeoutError { dropped: 3 });
        assert!(closed_at.elapsed() <= Duration::from_millis(1100));
        assert!(session.batches.lock().unwrap().is_empty());
    }
}
