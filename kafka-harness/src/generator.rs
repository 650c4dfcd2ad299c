use std::time::Duration;

use chrono::Utc;
use common_kafka::session::OutgoingRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::done::DoneListener;
use crate::metrics_consts::RECORDS_GENERATED;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub emitted_at_ms: i64,
}

/// Feeds the production strategy with keyed JSON records at a fixed rate.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticGenerator {
    interval: Duration,
    limit: Option<u64>,
}

impl SyntheticGenerator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            limit: None,
        }
    }

    /// Stop after `limit` records.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn record(sequence: u64) -> Result<OutgoingRecord, serde_json::Error> {
        let event = SyntheticEvent {
            id: Uuid::now_v7(),
            sequence,
            emitted_at_ms: Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_vec(&event)?;
        Ok(OutgoingRecord::new(payload).with_key(event.id.to_string()))
    }

    /// Emit until `done` closes, the limit is reached or the receiver goes
    /// away. Dropping the sender on return tells the producer no more
    /// records are coming. Returns the number of records emitted.
    pub async fn run(self, sink: mpsc::Sender<OutgoingRecord>, done: DoneListener) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence = 0;

        info!(interval_ms = self.interval.as_millis() as u64, "Starting synthetic generator");
        while self.limit.map_or(true, |limit| sequence < limit) {
            tokio::select! {
                _ = done.closed() => break,
                _ = ticker.tick() => {}
            }

            let record = match Self::record(sequence) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to serialize synthetic event: {}", e);
                    continue;
                }
            };
            tokio::select! {
                _ = done.closed() => break,
                sent = sink.send(record) => {
                    if sent.is_err() {
                        debug!("Record sink closed, stopping generator");
                        break;
                    }
                }
            }
            sequence += 1;
            metrics::counter!(RECORDS_GENERATED).increment(1);
        }
        info!(emitted = sequence, "Synthetic generator stopped");
        sequence
    }
}

#[cfg(test)]
mod tests {
    use crate::done::DoneSignal;

    use super::*;

    #[test]
    fn test_record_is_keyed_json() {
        let record = SyntheticGenerator::record(7).unwrap();
        let event: SyntheticEvent = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(event.sequence, 7);
        assert_eq!(record.key, Some(event.id.to_string().into_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_limit_and_closes_sink() {
        let (tx, mut rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let emitted = SyntheticGenerator::new(Duration::from_millis(10))
            .with_limit(3)
            .run(tx, done.listener())
            .await;
        assert_eq!(emitted, 3);

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_done_closes() {
        let (tx, _rx) = mpsc::channel(16);
        let done = DoneSignal::new();
        let handle = tokio::spawn(
            SyntheticGenerator::new(Duration::from_secs(1)).run(tx, done.listener()),
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        done.close();
        let emitted = handle.await.unwrap();
        assert_eq!(emitted, 3);
    }
}
