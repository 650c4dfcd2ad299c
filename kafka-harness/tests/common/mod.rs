#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::KafkaConfig;
use common_kafka::credential::Credential;
use common_kafka::scram::ScramMechanism;
use common_kafka::session::Record;
use common_kafka::session_config::{build_config, SessionConfig};
use common_kafka::test::MemoryBroker;
use common_kafka::tls::configure_transport;
use kafka_harness::config::ConnectionSettings;
use kafka_harness::error::ProcessingError;
use kafka_harness::processor::RecordProcessor;

pub const TOPIC: &str = "events";
pub const GROUP: &str = "kafka-harness";

pub fn tls_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../testdata/tls")
}

pub fn broker(partitions: i32) -> MemoryBroker {
    MemoryBroker::new()
        .with_topic(TOPIC, partitions)
        .with_user("user1", "user1")
}

pub fn settings(password: &str) -> ConnectionSettings {
    let dir = tls_dir();
    ConnectionSettings {
        broker: "memory:9092".to_string(),
        credential: Credential::new("user1", password, ScramMechanism::Sha512),
        cert: dir.join("client.crt"),
        ca: dir.join("ca.pem"),
        key: dir.join("client.key"),
        topic: TOPIC.to_string(),
        insecure_skip_verify: false,
    }
}

pub fn session_config(tuning: KafkaConfig) -> Arc<SessionConfig> {
    let dir = tls_dir();
    let tls = configure_transport(
        &dir.join("client.crt"),
        &dir.join("ca.pem"),
        &dir.join("client.key"),
        false,
    )
    .unwrap();
    let config = build_config(
        "memory:9092",
        Credential::new("user1", "user1", ScramMechanism::Sha512),
        tls,
        &tuning,
    )
    .unwrap();
    Arc::new(config)
}

/// Remembers every record it was handed and fails the ones `fail` selects.
#[derive(Default)]
pub struct RecordingProcessor {
    seen: Mutex<Vec<(i32, i64)>>,
    fail: Option<(i32, i64)>,
}

impl RecordingProcessor {
    pub fn failing_at(partition: i32, offset: i64) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail: Some((partition, offset)),
        }
    }

    pub fn seen(&self) -> Vec<(i32, i64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_on(&self, partition: i32) -> Vec<i64> {
        self.seen()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| offset)
            .collect()
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError> {
        self.seen
            .lock()
            .unwrap()
            .push((record.partition, record.offset));
        if self.fail == Some((record.partition, record.offset)) {
            return Err(ProcessingError {
                partition: record.partition,
                offset: record.offset,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
