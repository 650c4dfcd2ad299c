use std::sync::Arc;
use std::time::Duration;

use common_kafka::session::{Connector, ConsumerSession, FetchOptions};
use common_kafka::session_config::SessionConfig;
use tokio::task::JoinHandle;
use tracing::info;

use crate::done::{DoneListener, DoneSignal};
use crate::error::HarnessError;
use crate::processor::RecordProcessor;

pub mod claim;
pub mod concurrent;
pub mod sequential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    PerRecord,
    Batched { size: usize, window: Duration },
}

impl CommitPolicy {
    pub fn batch_size(&self) -> usize {
        match self {
            CommitPolicy::PerRecord => 1,
            CommitPolicy::Batched { size, .. } => *size,
        }
    }

    pub fn window(&self) -> Option<Duration> {
        match self {
            CommitPolicy::PerRecord => None,
            CommitPolicy::Batched { window, .. } => Some(*window),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimSettings {
    /// Metrics label for the running mode.
    pub label: &'static str,
    pub fetch: FetchOptions,
    pub policy: CommitPolicy,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    Sync,
    Batch,
    MultiAsync,
    MultiBatch,
}

impl ConsumerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerMode::Sync => "sync",
            ConsumerMode::Batch => "batch",
            ConsumerMode::MultiAsync => "multiAsync",
            ConsumerMode::MultiBatch => "multiBatch",
        }
    }

    fn per_partition(&self) -> bool {
        matches!(self, ConsumerMode::MultiAsync | ConsumerMode::MultiBatch)
    }

    pub fn settings(&self, config: &SessionConfig) -> ClaimSettings {
        let policy = match self {
            ConsumerMode::Sync | ConsumerMode::MultiAsync => CommitPolicy::PerRecord,
            ConsumerMode::Batch | ConsumerMode::MultiBatch => CommitPolicy::Batched {
                size: config.batch.size,
                window: config.batch.window,
            },
        };
        ClaimSettings {
            label: self.as_str(),
            fetch: config.fetch,
            policy,
            retry_backoff: config.lifecycle.claim_retry_backoff,
        }
    }
}

struct Running {
    session: Arc<dyn ConsumerSession>,
    stop: DoneSignal,
    handle: JoinHandle<()>,
}

/// Joins the consumer group and runs claims in one of the four modes.
pub struct ConsumerStrategy {
    mode: ConsumerMode,
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    processor: Arc<dyn RecordProcessor>,
    running: Option<Running>,
}

impl ConsumerStrategy {
    pub fn new(
        mode: ConsumerMode,
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Self {
            mode,
            config,
            connector,
            processor,
            running: None,
        }
    }

    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    pub async fn start(&mut self, done: DoneListener, topic: &str) -> Result<(), HarnessError> {
        if self.running.is_some() {
            return Err(HarnessError::AlreadyStarted);
        }

        let session = self.connector.connect_consumer(&self.config, topic).await?;
        let settings = self.mode.settings(&self.config);
        let stop = done.child();
        let handle = if self.mode.per_partition() {
            tokio::spawn(concurrent::run(
                session.clone(),
                self.processor.clone(),
                settings,
                stop.listener(),
            ))
        } else {
            tokio::spawn(sequential::run(
                session.clone(),
                self.processor.clone(),
                settings,
                stop.listener(),
            ))
        };

        info!(
            mode = self.mode.as_str(),
            topic,
            group = %self.config.group.group_id,
            "Consumer strategy started"
        );
        self.running = Some(Running {
            session,
            stop,
            handle,
        });
        Ok(())
    }

    /// Stop all claims, commit completed work on still-owned partitions and
    /// leave the group.
    pub async fn close(self) -> Result<(), HarnessError> {
        let Some(running) = self.running else {
            return Ok(());
        };
        running.stop.close();
        let joined = running.handle.await;
        running.session.close().await?;
        joined?;
        info!(mode = self.mode.as_str(), "Consumer strategy closed");
        Ok(())
    }
}
