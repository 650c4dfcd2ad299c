use std::fmt;
use std::sync::Arc;

use common_kafka::session::{Connector, OutgoingRecord};
use common_kafka::session_config::SessionConfig;
use tokio::sync::mpsc;

use crate::consumer::{ConsumerMode, ConsumerStrategy};
use crate::done::DoneListener;
use crate::error::HarnessError;
use crate::processor::RecordProcessor;
use crate::producer::ProducerStrategy;

/// The run modes selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Produce,
    Sync,
    Batch,
    MultiAsync,
    MultiBatch,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Produce,
        Mode::Sync,
        Mode::Batch,
        Mode::MultiAsync,
        Mode::MultiBatch,
    ];

    /// Exact, case-sensitive match. Anything else is not a mode.
    pub fn parse(value: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|mode| mode.as_str() == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Produce => "produce",
            Mode::Sync => "sync",
            Mode::Batch => "batch",
            Mode::MultiAsync => "multiAsync",
            Mode::MultiBatch => "multiBatch",
        }
    }

    fn consumer(&self) -> Option<ConsumerMode> {
        match self {
            Mode::Produce => None,
            Mode::Sync => Some(ConsumerMode::Sync),
            Mode::Batch => Some(ConsumerMode::Batch),
            Mode::MultiAsync => Some(ConsumerMode::MultiAsync),
            Mode::MultiBatch => Some(ConsumerMode::MultiBatch),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one of these runs per process.
pub enum Strategy {
    Sync(ConsumerStrategy),
    Batch(ConsumerStrategy),
    MultiAsync(ConsumerStrategy),
    MultiBatch(ConsumerStrategy),
    Produce(ProducerStrategy),
}

impl Strategy {
    pub fn sync(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Strategy::Sync(ConsumerStrategy::new(
            ConsumerMode::Sync,
            config,
            connector,
            processor,
        ))
    }

    pub fn batch(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Strategy::Batch(ConsumerStrategy::new(
            ConsumerMode::Batch,
            config,
            connector,
            processor,
        ))
    }

    pub fn multi_async(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Strategy::MultiAsync(ConsumerStrategy::new(
            ConsumerMode::MultiAsync,
            config,
            connector,
            processor,
        ))
    }

    pub fn multi_batch(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        Strategy::MultiBatch(ConsumerStrategy::new(
            ConsumerMode::MultiBatch,
            config,
            connector,
            processor,
        ))
    }

    pub fn produce(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        source: mpsc::Receiver<OutgoingRecord>,
    ) -> Self {
        Strategy::Produce(ProducerStrategy::new(config, connector, source))
    }

    /// Build the consumer variant for a consuming mode. Produce needs a
    /// record source and goes through [`Strategy::produce`].
    pub fn consume(
        mode: Mode,
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Option<Self> {
        let strategy = match mode.consumer()? {
            ConsumerMode::Sync => Strategy::sync(config, connector, processor),
            ConsumerMode::Batch => Strategy::batch(config, connector, processor),
            ConsumerMode::MultiAsync => Strategy::multi_async(config, connector, processor),
            ConsumerMode::MultiBatch => Strategy::multi_batch(config, connector, processor),
        };
        Some(strategy)
    }

    pub fn mode(&self) -> Mode {
        match self {
            Strategy::Sync(_) => Mode::Sync,
            Strategy::Batch(_) => Mode::Batch,
            Strategy::MultiAsync(_) => Mode::MultiAsync,
            Strategy::MultiBatch(_) => Mode::MultiBatch,
            Strategy::Produce(_) => Mode::Produce,
        }
    }

    pub async fn start(&mut self, done: DoneListener, topic: &str) -> Result<(), HarnessError> {
        match self {
            Strategy::Sync(consumer)
            | Strategy::Batch(consumer)
            | Strategy::MultiAsync(consumer)
            | Strategy::MultiBatch(consumer) => consumer.start(done, topic).await,
            Strategy::Produce(producer) => producer.start(done, topic).await,
        }
    }

    pub async fn close(self) -> Result<(), HarnessError> {
        match self {
            Strategy::Sync(consumer)
            | Strategy::Batch(consumer)
            | Strategy::MultiAsync(consumer)
            | Strategy::MultiBatch(consumer) => consumer.close().await,
            Strategy::Produce(producer) => producer.close().await.map(|_| ()),
        }
    }
}
