use common_kafka::error::{ConfigError, ConnectionError, SessionError};
use thiserror::Error;

/// A record the processor could not handle. Local to the owning claim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to process record {partition}:{offset}: {reason}")]
pub struct ProcessingError {
    pub partition: i32,
    pub offset: i64,
    pub reason: String,
}

/// Records still buffered when the drain deadline passed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("drain timed out, dropped {dropped} unflushed records")]
pub struct DrainTimeoutError {
    pub dropped: usize,
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    DrainTimeout(#[from] DrainTimeoutError),
    #[error("strategy already started")]
    AlreadyStarted,
    #[error("strategy task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
