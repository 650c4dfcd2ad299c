use std::path::PathBuf;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::scram::ScramError;

/// Bad or missing credential material, or tuning values that cannot be used.
/// Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {kind} from {path}: {source}")]
    Unreadable {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no {kind} found in {path}")]
    Empty { kind: &'static str, path: PathBuf },
    #[error("malformed {kind} in {path}: {reason}")]
    Malformed {
        kind: &'static str,
        path: PathBuf,
        reason: String,
    },
    #[error("client private key does not match certificate: {0}")]
    KeyMismatch(String),
    #[error("invalid tuning value for {field}: {reason}")]
    InvalidTuning { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn tuning(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidTuning {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures to establish a session: TLS negotiation, authentication, or an
/// unreachable cluster. Never retried at this layer.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("authentication rejected for user {user}: {reason}")]
    Authentication { user: String, reason: String },
    #[error("SCRAM exchange failed: {0}")]
    Scram(#[from] ScramError),
    #[error("failed to reach brokers: {0}")]
    Kafka(#[from] KafkaError),
}

impl ConnectionError {
    /// Sort a client error raised while connecting into the TLS and SASL
    /// failures operators need to tell apart.
    pub fn from_kafka(error: KafkaError, user: &str) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::Authentication | RDKafkaErrorCode::SaslAuthenticationFailed) => {
                ConnectionError::Authentication {
                    user: user.to_string(),
                    reason: error.to_string(),
                }
            }
            Some(RDKafkaErrorCode::SSL) => ConnectionError::Tls(error.to_string()),
            _ => ConnectionError::Kafka(error),
        }
    }
}

/// Errors from an open session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("partition {partition} is not owned by this member")]
    NotOwned { partition: i32 },
    #[error("session is closed")]
    Closed,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// A producer batch the transport rejected.
#[derive(Error, Debug)]
#[error("batch of {records} records to {topic} rejected: {reason}")]
pub struct FlushError {
    pub topic: String,
    pub records: usize,
    pub reason: String,
}
