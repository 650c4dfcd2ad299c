pub mod config;
pub mod credential;
pub mod error;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod metrics_consts;
pub mod scram;
pub mod session;
pub mod session_config;
pub mod tls;
