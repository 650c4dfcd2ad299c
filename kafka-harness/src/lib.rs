pub mod config;
pub mod consumer;
pub mod done;
pub mod error;
pub mod generator;
pub mod metrics_consts;
pub mod orchestrator;
pub mod processor;
pub mod producer;
pub mod strategy;
