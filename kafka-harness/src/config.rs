use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use clap::{ArgAction, Parser};
use common_kafka::credential::Credential;
use common_kafka::scram::ScramMechanism;
use envconfig::Envconfig;

/// Command line surface. `-h` selects the broker, so help is `--help` only.
#[derive(Parser, Debug, Clone)]
#[command(name = "kafka-harness", about = "Kafka client harness", disable_help_flag = true)]
pub struct Cli {
    /// One of produce, sync, batch, multiAsync, multiBatch
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Broker address, host:port
    #[arg(short = 'h', long, default_value = "127.0.0.1:9092")]
    pub broker: String,

    /// SASL username
    #[arg(short, long, default_value = "user1")]
    pub user: String,

    /// SASL password
    #[arg(short, long, default_value = "user1")]
    pub password: String,

    /// Client certificate chain, PEM
    #[arg(long, default_value = "./jks/ca.crt")]
    pub cert: PathBuf,

    /// Trust anchors for the broker certificate, PEM
    #[arg(long, default_value = "./jks/ca.pem")]
    pub ca: PathBuf,

    /// Client private key, PEM
    #[arg(long, default_value = "./jks/ca.key")]
    pub key: PathBuf,

    #[arg(short, long, default_value = "topic-1")]
    pub topic: String,

    /// Do not verify the broker certificate. Development only.
    #[arg(long)]
    pub insecure_skip_verify: bool,

    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

/// Everything the orchestrator needs to open a session, fixed at startup.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker: String,
    pub credential: Credential,
    pub cert: PathBuf,
    pub ca: PathBuf,
    pub key: PathBuf,
    pub topic: String,
    pub insecure_skip_verify: bool,
}

impl From<&Cli> for ConnectionSettings {
    fn from(cli: &Cli) -> Self {
        Self {
            broker: cli.broker.clone(),
            credential: Credential::new(&cli.user, &cli.password, ScramMechanism::default()),
            cert: cli.cert.clone(),
            ca: cli.ca.clone(),
            key: cli.key.clone(),
            topic: cli.topic.clone(),
            insecure_skip_verify: cli.insecure_skip_verify,
        }
    }
}

/// Process settings outside the Kafka tuning.
#[derive(Envconfig, Clone, Debug)]
pub struct HarnessConfig {
    // host:port for the Prometheus exporter, disabled when unset
    pub metrics_bind: Option<String>,

    #[envconfig(default = "10")]
    pub generator_interval_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub record_buffer: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        if ms == 0 {
            return Err(ParseEnvMsDurationError);
        }
        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
