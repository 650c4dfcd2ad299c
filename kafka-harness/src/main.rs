use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use common_kafka::config::KafkaConfig;
use common_kafka::session::KafkaConnector;
use envconfig::Envconfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_harness::config::{Cli, ConnectionSettings, HarnessConfig};
use kafka_harness::generator::SyntheticGenerator;
use kafka_harness::orchestrator::{wait_for_termination_signal, Orchestrator, Outcome};

fn setup_tracing() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("rdkafka=warn".parse()?);
    let log_layer = fmt::layer().with_target(true).with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;

    let cli = Cli::parse();
    let tuning = KafkaConfig::init_from_env().context("invalid kafka configuration")?;
    let harness = HarnessConfig::init_from_env().context("invalid harness configuration")?;

    if let Some(bind) = &harness.metrics_bind {
        let addr: SocketAddr = bind.parse().context("invalid METRICS_BIND")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        info!(%addr, "Serving metrics");
    }

    let orchestrator = Orchestrator::new(
        ConnectionSettings::from(&cli),
        tuning,
        Arc::new(KafkaConnector),
    )
    .with_generator(
        SyntheticGenerator::new(harness.generator_interval_ms.0),
        harness.record_buffer,
    );

    match orchestrator
        .run(cli.mode.as_deref(), wait_for_termination_signal())
        .await?
    {
        Outcome::Usage { .. } => {
            Cli::command().print_help()?;
            println!();
        }
        Outcome::Completed {
            mode,
            signal,
            clean,
        } => info!(%mode, %signal, clean, "Harness exiting"),
    }
    Ok(())
}
