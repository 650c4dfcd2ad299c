use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use common_kafka::session::Connector;
use common_kafka::session_config::{build_config, SessionConfig};
use common_kafka::tls::configure_transport;
use tokio::signal::unix::SignalKind;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConnectionSettings;
use crate::done::DoneSignal;
use crate::error::HarnessError;
use crate::generator::SyntheticGenerator;
use crate::processor::{LoggingProcessor, RecordProcessor};
use crate::strategy::{Mode, Strategy};

/// Slack on top of the drain timeout for leaving the group and closing the
/// session once buffered work is done.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No mode or an unknown one. Nothing was opened.
    Usage { given: Option<String> },
    /// Ran until `signal`. `clean` is false when the drain did not finish or
    /// closing the strategy reported an error.
    Completed {
        mode: Mode,
        signal: String,
        clean: bool,
    },
}

/// Owns the process lifecycle: picks the strategy, runs it until a
/// termination signal, then drains and closes it.
pub struct Orchestrator {
    settings: ConnectionSettings,
    tuning: KafkaConfig,
    connector: Arc<dyn Connector>,
    processor: Arc<dyn RecordProcessor>,
    generator: SyntheticGenerator,
    record_buffer: usize,
    state: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(
        settings: ConnectionSettings,
        tuning: KafkaConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            settings,
            tuning,
            connector,
            processor: Arc::new(LoggingProcessor),
            generator: SyntheticGenerator::new(Duration::from_millis(10)),
            record_buffer: 1000,
            state,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn RecordProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Source of records in produce mode, and the capacity of the channel
    /// between it and the producer.
    pub fn with_generator(mut self, generator: SyntheticGenerator, record_buffer: usize) -> Self {
        self.generator = generator;
        self.record_buffer = record_buffer.max(1);
        self
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Session state changed");
    }

    fn configure(&self) -> Result<Arc<SessionConfig>, HarnessError> {
        let tls = configure_transport(
            &self.settings.cert,
            &self.settings.ca,
            &self.settings.key,
            self.settings.insecure_skip_verify,
        )?;
        let config = build_config(
            &self.settings.broker,
            self.settings.credential.clone(),
            tls,
            &self.tuning,
        )?;
        Ok(Arc::new(config))
    }

    fn build(
        &self,
        mode: Mode,
        config: Arc<SessionConfig>,
        done: &DoneSignal,
    ) -> (Strategy, Option<JoinHandle<u64>>) {
        if let Some(strategy) =
            Strategy::consume(mode, config.clone(), self.connector.clone(), self.processor.clone())
        {
            return (strategy, None);
        }

        let (sink, source) = mpsc::channel(self.record_buffer);
        let generator = tokio::spawn(self.generator.run(sink, done.listener()));
        let strategy = Strategy::produce(config, self.connector.clone(), source);
        (strategy, Some(generator))
    }

    /// Run `mode` until `shutdown` resolves with the name of the signal that
    /// ended it. Configuration and connection failures abort before anything
    /// runs; failures while draining are logged and reported in the outcome.
    pub async fn run<F>(&self, mode: Option<&str>, shutdown: F) -> Result<Outcome, HarnessError>
    where
        F: Future<Output = String>,
    {
        let Some(selected) = mode.and_then(Mode::parse) else {
            match mode {
                Some(given) => warn!(mode = given, "Unknown mode"),
                None => warn!("No mode selected"),
            }
            return Ok(Outcome::Usage {
                given: mode.map(String::from),
            });
        };

        self.transition(SessionState::Configuring);
        let result = self.serve(selected, shutdown).await;
        self.transition(SessionState::Closed);
        result
    }

    async fn serve<F>(&self, mode: Mode, shutdown: F) -> Result<Outcome, HarnessError>
    where
        F: Future<Output = String>,
    {
        let config = self.configure()?;
        let drain_timeout = config.lifecycle.drain_timeout;

        let done = DoneSignal::new();
        let (mut strategy, generator) = self.build(mode, config, &done);
        if let Err(e) = strategy.start(done.listener(), &self.settings.topic).await {
            done.close();
            if let Some(generator) = generator {
                generator.abort();
            }
            error!(mode = %mode, error = %e, "Failed to start strategy");
            return Err(e);
        }
        self.transition(SessionState::Running);
        info!(mode = %mode, topic = %self.settings.topic, "Harness running");

        let signal = shutdown.await;
        info!(signal = %signal, "Received termination signal");
        self.transition(SessionState::Draining);
        done.close();

        let mut clean = true;
        match tokio::time::timeout(drain_timeout + CLOSE_GRACE, strategy.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(mode = %mode, error = %e, "Strategy did not close cleanly");
                clean = false;
            }
            Err(_) => {
                error!(
                    mode = %mode,
                    timeout_ms = (drain_timeout + CLOSE_GRACE).as_millis() as u64,
                    "Strategy close timed out"
                );
                clean = false;
            }
        }

        if let Some(generator) = generator {
            match generator.await {
                Ok(emitted) => info!(emitted, "Generator stopped"),
                Err(e) => warn!("Generator task failed: {}", e),
            }
        }

        Ok(Outcome::Completed {
            mode,
            signal,
            clean,
        })
    }
}

/// Resolves with the name of the first SIGINT, SIGTERM or SIGQUIT received.
pub async fn wait_for_termination_signal() -> String {
    let mut interrupt = tokio::signal::unix::signal(SignalKind::interrupt())
        .expect("failed to register SIGINT handler");
    let mut term = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut quit = tokio::signal::unix::signal(SignalKind::quit())
        .expect("failed to register SIGQUIT handler");

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    name.to_string()
}
