//! MultiAsync and MultiBatch modes: one worker task per owned partition.
//!
//! The supervisor follows the assignment and spawns or stops workers. A
//! worker serves one assignment epoch of its partition and is replaced when
//! the partition is handed back under a new one. Each worker owns its claim
//! and its commit cursor, so a failing partition only stalls itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::error::SessionError;
use common_kafka::session::ConsumerSession;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consumer::claim::{PartitionClaim, PollOutcome};
use crate::consumer::ClaimSettings;
use crate::done::{DoneListener, DoneSignal};
use crate::metrics_consts::{ACTIVE_CLAIMS, CLAIMS_ABORTED};
use crate::processor::RecordProcessor;

struct PartitionWorker {
    partition: i32,
    epoch: u64,
    signal: DoneSignal,
    handle: JoinHandle<()>,
}

impl PartitionWorker {
    fn spawn(
        partition: i32,
        epoch: u64,
        session: Arc<dyn ConsumerSession>,
        processor: Arc<dyn RecordProcessor>,
        settings: ClaimSettings,
        done: &DoneListener,
    ) -> Self {
        let signal = done.child();
        let handle = tokio::spawn(run_worker(
            partition,
            epoch,
            session,
            processor,
            settings,
            signal.listener(),
        ));
        Self {
            partition,
            epoch,
            signal,
            handle,
        }
    }

    async fn stop(self) {
        self.signal.close();
        self.join().await;
    }

    async fn join(self) {
        match self.handle.await {
            Ok(()) => debug!(partition = self.partition, "Partition worker shut down"),
            Err(e) => warn!(
                partition = self.partition,
                "Partition worker panicked during shutdown: {}", e
            ),
        }
    }
}

pub async fn run(
    session: Arc<dyn ConsumerSession>,
    processor: Arc<dyn RecordProcessor>,
    settings: ClaimSettings,
    done: DoneListener,
) {
    let mut assignment = session.assignment();
    let mut workers: HashMap<i32, PartitionWorker> = HashMap::new();

    info!(mode = settings.label, "Starting partition workers");
    loop {
        let owned: HashMap<i32, u64> = assignment.borrow_and_update().epochs().collect();

        let revoked: Vec<i32> = workers
            .values()
            .filter(|worker| owned.get(&worker.partition) != Some(&worker.epoch))
            .map(|worker| worker.partition)
            .collect();
        for partition in revoked {
            if let Some(worker) = workers.remove(&partition) {
                info!(partition, "Stopping worker for revoked partition");
                worker.stop().await;
            }
        }
        for (partition, epoch) in owned {
            workers.entry(partition).or_insert_with(|| {
                PartitionWorker::spawn(
                    partition,
                    epoch,
                    session.clone(),
                    processor.clone(),
                    settings,
                    &done,
                )
            });
        }
        metrics::gauge!(ACTIVE_CLAIMS, "mode" => settings.label).set(workers.len() as f64);

        tokio::select! {
            _ = done.closed() => break,
            changed = assignment.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    for (_, worker) in workers.drain() {
        worker.join().await;
    }
    metrics::gauge!(ACTIVE_CLAIMS, "mode" => settings.label).set(0.0);
    info!(mode = settings.label, "Partition workers stopped");
}

async fn pause(signal: &DoneListener, duration: Duration) {
    tokio::select! {
        _ = signal.closed() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

async fn run_worker(
    partition: i32,
    epoch: u64,
    session: Arc<dyn ConsumerSession>,
    processor: Arc<dyn RecordProcessor>,
    settings: ClaimSettings,
    signal: DoneListener,
) {
    info!(partition, epoch, mode = settings.label, "Starting partition worker");
    let mut claim: Option<PartitionClaim> = None;

    while !signal.is_closed() {
        if claim.is_none() {
            match PartitionClaim::open(&*session, partition).await {
                Ok(opened) if opened.epoch() == Some(epoch) => claim = Some(opened),
                Ok(_) => {
                    debug!(partition, epoch, "Partition reassigned, worker superseded");
                    break;
                }
                Err(SessionError::NotOwned { .. }) => {
                    pause(&signal, settings.retry_backoff).await;
                    continue;
                }
                Err(e) => {
                    warn!(partition, error = %e, "Failed to open claim");
                    pause(&signal, settings.retry_backoff).await;
                    continue;
                }
            }
        }
        let Some(current) = claim.as_mut() else {
            continue;
        };

        match current.poll(&*session, &*processor, &settings).await {
            Ok(PollOutcome::Progressed | PollOutcome::Idle) => {}
            Ok(PollOutcome::Revoked { .. }) => {
                claim = None;
            }
            Ok(PollOutcome::Aborted { .. }) => {
                metrics::counter!(CLAIMS_ABORTED, "mode" => settings.label).increment(1);
                claim = None;
                pause(&signal, settings.retry_backoff).await;
            }
            Err(e) => {
                warn!(partition, error = %e, "Claim failed, reopening after backoff");
                metrics::counter!(CLAIMS_ABORTED, "mode" => settings.label).increment(1);
                claim = None;
                pause(&signal, settings.retry_backoff).await;
            }
        }
    }

    if let Some(claim) = claim {
        claim.finish(&*session, &settings).await;
    }
    debug!(partition, "Partition worker exiting");
}
