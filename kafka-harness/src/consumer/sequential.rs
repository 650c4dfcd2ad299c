//! Sync and Batch modes: a single task works through the owned partitions
//! one claim at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common_kafka::session::ConsumerSession;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::consumer::claim::{PartitionClaim, PollOutcome};
use crate::consumer::ClaimSettings;
use crate::done::DoneListener;
use crate::metrics_consts::{ACTIVE_CLAIMS, CLAIMS_ABORTED};
use crate::processor::RecordProcessor;

pub async fn run(
    session: Arc<dyn ConsumerSession>,
    processor: Arc<dyn RecordProcessor>,
    settings: ClaimSettings,
    done: DoneListener,
) {
    let mut assignment = session.assignment();
    let mut claims: BTreeMap<i32, PartitionClaim> = BTreeMap::new();
    let mut reopen_at: HashMap<i32, Instant> = HashMap::new();

    info!(mode = settings.label, "Starting sequential consumer");
    while !done.is_closed() {
        let owned: BTreeMap<i32, u64> = assignment.borrow_and_update().epochs().collect();

        claims.retain(|partition, claim| {
            let keep = claim.epoch().is_some() && owned.get(partition).copied() == claim.epoch();
            if !keep {
                claim.discard();
                info!(partition, "Released revoked partition");
            }
            keep
        });
        reopen_at.retain(|partition, _| owned.contains_key(partition));

        for partition in owned.keys() {
            let waiting = reopen_at
                .get(partition)
                .is_some_and(|at| *at > Instant::now());
            if claims.contains_key(partition) || waiting {
                continue;
            }
            match PartitionClaim::open(&*session, *partition).await {
                Ok(claim) => {
                    reopen_at.remove(partition);
                    claims.insert(*partition, claim);
                }
                Err(e) => {
                    warn!(partition, error = %e, "Failed to open claim");
                    reopen_at.insert(*partition, Instant::now() + settings.retry_backoff);
                }
            }
        }
        metrics::gauge!(ACTIVE_CLAIMS, "mode" => settings.label).set(claims.len() as f64);

        if claims.is_empty() {
            let wake = reopen_at
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| Instant::now() + settings.fetch.max_wait);
            tokio::select! {
                _ = done.closed() => break,
                changed = assignment.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
            continue;
        }

        let partitions: Vec<i32> = claims.keys().copied().collect();
        for partition in partitions {
            if done.is_closed() {
                break;
            }
            let Some(claim) = claims.get_mut(&partition) else {
                continue;
            };
            match claim.poll(&*session, &*processor, &settings).await {
                Ok(PollOutcome::Progressed | PollOutcome::Idle) => {}
                Ok(PollOutcome::Revoked { .. }) => {
                    claims.remove(&partition);
                }
                Ok(PollOutcome::Aborted { .. }) => {
                    metrics::counter!(CLAIMS_ABORTED, "mode" => settings.label).increment(1);
                    claims.remove(&partition);
                    reopen_at.insert(partition, Instant::now() + settings.retry_backoff);
                }
                Err(e) => {
                    warn!(partition, error = %e, "Claim failed, reopening after backoff");
                    metrics::counter!(CLAIMS_ABORTED, "mode" => settings.label).increment(1);
                    claims.remove(&partition);
                    reopen_at.insert(partition, Instant::now() + settings.retry_backoff);
                }
            }
        }
    }

    for (_, claim) in claims {
        claim.finish(&*session, &settings).await;
    }
    metrics::gauge!(ACTIVE_CLAIMS, "mode" => settings.label).set(0.0);
    info!(mode = settings.label, "Sequential consumer stopped");
}
