//! One partition's fetch, process and commit cycle.
//!
//! A claim tracks the next offset to fetch and the records processed since
//! the last commit. Commits always cover a prefix of processed records, so an
//! offset is never committed ahead of its processing. When the partition is
//! revoked or a record fails, the uncommitted tail is dropped and the next
//! claim resumes from the group's committed offset. A claim is bound to the
//! assignment epoch it opened under; a revoke followed by a reassign counts
//! as a revocation.

use std::time::Duration;

use common_kafka::error::SessionError;
use common_kafka::session::{Assignment, ConsumerSession};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::consumer::ClaimSettings;
use crate::error::ProcessingError;
use crate::metrics_consts::{
    OFFSETS_COMMITTED, PROCESSING_FAILURES, REVOKED_RECORDS_DISCARDED,
};
use crate::processor::RecordProcessor;

#[derive(Debug, Clone, Copy)]
struct PendingBatch {
    records: usize,
    last_offset: i64,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Records were processed, committed, or both.
    Progressed,
    /// Nothing arrived within the fetch wait.
    Idle,
    /// The partition is no longer owned; uncommitted records were dropped.
    Revoked { discarded: usize },
    /// A record failed; uncommitted records were dropped.
    Aborted {
        error: ProcessingError,
        discarded: usize,
    },
}

enum CommitOutcome {
    Committed,
    Revoked { discarded: usize },
}

pub struct PartitionClaim {
    partition: i32,
    epoch: Option<u64>,
    next_offset: i64,
    pending: Option<PendingBatch>,
    assignment: watch::Receiver<Assignment>,
}

impl PartitionClaim {
    pub async fn open(
        session: &dyn ConsumerSession,
        partition: i32,
    ) -> Result<Self, SessionError> {
        let assignment = session.assignment();
        let epoch = assignment.borrow().epoch(partition);
        let next_offset = session.resume_offset(partition).await?;
        info!(partition, ?epoch, next_offset, "Opened partition claim");
        Ok(Self {
            partition,
            epoch,
            next_offset,
            pending: None,
            assignment,
        })
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Assignment epoch the claim was opened under.
    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Processed records not yet committed.
    pub fn pending_records(&self) -> usize {
        self.pending.map_or(0, |batch| batch.records)
    }

    fn owned(&self) -> bool {
        self.epoch.is_some() && self.assignment.borrow().epoch(self.partition) == self.epoch
    }

    fn batch_due(&self, settings: &ClaimSettings) -> bool {
        match (self.pending, settings.policy.window()) {
            (Some(batch), Some(window)) => batch.started.elapsed() >= window,
            _ => false,
        }
    }

    /// Wait no longer than what is left of the open batch's window.
    fn fetch_wait(&self, settings: &ClaimSettings) -> Duration {
        let max_wait = settings.fetch.max_wait;
        match (self.pending, settings.policy.window()) {
            (Some(batch), Some(window)) => {
                max_wait.min(window.saturating_sub(batch.started.elapsed()))
            }
            _ => max_wait,
        }
    }

    /// Drop uncommitted state. Returns the number of records dropped.
    pub fn discard(&mut self) -> usize {
        let discarded = self.pending.take().map_or(0, |batch| batch.records);
        if discarded > 0 {
            metrics::counter!(REVOKED_RECORDS_DISCARDED).increment(discarded as u64);
            info!(
                partition = self.partition,
                discarded, "Discarded uncommitted records"
            );
        }
        discarded
    }

    async fn commit_pending(
        &mut self,
        session: &dyn ConsumerSession,
        settings: &ClaimSettings,
    ) -> Result<CommitOutcome, SessionError> {
        let Some(batch) = self.pending else {
            return Ok(CommitOutcome::Committed);
        };
        if !self.owned() {
            return Ok(CommitOutcome::Revoked {
                discarded: self.discard(),
            });
        }

        match session.commit(self.partition, batch.last_offset).await {
            Ok(()) => {
                self.pending = None;
                metrics::counter!(OFFSETS_COMMITTED, "mode" => settings.label).increment(1);
                debug!(
                    partition = self.partition,
                    offset = batch.last_offset,
                    records = batch.records,
                    "Committed batch"
                );
                Ok(CommitOutcome::Committed)
            }
            Err(SessionError::NotOwned { .. }) => Ok(CommitOutcome::Revoked {
                discarded: self.discard(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Run one fetch, process and commit cycle.
    pub async fn poll(
        &mut self,
        session: &dyn ConsumerSession,
        processor: &dyn RecordProcessor,
        settings: &ClaimSettings,
    ) -> Result<PollOutcome, SessionError> {
        if !self.owned() {
            return Ok(PollOutcome::Revoked {
                discarded: self.discard(),
            });
        }
        if self.batch_due(settings) {
            return self.commit_due(session, settings).await;
        }

        let options = settings.fetch.with_max_wait(self.fetch_wait(settings));
        let records = session
            .fetch(self.partition, self.next_offset, &options)
            .await?;
        if records.is_empty() {
            if self.batch_due(settings) {
                return self.commit_due(session, settings).await;
            }
            return Ok(PollOutcome::Idle);
        }

        let batch_size = settings.policy.batch_size();
        for record in records {
            if let Err(error) = processor.process(&record).await {
                warn!(
                    partition = self.partition,
                    offset = record.offset,
                    error = %error,
                    "Record processing failed, aborting claim"
                );
                metrics::counter!(PROCESSING_FAILURES, "mode" => settings.label).increment(1);
                let discarded = self.discard();
                return Ok(PollOutcome::Aborted { error, discarded });
            }

            self.next_offset = record.offset + 1;
            let batch = self.pending.get_or_insert(PendingBatch {
                records: 0,
                last_offset: record.offset,
                started: Instant::now(),
            });
            batch.records += 1;
            batch.last_offset = record.offset;

            if batch.records >= batch_size {
                if let CommitOutcome::Revoked { discarded } =
                    self.commit_pending(session, settings).await?
                {
                    return Ok(PollOutcome::Revoked { discarded });
                }
            }
        }

        if self.batch_due(settings) {
            return self.commit_due(session, settings).await;
        }
        Ok(PollOutcome::Progressed)
    }

    async fn commit_due(
        &mut self,
        session: &dyn ConsumerSession,
        settings: &ClaimSettings,
    ) -> Result<PollOutcome, SessionError> {
        Ok(match self.commit_pending(session, settings).await? {
            CommitOutcome::Committed => PollOutcome::Progressed,
            CommitOutcome::Revoked { discarded } => PollOutcome::Revoked { discarded },
        })
    }

    /// Commit what was processed if the partition is still owned, else drop it.
    pub async fn finish(mut self, session: &dyn ConsumerSession, settings: &ClaimSettings) {
        match self.commit_pending(session, settings).await {
            Ok(CommitOutcome::Committed) => {
                debug!(partition = self.partition, "Closed partition claim");
            }
            Ok(CommitOutcome::Revoked { .. }) => {}
            Err(e) => {
                warn!(
                    partition = self.partition,
                    error = %e,
                    "Failed to commit final batch"
                );
            }
        }
    }
}
