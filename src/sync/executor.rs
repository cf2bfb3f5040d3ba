//! Sends a batch to the center and applies the verdicts to the local store.

use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    core::store::{StoreError, now_ms},
    error::{SyncError, SyncResult},
    runtime::handle::{OutletStoreHandle, RuntimeError},
    sale::{SaleRecord, SyncTransition},
    types::{OutletId, RecordId, SyncStatus, TimestampMs},
};

use super::{
    central::{CentralStore, TransferError, UpsertAck, UpsertOutcome},
    policy::RetryPolicy,
};

/// Overall class of one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every record was accepted.
    Success,
    /// Verdicts differed across records.
    Partial,
    /// Nothing was accepted or rejected; the batch retries after backoff.
    TransientFailure,
    /// Every record was rejected.
    PermanentFailure,
    /// No record was still pending when the verdicts arrived.
    Stale,
}

/// Result of one sync attempt for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub outlet_id: OutletId,
    pub record_ids: Vec<RecordId>,
    pub synced: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Records that were no longer pending when the verdict arrived.
    pub skipped: usize,
    pub outcome: BatchOutcome,
    pub at_ms: TimestampMs,
}

enum Applied {
    Synced,
    Failed,
    Deferred,
    Skipped,
}

pub struct TransferExecutor {
    central: Arc<dyn CentralStore>,
    retry: RetryPolicy,
    timeout: Duration,
    max_conflict_retries: u32,
}

impl TransferExecutor {
    pub fn new(
        central: Arc<dyn CentralStore>,
        retry: RetryPolicy,
        timeout: Duration,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            central,
            retry,
            timeout,
            max_conflict_retries,
        }
    }

    /// Uploads `batch` and applies the outcome to the outlet's store.
    pub async fn transfer(
        &self,
        handle: &OutletStoreHandle,
        batch: &[SaleRecord],
    ) -> SyncResult<BatchReport> {
        let sent = self.send(handle.outlet_id(), batch).await;
        self.apply(handle, batch, sent, now_ms()).await
    }

    /// The network half of a transfer, bounded by the configured timeout.
    /// Touches no local state.
    pub async fn send(
        &self,
        outlet_id: &str,
        batch: &[SaleRecord],
    ) -> Result<Vec<UpsertAck>, TransferError> {
        match tokio::time::timeout(self.timeout, self.central.upsert_batch(outlet_id, batch)).await {
            Ok(res) => res,
            Err(_) => Err(TransferError::Transient(format!(
                "central store did not answer within {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Applies the verdicts of an attempt made at `at_ms`.
    ///
    /// Acknowledged records follow their own verdict; records the center did
    /// not mention count as a transient failure. A whole-batch error applies
    /// to every record.
    pub async fn apply(
        &self,
        handle: &OutletStoreHandle,
        batch: &[SaleRecord],
        sent: Result<Vec<UpsertAck>, TransferError>,
        at_ms: TimestampMs,
    ) -> SyncResult<BatchReport> {
        let outlet_id = handle.outlet_id();
        let verdicts: HashMap<RecordId, UpsertOutcome> = match &sent {
            Ok(acks) => acks
                .iter()
                .map(|ack| (ack.id.clone(), ack.outcome.clone()))
                .collect(),
            Err(err) => {
                warn!(outlet_id, records = batch.len(), error = %err, "batch transfer failed");
                HashMap::new()
            }
        };

        let mut report = BatchReport {
            outlet_id: outlet_id.to_string(),
            record_ids: batch.iter().map(|r| r.id.clone()).collect(),
            synced: 0,
            failed: 0,
            deferred: 0,
            skipped: 0,
            outcome: BatchOutcome::Success,
            at_ms,
        };

        for rec in batch {
            let verdict = match &sent {
                Ok(_) => verdicts.get(&rec.id).cloned().map(Ok),
                Err(TransferError::Permanent(reason)) => Some(Err(reason.clone())),
                Err(TransferError::Transient(_)) => None,
            };
            let applied = match verdict {
                Some(Ok(UpsertOutcome::Accepted)) => {
                    self.apply_cas(handle, rec, |_| SyncTransition::MarkSynced { at_ms })
                        .await?
                }
                Some(Ok(UpsertOutcome::Rejected { reason })) | Some(Err(reason)) => {
                    self.apply_cas(handle, rec, |_| SyncTransition::MarkFailed {
                        at_ms,
                        reason: reason.clone(),
                    })
                    .await?
                }
                None => {
                    self.apply_cas(handle, rec, |current| SyncTransition::Defer {
                        at_ms,
                        next_attempt_at_ms: self.retry.next_attempt_at(at_ms, current.sync_attempts),
                    })
                    .await?
                }
            };
            match applied {
                Applied::Synced => report.synced += 1,
                Applied::Failed => report.failed += 1,
                Applied::Deferred => report.deferred += 1,
                Applied::Skipped => report.skipped += 1,
            }
        }

        report.outcome = classify(&report);
        Ok(report)
    }

    /// Applies a transition as a compare-and-set on the record's revision,
    /// re-reading and rebuilding the transition after a conflict.
    async fn apply_cas(
        &self,
        handle: &OutletStoreHandle,
        rec: &SaleRecord,
        make: impl Fn(&SaleRecord) -> SyncTransition,
    ) -> SyncResult<Applied> {
        match self.try_apply_cas(handle, rec, make).await {
            Err(SyncError::ConcurrencyConflict { record_id }) => {
                warn!(outlet_id = handle.outlet_id(), record_id = %record_id, "status update kept conflicting; left for the next pass");
                Ok(Applied::Skipped)
            }
            other => other,
        }
    }

    async fn try_apply_cas(
        &self,
        handle: &OutletStoreHandle,
        rec: &SaleRecord,
        make: impl Fn(&SaleRecord) -> SyncTransition,
    ) -> SyncResult<Applied> {
        let mut current = rec.clone();
        for _ in 0..=self.max_conflict_retries {
            if current.sync_status != SyncStatus::Pending {
                return Ok(Applied::Skipped);
            }
            let transition = make(&current);
            let applied = match transition.target() {
                SyncStatus::Synced => Applied::Synced,
                SyncStatus::Failed => Applied::Failed,
                SyncStatus::Pending => Applied::Deferred,
            };
            match handle
                .apply_transition(current.id.clone(), transition, Some(current.revision))
                .await
            {
                Ok(updated) => {
                    debug!(outlet_id = handle.outlet_id(), record_id = %updated.id, status = ?updated.sync_status, "sync status updated");
                    return Ok(applied);
                }
                Err(RuntimeError::Store(StoreError::RevisionConflict { .. })) => {
                    match handle.get(current.id.clone()).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(Applied::Skipped),
                    }
                }
                Err(RuntimeError::Store(
                    StoreError::InvalidTransition { .. } | StoreError::MissingRecord(_),
                )) => return Ok(Applied::Skipped),
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::ConcurrencyConflict {
            record_id: current.id,
        })
    }
}

fn classify(report: &BatchReport) -> BatchOutcome {
    match (report.synced, report.failed, report.deferred) {
        (0, 0, 0) if report.skipped > 0 => BatchOutcome::Stale,
        (_, 0, 0) => BatchOutcome::Success,
        (0, 0, _) => BatchOutcome::TransientFailure,
        (0, _, 0) => BatchOutcome::PermanentFailure,
        _ => BatchOutcome::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(synced: usize, failed: usize, deferred: usize) -> BatchReport {
        with_skipped(synced, failed, deferred, 0)
    }

    fn with_skipped(synced: usize, failed: usize, deferred: usize, skipped: usize) -> BatchReport {
        BatchReport {
            outlet_id: "o".into(),
            record_ids: Vec::new(),
            synced,
            failed,
            deferred,
            skipped,
            outcome: BatchOutcome::Success,
            at_ms: 0,
        }
    }

    #[test]
    fn outcome_follows_verdict_mix() {
        assert_eq!(classify(&report(3, 0, 0)), BatchOutcome::Success);
        assert_eq!(classify(&report(0, 0, 3)), BatchOutcome::TransientFailure);
        assert_eq!(classify(&report(0, 3, 0)), BatchOutcome::PermanentFailure);
        assert_eq!(classify(&report(2, 1, 0)), BatchOutcome::Partial);
        assert_eq!(classify(&report(0, 1, 1)), BatchOutcome::Partial);
    }

    #[test]
    fn batch_with_nothing_left_to_update_is_stale() {
        assert_eq!(classify(&with_skipped(0, 0, 0, 4)), BatchOutcome::Stale);
        assert_eq!(classify(&with_skipped(1, 0, 0, 3)), BatchOutcome::Success);
        assert_eq!(classify(&with_skipped(0, 2, 0, 2)), BatchOutcome::PermanentFailure);
    }
}
