use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    op::{Op, StoredOp},
    sale::{SaleDraft, SaleRecord, SyncTransition, total_of},
    types::{Cents, OpSeq, OutletId, RecordId, SyncStatus, TimestampMs},
};

use super::indices::TimeIndex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("sale record {0} not found")]
    MissingRecord(RecordId),
    #[error("sale record {0} already exists")]
    AlreadyExists(RecordId),
    #[error("sale record {id}: {from:?} -> {to:?} is not an allowed sync transition")]
    InvalidTransition {
        id: RecordId,
        from: SyncStatus,
        to: SyncStatus,
    },
    #[error("sale record {id}: expected revision {expected}, found {actual}")]
    RevisionConflict {
        id: RecordId,
        expected: u64,
        actual: u64,
    },
    #[error("sale record belongs to outlet {found}, store holds {expected}")]
    WrongOutlet { expected: OutletId, found: OutletId },
    #[error("sale total overflows")]
    AmountOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    pub outlet_id: OutletId,
    pub next_op_seq: OpSeq,
    pub order: Vec<RecordId>,
    pub records: Vec<SaleRecord>,
}

/// Point-in-time counts over one outlet's records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    /// Latest attempt time among synced records.
    pub last_successful_sync_at_ms: Option<TimestampMs>,
    /// Sum of totals over synced records.
    pub synced_amount: Cents,
    /// Sum of totals over all records.
    pub total_amount: Cents,
}

impl StoreSummary {
    pub fn record_count(&self) -> usize {
        self.pending + self.synced + self.failed
    }
}

#[derive(Debug, Default)]
pub struct SaleStore {
    outlet_id: OutletId,
    records: HashMap<RecordId, SaleRecord>,
    order: Vec<RecordId>,
    pending: TimeIndex,
    failed: TimeIndex,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
}

impl SaleStore {
    pub fn new(outlet_id: impl Into<OutletId>) -> Self {
        Self {
            outlet_id: outlet_id.into(),
            next_op_seq: 1,
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            outlet_id: snapshot.outlet_id,
            next_op_seq: snapshot.next_op_seq,
            order: snapshot.order,
            ..Self::default()
        };

        for rec in snapshot.records {
            if rec.outlet_id != store.outlet_id {
                return Err(StoreError::WrongOutlet {
                    expected: store.outlet_id.clone(),
                    found: rec.outlet_id,
                });
            }
            store.insert_indices(&rec);
            store.records.insert(rec.id.clone(), rec);
        }

        Ok(store)
    }

    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let records = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();

        StoreSnapshotV1 {
            outlet_id: self.outlet_id.clone(),
            next_op_seq: self.next_op_seq,
            order: self.order.clone(),
            records,
        }
    }

    pub fn outlet_id(&self) -> &str {
        &self.outlet_id
    }

    /// Records a new sale as `Pending` under a fresh identifier.
    pub fn append(&mut self, draft: SaleDraft) -> Result<(RecordId, StoredOp), StoreError> {
        let total = total_of(&draft.line_items).ok_or(StoreError::AmountOverflow)?;
        let record = SaleRecord {
            id: Uuid::new_v4().to_string(),
            outlet_id: self.outlet_id.clone(),
            ts_ms: draft.ts_ms,
            line_items: draft.line_items,
            total,
            lifecycle: draft.lifecycle,
            sync_status: SyncStatus::Pending,
            last_sync_attempt_ms: None,
            sync_error: None,
            sync_attempts: 0,
            next_attempt_at_ms: None,
            revision: 0,
        };
        let id = record.id.clone();
        let seq = self.take_next_op_seq();
        let stored = self.apply_append_with_seq(record, seq)?;
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    /// Applies `transition` to record `id`.
    ///
    /// With `expected_revision` set, the update is a compare-and-set: a record
    /// that moved on since it was read yields [`StoreError::RevisionConflict`].
    pub fn transition(
        &mut self,
        id: &str,
        transition: SyncTransition,
        expected_revision: Option<u64>,
    ) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .get(id)
            .ok_or_else(|| StoreError::MissingRecord(id.to_string()))?;
        if let Some(expected) = expected_revision {
            if rec.revision != expected {
                return Err(StoreError::RevisionConflict {
                    id: id.to_string(),
                    expected,
                    actual: rec.revision,
                });
            }
        }
        if !transition.is_allowed_from(rec.sync_status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: rec.sync_status,
                to: transition.target(),
            });
        }

        let seq = self.take_next_op_seq();
        let stored = self.apply_transition_with_seq(id, transition, seq)?;
        self.pending_ops.push(stored.clone());
        Ok(stored)
    }

    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        let seq = stored.seq;
        match stored.op {
            Op::Append { record } => {
                self.apply_append_with_seq(record, seq)?;
            }
            Op::Transition { id, transition } => {
                self.apply_transition_with_seq(&id, transition, seq)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SaleRecord> {
        self.records.get(id)
    }

    pub fn get_cloned(&self, id: &str) -> Option<SaleRecord> {
        self.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pending records eligible at `now_ms`, oldest sale first.
    pub fn list_pending(&self, now_ms: TimestampMs, limit: Option<usize>) -> Vec<SaleRecord> {
        self.pending
            .iter()
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|rec| rec.is_eligible_at(now_ms))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Failed records, oldest sale first; with `attempted_before_ms` set, only
    /// those whose last attempt precedes it.
    pub fn failed_ids(&self, attempted_before_ms: Option<TimestampMs>) -> Vec<RecordId> {
        self.failed
            .iter()
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|rec| match attempted_before_ms {
                Some(cutoff) => rec.last_sync_attempt_ms.is_none_or(|at| at < cutoff),
                None => true,
            })
            .map(|rec| rec.id.clone())
            .collect()
    }

    pub fn summary(&self) -> StoreSummary {
        let mut out = StoreSummary::default();
        for rec in self.records.values() {
            out.total_amount = out.total_amount.saturating_add(rec.total);
            match rec.sync_status {
                SyncStatus::Pending => out.pending += 1,
                SyncStatus::Failed => out.failed += 1,
                SyncStatus::Synced => {
                    out.synced += 1;
                    out.synced_amount = out.synced_amount.saturating_add(rec.total);
                    out.last_successful_sync_at_ms =
                        out.last_successful_sync_at_ms.max(rec.last_sync_attempt_ms);
                }
            }
        }
        out
    }

    pub fn ordered_ids(&self) -> &[RecordId] {
        &self.order
    }

    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn apply_append_with_seq(&mut self, record: SaleRecord, seq: OpSeq) -> Result<StoredOp, StoreError> {
        if record.outlet_id != self.outlet_id {
            return Err(StoreError::WrongOutlet {
                expected: self.outlet_id.clone(),
                found: record.outlet_id,
            });
        }
        if self.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }

        self.insert_indices(&record);
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Append { record },
        })
    }

    fn apply_transition_with_seq(
        &mut self,
        id: &str,
        transition: SyncTransition,
        seq: OpSeq,
    ) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::MissingRecord(id.to_string()))?;
        let from = rec.sync_status;
        if !transition.is_allowed_from(from) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to: transition.target(),
            });
        }

        let key = (rec.ts_ms, rec.id.clone());
        transition.apply_to(rec);
        let to = rec.sync_status;

        if from != to {
            if let Some(idx) = Self::index_for(&mut self.pending, &mut self.failed, from) {
                idx.remove(&key);
            }
            if let Some(idx) = Self::index_for(&mut self.pending, &mut self.failed, to) {
                idx.insert(key);
            }
        }

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms: now_ms(),
            op: Op::Transition {
                id: id.to_string(),
                transition,
            },
        })
    }

    fn insert_indices(&mut self, rec: &SaleRecord) {
        let key = (rec.ts_ms, rec.id.clone());
        if let Some(idx) = Self::index_for(&mut self.pending, &mut self.failed, rec.sync_status) {
            idx.insert(key);
        }
    }

    fn index_for<'a>(
        pending: &'a mut TimeIndex,
        failed: &'a mut TimeIndex,
        status: SyncStatus,
    ) -> Option<&'a mut TimeIndex> {
        match status {
            SyncStatus::Pending => Some(pending),
            SyncStatus::Failed => Some(failed),
            SyncStatus::Synced => None,
        }
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

pub(crate) fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
