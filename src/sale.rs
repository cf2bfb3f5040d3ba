//! Sale domain record, draft, line items, and sync-status transitions.

use serde::{Deserialize, Serialize};

use crate::types::{Cents, LifecycleStatus, OutletId, ProductId, RecordId, SyncStatus, TimestampMs};

/// One line of a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Sold product.
    pub product_id: ProductId,
    /// Units sold.
    pub quantity: u32,
    /// Price per unit in cents.
    pub unit_price: Cents,
}

impl LineItem {
    /// Quantity times unit price, or `None` on overflow.
    pub fn subtotal(&self) -> Option<Cents> {
        Cents::from(self.quantity).checked_mul(self.unit_price)
    }
}

/// Sum of all line subtotals, or `None` on overflow.
pub fn total_of(items: &[LineItem]) -> Option<Cents> {
    items
        .iter()
        .try_fold(0 as Cents, |acc, item| acc.checked_add(item.subtotal()?))
}

/// Fully materialized sale record as kept by an outlet store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    /// Stable record identifier.
    pub id: RecordId,
    /// Owning outlet.
    pub outlet_id: OutletId,
    /// Sale occurrence time.
    pub ts_ms: TimestampMs,
    /// Ordered line items.
    pub line_items: Vec<LineItem>,
    /// Stored total in cents.
    pub total: Cents,
    /// Business status.
    pub lifecycle: LifecycleStatus,
    /// Upload status.
    pub sync_status: SyncStatus,
    /// Most recent transfer attempt.
    pub last_sync_attempt_ms: Option<TimestampMs>,
    /// Rejection reason; set only while `Failed`.
    pub sync_error: Option<String>,
    /// Transient failures since the record last entered `Pending`.
    pub sync_attempts: u32,
    /// Earliest time a deferred record is eligible again.
    pub next_attempt_at_ms: Option<TimestampMs>,
    /// Bumped on every status transition.
    pub revision: u64,
}

impl SaleRecord {
    /// True when the scheduler may pick the record up at `now_ms`.
    pub fn is_eligible_at(&self, now_ms: TimestampMs) -> bool {
        self.sync_status == SyncStatus::Pending
            && self.next_attempt_at_ms.is_none_or(|at| at <= now_ms)
    }
}

/// Payload accepted from the sales front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleDraft {
    /// Sale occurrence time.
    pub ts_ms: TimestampMs,
    /// Ordered line items.
    pub line_items: Vec<LineItem>,
    /// Business status.
    #[serde(default)]
    pub lifecycle: LifecycleStatus,
}

/// A validated change of sync state.
///
/// Allowed edges:
///
/// | from    | transition   | to      |
/// |---------|--------------|---------|
/// | Pending | `MarkSynced` | Synced  |
/// | Pending | `Defer`      | Pending |
/// | Pending | `MarkFailed` | Failed  |
/// | Failed  | `Requeue`    | Pending |
///
/// Nothing leaves `Synced`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTransition {
    /// The center acknowledged the record.
    MarkSynced {
        /// Attempt time.
        at_ms: TimestampMs,
    },
    /// Transient failure; retry no earlier than `next_attempt_at_ms`.
    Defer {
        /// Attempt time.
        at_ms: TimestampMs,
        /// Backoff deadline.
        next_attempt_at_ms: TimestampMs,
    },
    /// The center rejected the record.
    MarkFailed {
        /// Attempt time.
        at_ms: TimestampMs,
        /// Rejection reason.
        reason: String,
    },
    /// Operator or automatic re-queue of a failed record.
    Requeue,
}

impl SyncTransition {
    /// Status the record must hold for this transition to apply.
    pub fn source(&self) -> SyncStatus {
        match self {
            SyncTransition::Requeue => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }

    /// Status the record holds afterwards.
    pub fn target(&self) -> SyncStatus {
        match self {
            SyncTransition::MarkSynced { .. } => SyncStatus::Synced,
            SyncTransition::Defer { .. } | SyncTransition::Requeue => SyncStatus::Pending,
            SyncTransition::MarkFailed { .. } => SyncStatus::Failed,
        }
    }

    /// True when `from` is the allowed source state.
    pub fn is_allowed_from(&self, from: SyncStatus) -> bool {
        from == self.source()
    }

    /// Applies the transition in place. Callers check [`Self::is_allowed_from`] first.
    pub fn apply_to(&self, rec: &mut SaleRecord) {
        match self {
            SyncTransition::MarkSynced { at_ms } => {
                rec.sync_status = SyncStatus::Synced;
                rec.last_sync_attempt_ms = Some(*at_ms);
                rec.sync_error = None;
                rec.next_attempt_at_ms = None;
            }
            SyncTransition::Defer {
                at_ms,
                next_attempt_at_ms,
            } => {
                rec.last_sync_attempt_ms = Some(*at_ms);
                rec.sync_attempts = rec.sync_attempts.saturating_add(1);
                rec.next_attempt_at_ms = Some((*next_attempt_at_ms).max(*at_ms));
            }
            SyncTransition::MarkFailed { at_ms, reason } => {
                rec.sync_status = SyncStatus::Failed;
                rec.last_sync_attempt_ms = Some(*at_ms);
                rec.sync_error = Some(reason.clone());
                rec.next_attempt_at_ms = None;
            }
            SyncTransition::Requeue => {
                rec.sync_status = SyncStatus::Pending;
                rec.sync_error = None;
                rec.sync_attempts = 0;
                rec.next_attempt_at_ms = None;
            }
        }
        rec.revision = rec.revision.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SaleRecord {
        SaleRecord {
            id: "r1".to_string(),
            outlet_id: "o1".to_string(),
            ts_ms: 10,
            line_items: vec![LineItem {
                product_id: "p1".to_string(),
                quantity: 2,
                unit_price: 150,
            }],
            total: 300,
            lifecycle: LifecycleStatus::Completed,
            sync_status: SyncStatus::Pending,
            last_sync_attempt_ms: None,
            sync_error: None,
            sync_attempts: 0,
            next_attempt_at_ms: None,
            revision: 0,
        }
    }

    #[test]
    fn totals_detect_overflow() {
        let ok = [
            LineItem { product_id: "a".into(), quantity: 3, unit_price: 199 },
            LineItem { product_id: "b".into(), quantity: 1, unit_price: 1 },
        ];
        assert_eq!(total_of(&ok), Some(598));

        let huge = [LineItem { product_id: "a".into(), quantity: u32::MAX, unit_price: Cents::MAX }];
        assert_eq!(total_of(&huge), None);
    }

    #[test]
    fn defer_keeps_error_and_bumps_attempts() {
        let mut rec = record();
        let t = SyncTransition::Defer { at_ms: 100, next_attempt_at_ms: 5_100 };
        assert!(t.is_allowed_from(rec.sync_status));
        t.apply_to(&mut rec);
        assert_eq!(rec.sync_status, SyncStatus::Pending);
        assert_eq!(rec.sync_attempts, 1);
        assert_eq!(rec.last_sync_attempt_ms, Some(100));
        assert!(!rec.is_eligible_at(5_099));
        assert!(rec.is_eligible_at(5_100));
        assert_eq!(rec.revision, 1);
    }

    #[test]
    fn nothing_leaves_synced() {
        let mut rec = record();
        SyncTransition::MarkSynced { at_ms: 1 }.apply_to(&mut rec);
        for t in [
            SyncTransition::MarkSynced { at_ms: 2 },
            SyncTransition::Defer { at_ms: 2, next_attempt_at_ms: 3 },
            SyncTransition::MarkFailed { at_ms: 2, reason: "x".into() },
            SyncTransition::Requeue,
        ] {
            assert!(!t.is_allowed_from(rec.sync_status), "{t:?}");
        }
    }
}
