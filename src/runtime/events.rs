//! Runtime event stream payloads.

use crate::types::{OpSeq, RecordId};

/// Events emitted from an outlet store's single-writer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleEvent {
    /// A sale was recorded locally.
    Recorded {
        /// New record id.
        id: RecordId,
    },
    /// The center acknowledged a record.
    Synced {
        /// Synced record id.
        id: RecordId,
    },
    /// The center rejected a record.
    Failed {
        /// Failed record id.
        id: RecordId,
        /// Rejection reason.
        reason: String,
    },
    /// A transient failure pushed the record's next attempt back.
    Deferred {
        /// Deferred record id.
        id: RecordId,
    },
    /// A failed record went back to pending.
    Requeued {
        /// Re-queued record id.
        id: RecordId,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
