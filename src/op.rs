//! Mutation operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    sale::{SaleRecord, SyncTransition},
    types::{OpSeq, RecordId, TimestampMs},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable operation appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Append a fully materialized sale.
    Append {
        /// Appended record.
        record: SaleRecord,
    },
    /// Move a record along the sync state machine.
    Transition {
        /// Record to mutate.
        id: RecordId,
        /// Validated transition.
        transition: SyncTransition,
    },
}

impl Op {
    /// Record touched by this op.
    pub fn record_id(&self) -> &str {
        match self {
            Op::Append { record } => &record.id,
            Op::Transition { id, .. } => id,
        }
    }
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: TimestampMs,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
