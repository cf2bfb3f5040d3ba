//! Engine-level error taxonomy.

use crate::{
    runtime::handle::RuntimeError,
    sync::central::TransferError,
    types::{OutletId, RecordId},
};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The outlet's local store could not be opened; its pass is skipped
    /// and provisioning is retried on the next reference.
    #[error("local store for outlet {outlet_id} is unavailable: {reason}")]
    StoreProvisioning { outlet_id: OutletId, reason: String },
    /// Network or server-side failure, retried with backoff.
    #[error("transient transfer failure: {0}")]
    TransientTransfer(String),
    /// The center rejected the data; surfaced on the records.
    #[error("permanent transfer failure: {0}")]
    PermanentTransfer(String),
    /// Two writers raced on a record's status.
    #[error("concurrent status update on sale record {record_id}")]
    ConcurrencyConflict { record_id: RecordId },
    #[error("unknown outlet {0}")]
    UnknownOutlet(OutletId),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<TransferError> for SyncError {
    fn from(value: TransferError) -> Self {
        match value {
            TransferError::Transient(msg) => SyncError::TransientTransfer(msg),
            TransferError::Permanent(msg) => SyncError::PermanentTransfer(msg),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
