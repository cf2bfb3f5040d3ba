//! Shared primitive IDs and status enums.

use serde::{Deserialize, Serialize};

/// Opaque, immutable sale record identifier (UUID v4 text).
pub type RecordId = String;
/// Outlet identifier; also names the outlet's local store.
pub type OutletId = String;
/// Product identifier as issued by the catalogue.
pub type ProductId = String;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;
/// Amount in minor currency units (cents).
pub type Cents = i64;

/// Business status of a sale, independent of synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecycleStatus {
    /// Sale was completed at the till.
    #[default]
    Completed,
    /// Sale was cancelled.
    Cancelled,
    /// Sale is awaiting completion.
    Pending,
}

/// Upload progress of a sale record towards the central store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    /// Awaiting (re)transfer.
    #[default]
    Pending,
    /// Accepted by the central store. Terminal.
    Synced,
    /// Permanently rejected; awaits operator re-queue.
    Failed,
}

/// Operating status of an outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutletStatus {
    /// Trading; scheduled for sync.
    #[default]
    Active,
    /// Closed; not scheduled.
    Inactive,
    /// Temporarily out of service; not scheduled.
    Maintenance,
}

impl OutletStatus {
    /// True when the scheduler may run passes for the outlet.
    pub fn is_syncable(self) -> bool {
        matches!(self, OutletStatus::Active)
    }
}
