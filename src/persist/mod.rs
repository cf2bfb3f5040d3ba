pub mod sqlite;

use crate::{
    core::store::{SaleStore, StoreSnapshotV1},
    op::StoredOp,
    types::OpSeq,
};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

pub trait OpSink: Send {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}

/// Opens the local store for an outlet: recovered state plus the sink that
/// journals further changes (`None` for non-durable stores).
pub trait StoreFactory: Send + Sync {
    fn provision(&self, outlet_id: &str) -> PersistResult<(SaleStore, Option<Box<dyn OpSink>>)>;
}

/// Non-durable stores, one fresh [`SaleStore`] per call.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreFactory;

impl StoreFactory for MemoryStoreFactory {
    fn provision(&self, outlet_id: &str) -> PersistResult<(SaleStore, Option<Box<dyn OpSink>>)> {
        validate_outlet_id(outlet_id)?;
        Ok((SaleStore::new(outlet_id), None))
    }
}

/// Rejects ids that cannot safely name a per-outlet database file.
pub fn validate_outlet_id(outlet_id: &str) -> PersistResult<()> {
    let bad = outlet_id.is_empty()
        || outlet_id == "."
        || outlet_id == ".."
        || outlet_id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if bad {
        return Err(PersistError::Message(format!(
            "invalid outlet id {outlet_id:?}"
        )));
    }
    Ok(())
}
