//! Central data store contract and an in-process implementation.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    sale::{LineItem, SaleRecord, total_of},
    types::{Cents, LifecycleStatus, OutletId, RecordId, TimestampMs},
};

/// Outcome class of a failed transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Timeout, connection failure, 5xx and the like; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Rejection of the whole batch; records are marked failed.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

/// Sale payload as stored centrally: the business fields without local sync
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralSale {
    pub id: RecordId,
    pub outlet_id: OutletId,
    pub ts_ms: TimestampMs,
    pub line_items: Vec<LineItem>,
    pub total: Cents,
    pub lifecycle: LifecycleStatus,
}

impl From<&SaleRecord> for CentralSale {
    fn from(rec: &SaleRecord) -> Self {
        Self {
            id: rec.id.clone(),
            outlet_id: rec.outlet_id.clone(),
            ts_ms: rec.ts_ms,
            line_items: rec.line_items.clone(),
            total: rec.total,
            lifecycle: rec.lifecycle,
        }
    }
}

/// Per-record verdict from the center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertAck {
    pub id: RecordId,
    #[serde(flatten)]
    pub outcome: UpsertOutcome,
}

impl UpsertAck {
    pub fn accepted(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            outcome: UpsertOutcome::Accepted,
        }
    }

    pub fn rejected(id: impl Into<RecordId>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: UpsertOutcome::Rejected {
                reason: reason.into(),
            },
        }
    }
}

/// The authoritative store every outlet uploads to.
///
/// `upsert_batch` must be idempotent per record id: repeating an accepted
/// record leaves the central state unchanged and acknowledges it again.
#[async_trait]
pub trait CentralStore: Send + Sync {
    async fn upsert_batch(
        &self,
        outlet_id: &str,
        records: &[SaleRecord],
    ) -> Result<Vec<UpsertAck>, TransferError>;
}

const SHARDS: usize = 16;

/// Central store kept in process memory, sharded by record id so outlets
/// upserting different records do not contend.
pub struct InMemoryCentralStore {
    shards: Vec<Mutex<HashMap<RecordId, CentralSale>>>,
    upsert_calls: AtomicUsize,
}

impl Default for InMemoryCentralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCentralStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, id: &str) -> Option<CentralSale> {
        self.shard(id).lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Central records owned by `outlet_id`.
    pub fn count_for_outlet(&self, outlet_id: &str) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().filter(|sale| sale.outlet_id == outlet_id).count())
            .sum()
    }

    /// Number of `upsert_batch` calls served.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::Relaxed)
    }

    /// Upserts one record, serialized against other writers of the same id.
    pub fn upsert_one(&self, outlet_id: &str, sale: CentralSale) -> UpsertOutcome {
        if let Err(reason) = validate_sale(outlet_id, &sale) {
            return UpsertOutcome::Rejected { reason };
        }

        let mut shard = self.shard(&sale.id).lock();
        match shard.get(&sale.id) {
            Some(existing) if existing.outlet_id != sale.outlet_id => UpsertOutcome::Rejected {
                reason: format!(
                    "duplicate key {} already owned by outlet {}",
                    sale.id, existing.outlet_id
                ),
            },
            Some(existing) if existing.ts_ms > sale.ts_ms => UpsertOutcome::Accepted,
            _ => {
                shard.insert(sale.id.clone(), sale);
                UpsertOutcome::Accepted
            }
        }
    }

    fn shard(&self, id: &str) -> &Mutex<HashMap<RecordId, CentralSale>> {
        let hash = id.bytes().fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
        &self.shards[hash % SHARDS]
    }
}

#[async_trait]
impl CentralStore for InMemoryCentralStore {
    async fn upsert_batch(
        &self,
        outlet_id: &str,
        records: &[SaleRecord],
    ) -> Result<Vec<UpsertAck>, TransferError> {
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);
        Ok(records
            .iter()
            .map(|rec| UpsertAck {
                id: rec.id.clone(),
                outcome: self.upsert_one(outlet_id, CentralSale::from(rec)),
            })
            .collect())
    }
}

/// Center-side validation; the error text becomes the record's sync error.
pub fn validate_sale(outlet_id: &str, sale: &CentralSale) -> Result<(), String> {
    if sale.outlet_id != outlet_id {
        return Err(format!(
            "sale belongs to outlet {}, uploaded by {outlet_id}",
            sale.outlet_id
        ));
    }
    if sale.line_items.is_empty() {
        return Err("sale has no line items".to_string());
    }
    if let Some(item) = sale.line_items.iter().find(|i| i.quantity == 0) {
        return Err(format!("line item {} has zero quantity", item.product_id));
    }
    if let Some(item) = sale.line_items.iter().find(|i| i.unit_price < 0) {
        return Err(format!("line item {} has negative unit price", item.product_id));
    }
    match total_of(&sale.line_items) {
        Some(total) if total == sale.total => Ok(()),
        Some(total) => Err(format!(
            "total {} does not match line items ({total})",
            sale.total
        )),
        None => Err("line item amounts overflow".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sale(id: &str, outlet: &str, ts_ms: u64) -> CentralSale {
        CentralSale {
            id: id.to_string(),
            outlet_id: outlet.to_string(),
            ts_ms,
            line_items: vec![LineItem {
                product_id: "p".to_string(),
                quantity: 1,
                unit_price: 250,
            }],
            total: 250,
            lifecycle: LifecycleStatus::Completed,
        }
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let central = InMemoryCentralStore::new();
        assert_eq!(central.upsert_one("o1", sale("r1", "o1", 5)), UpsertOutcome::Accepted);
        let first = central.get("r1");
        assert_eq!(central.upsert_one("o1", sale("r1", "o1", 5)), UpsertOutcome::Accepted);
        assert_eq!(central.len(), 1);
        assert_eq!(central.get("r1"), first);
    }

    #[test]
    fn foreign_duplicate_key_is_rejected() {
        let central = InMemoryCentralStore::new();
        central.upsert_one("o1", sale("r1", "o1", 5));
        let out = central.upsert_one("o2", sale("r1", "o2", 5));
        assert!(matches!(out, UpsertOutcome::Rejected { .. }));
        assert_eq!(central.get("r1").map(|s| s.outlet_id), Some("o1".to_string()));
    }

    #[test]
    fn validation_catches_bad_totals() {
        let mut bad = sale("r1", "o1", 1);
        bad.total = 1;
        assert!(validate_sale("o1", &bad).unwrap_err().contains("does not match"));

        let mut empty = sale("r2", "o1", 1);
        empty.line_items.clear();
        empty.total = 0;
        assert_eq!(validate_sale("o1", &empty), Err("sale has no line items".to_string()));
    }

    #[test]
    fn ack_wire_format_is_tagged() {
        let json = serde_json::to_value(UpsertAck::rejected("r1", "nope")).unwrap();
        assert_eq!(json, serde_json::json!({"id": "r1", "status": "rejected", "reason": "nope"}));
        let back: UpsertAck = serde_json::from_str(r#"{"id":"r2","status":"accepted"}"#).unwrap();
        assert_eq!(back, UpsertAck::accepted("r2"));
    }
}
