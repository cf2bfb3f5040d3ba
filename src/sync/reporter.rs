//! Read-only sync health per outlet and across the chain.

use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use crate::{
    core::store::StoreSummary,
    error::{SyncError, SyncResult},
    registry::LocalStoreRegistry,
    types::{Cents, OutletId, OutletStatus, TimestampMs},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub pending_count: usize,
    pub synced_count: usize,
    pub failed_count: usize,
    pub last_successful_sync_at_ms: Option<TimestampMs>,
}

impl SyncSummary {
    fn add(&mut self, store: &StoreSummary) {
        self.pending_count += store.pending;
        self.synced_count += store.synced;
        self.failed_count += store.failed;
        self.last_successful_sync_at_ms = self
            .last_successful_sync_at_ms
            .max(store.last_successful_sync_at_ms);
    }
}

impl From<&StoreSummary> for SyncSummary {
    fn from(store: &StoreSummary) -> Self {
        let mut out = Self::default();
        out.add(store);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutletReport {
    pub outlet_id: OutletId,
    pub name: String,
    pub status: OutletStatus,
    pub total_sales: usize,
    pub pending: usize,
    pub failed: usize,
    /// Revenue already accepted by the center.
    pub synced_revenue: Cents,
    /// Mean total over all local sales; 0 without sales.
    pub average_sale: Cents,
    pub last_sync_time_ms: Option<TimestampMs>,
}

/// Per-outlet figures plus chain-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidatedReport {
    pub outlets: Vec<OutletReport>,
    pub total_sales: usize,
    pub total_synced_revenue: Cents,
    pub average_sale: Cents,
    /// Outlets whose store could not be read.
    pub unavailable: Vec<OutletId>,
}

pub struct SyncReporter {
    registry: Arc<LocalStoreRegistry>,
    ttl: Duration,
    cache: Mutex<HashMap<OutletId, (Instant, StoreSummary)>>,
}

impl SyncReporter {
    /// `ttl` bounds how stale a served summary may be; zero disables caching.
    pub fn new(registry: Arc<LocalStoreRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Summary for one outlet, or aggregated over every known outlet.
    pub async fn summary(&self, outlet_id: Option<&str>) -> SyncResult<SyncSummary> {
        match outlet_id {
            Some(id) => {
                if self.registry.outlet(id).is_none() {
                    return Err(SyncError::UnknownOutlet(id.to_string()));
                }
                Ok(SyncSummary::from(&self.store_summary(id).await?))
            }
            None => {
                let mut out = SyncSummary::default();
                for outlet in self.registry.outlets() {
                    match self.store_summary(&outlet.id).await {
                        Ok(store) => out.add(&store),
                        Err(err) => warn!(outlet_id = %outlet.id, error = %err, "outlet left out of summary"),
                    }
                }
                Ok(out)
            }
        }
    }

    pub async fn consolidated(&self) -> ConsolidatedReport {
        let mut report = ConsolidatedReport::default();
        let mut total_amount: Cents = 0;
        for outlet in self.registry.outlets() {
            let store = match self.store_summary(&outlet.id).await {
                Ok(store) => store,
                Err(err) => {
                    warn!(outlet_id = %outlet.id, error = %err, "outlet left out of consolidated report");
                    report.unavailable.push(outlet.id);
                    continue;
                }
            };
            let total_sales = store.record_count();
            report.total_sales += total_sales;
            report.total_synced_revenue = report.total_synced_revenue.saturating_add(store.synced_amount);
            total_amount = total_amount.saturating_add(store.total_amount);
            report.outlets.push(OutletReport {
                outlet_id: outlet.id,
                name: outlet.name,
                status: outlet.status,
                total_sales,
                pending: store.pending,
                failed: store.failed,
                synced_revenue: store.synced_amount,
                average_sale: average(store.total_amount, total_sales),
                last_sync_time_ms: outlet.last_sync_time_ms,
            });
        }
        report.average_sale = average(total_amount, report.total_sales);
        report
    }

    /// Drops the cached summary so the next read is fresh.
    pub fn invalidate(&self, outlet_id: &str) {
        self.cache.lock().remove(outlet_id);
    }

    async fn store_summary(&self, outlet_id: &str) -> SyncResult<StoreSummary> {
        if !self.ttl.is_zero() {
            if let Some((at, cached)) = self.cache.lock().get(outlet_id) {
                if at.elapsed() < self.ttl {
                    return Ok(cached.clone());
                }
            }
        }

        let handle = self.registry.get_or_create(outlet_id).await?;
        let fresh = handle.summary().await?;
        if !self.ttl.is_zero() {
            self.cache
                .lock()
                .insert(outlet_id.to_string(), (Instant::now(), fresh.clone()));
        }
        Ok(fresh)
    }
}

fn average(total: Cents, count: usize) -> Cents {
    match Cents::try_from(count) {
        Ok(n) if n > 0 => total / n,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_handles_empty_outlets() {
        assert_eq!(average(0, 0), 0);
        assert_eq!(average(1_000, 3), 333);
    }

    #[test]
    fn summaries_aggregate_latest_sync() {
        let mut out = SyncSummary::default();
        out.add(&StoreSummary {
            pending: 1,
            synced: 2,
            last_successful_sync_at_ms: Some(10),
            ..StoreSummary::default()
        });
        out.add(&StoreSummary {
            failed: 3,
            synced: 1,
            last_successful_sync_at_ms: Some(7),
            ..StoreSummary::default()
        });
        assert_eq!(out.pending_count, 1);
        assert_eq!(out.synced_count, 3);
        assert_eq!(out.failed_count, 3);
        assert_eq!(out.last_successful_sync_at_ms, Some(10));
    }
}
