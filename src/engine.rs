//! Facade wiring the registry, scheduler, executor and reporter together.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::SyncConfig,
    core::store::{StoreError, now_ms},
    error::{SyncError, SyncResult},
    persist::StoreFactory,
    registry::{LocalStoreRegistry, Outlet},
    runtime::{
        events::SaleEvent,
        handle::{RequeueSelector, RuntimeError},
    },
    sale::{SaleDraft, SaleRecord, SyncTransition},
    sync::{
        central::CentralStore,
        executor::TransferExecutor,
        reporter::{ConsolidatedReport, SyncReporter, SyncSummary},
        scheduler::{PassOutcome, SyncScheduler},
    },
    types::{OutletId, OutletStatus, RecordId, SyncStatus},
};

struct Background {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SyncEngine {
    config: SyncConfig,
    registry: Arc<LocalStoreRegistry>,
    scheduler: Arc<SyncScheduler>,
    reporter: SyncReporter,
    background: Mutex<Option<Background>>,
}

impl SyncEngine {
    /// Builds an engine over `factory` stores uploading to `central`, with the
    /// configured outlets registered.
    pub fn new(
        config: SyncConfig,
        factory: Arc<dyn StoreFactory>,
        central: Arc<dyn CentralStore>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let registry = Arc::new(LocalStoreRegistry::new(factory, config.runtime.clone()));
        for outlet in &config.outlets {
            registry.register_outlet(outlet.clone())?;
        }
        let executor = TransferExecutor::new(
            central,
            config.retry.clone(),
            Duration::from_millis(config.transfer_timeout_ms),
            config.max_conflict_retries,
        );
        let scheduler = Arc::new(SyncScheduler::new(Arc::clone(&registry), executor, &config));
        let reporter = SyncReporter::new(
            Arc::clone(&registry),
            Duration::from_millis(config.reporter_cache_ttl_ms),
        );
        Ok(Self {
            config,
            registry,
            scheduler,
            reporter,
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocalStoreRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn register_outlet(&self, outlet: Outlet) -> SyncResult<()> {
        self.registry.register_outlet(outlet)
    }

    /// Records a new pending sale for the outlet, registering the outlet as
    /// active if it is unknown. Sync state never makes this fail.
    pub async fn record_sale(&self, outlet_id: &str, draft: SaleDraft) -> SyncResult<RecordId> {
        let handle = self.registry.get_or_create(outlet_id).await?;
        let id = handle.append(draft).await?;
        self.reporter.invalidate(outlet_id);
        Ok(id)
    }

    pub async fn get_sale(&self, outlet_id: &str, record_id: &str) -> SyncResult<Option<SaleRecord>> {
        let handle = self.registry.get_or_create(outlet_id).await?;
        Ok(handle.get(record_id).await?)
    }

    /// Eligible pending records for the outlet, oldest first.
    pub async fn list_pending(&self, outlet_id: &str) -> SyncResult<Vec<SaleRecord>> {
        let handle = self.registry.get_or_create(outlet_id).await?;
        Ok(handle.list_pending(now_ms(), None).await?)
    }

    /// Moves a record to `status`, choosing the matching transition from its
    /// current state. `error` is the reason stored with `Failed`.
    pub async fn update_sync_status(
        &self,
        outlet_id: &str,
        record_id: &str,
        status: SyncStatus,
        error: Option<String>,
    ) -> SyncResult<SaleRecord> {
        let handle = self.registry.get_or_create(outlet_id).await?;
        let current = handle
            .get(record_id)
            .await?
            .ok_or_else(|| RuntimeError::from(StoreError::MissingRecord(record_id.to_string())))?;
        let at_ms = now_ms();
        let transition = match (current.sync_status, status) {
            (_, SyncStatus::Synced) => SyncTransition::MarkSynced { at_ms },
            (_, SyncStatus::Failed) => SyncTransition::MarkFailed {
                at_ms,
                reason: error.unwrap_or_else(|| "rejected".to_string()),
            },
            (SyncStatus::Failed, SyncStatus::Pending) => SyncTransition::Requeue,
            (_, SyncStatus::Pending) => SyncTransition::Defer {
                at_ms,
                next_attempt_at_ms: self.config.retry.next_attempt_at(at_ms, current.sync_attempts),
            },
        };
        let updated = handle
            .apply_transition(record_id, transition, Some(current.revision))
            .await
            .map_err(|err| match err {
                RuntimeError::Store(StoreError::RevisionConflict { id, .. }) => {
                    SyncError::ConcurrencyConflict { record_id: id }
                }
                other => other.into(),
            })?;
        self.reporter.invalidate(outlet_id);
        Ok(updated)
    }

    /// Puts failed records back into the automatic retry set.
    pub async fn requeue_failed(
        &self,
        outlet_id: &str,
        selector: RequeueSelector,
    ) -> SyncResult<Vec<RecordId>> {
        if self.registry.outlet(outlet_id).is_none() {
            return Err(SyncError::UnknownOutlet(outlet_id.to_string()));
        }
        let handle = self.registry.get_or_create(outlet_id).await?;
        let moved = handle.requeue(selector).await?;
        self.reporter.invalidate(outlet_id);
        info!(outlet_id, records = moved.len(), "failed records re-queued");
        Ok(moved)
    }

    /// Changes the outlet's status; leaving `Active` cancels its running pass.
    pub fn set_outlet_status(&self, outlet_id: &str, status: OutletStatus) -> SyncResult<()> {
        let previous = self.registry.set_status(outlet_id, status)?;
        if !status.is_syncable() {
            self.scheduler.cancel_outlet(outlet_id);
        }
        info!(outlet_id, from = ?previous, to = ?status, "outlet status changed");
        Ok(())
    }

    /// Runs a pass for one outlet right away.
    pub async fn sync_now(&self, outlet_id: &str) -> SyncResult<PassOutcome> {
        if self.registry.outlet(outlet_id).is_none() {
            return Err(SyncError::UnknownOutlet(outlet_id.to_string()));
        }
        let outcome = self.scheduler.sync_outlet(outlet_id).await;
        self.reporter.invalidate(outlet_id);
        Ok(outcome)
    }

    /// Runs one pass over every active outlet.
    pub async fn tick(&self) -> Vec<(OutletId, PassOutcome)> {
        let outcomes = self.scheduler.tick().await;
        for (outlet_id, _) in &outcomes {
            self.reporter.invalidate(outlet_id);
        }
        outcomes
    }

    /// Wakes the background loop, if running.
    pub fn trigger(&self) {
        self.scheduler.trigger();
    }

    pub async fn summary(&self, outlet_id: Option<&str>) -> SyncResult<SyncSummary> {
        self.reporter.summary(outlet_id).await
    }

    pub async fn consolidated(&self) -> ConsolidatedReport {
        self.reporter.consolidated().await
    }

    pub async fn subscribe(&self, outlet_id: &str) -> SyncResult<broadcast::Receiver<SaleEvent>> {
        Ok(self.registry.get_or_create(outlet_id).await?.subscribe())
    }

    /// Starts the background tick loop; a second call is a no-op.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.scheduler).run(shutdown.clone()));
        *background = Some(Background { shutdown, task });
    }

    /// Stops the background loop, cancels running passes, and flushes every
    /// outlet store.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let background = self.background.lock().take();
        if let Some(Background { shutdown, task }) = background {
            shutdown.cancel();
            self.scheduler.cancel_all();
            if let Err(err) = task.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        } else {
            self.scheduler.cancel_all();
        }
        self.registry.shutdown_all().await
    }
}
