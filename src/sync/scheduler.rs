//! Per-outlet sync passes, the worker pool, and the background tick loop.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SyncConfig,
    core::store::now_ms,
    registry::LocalStoreRegistry,
    runtime::handle::RequeueSelector,
    types::{OutletId, TimestampMs},
};

use super::executor::{BatchOutcome, BatchReport, TransferExecutor};

/// Idle/Syncing flag and cancellation source for one outlet.
#[derive(Default)]
struct OutletSyncState {
    syncing: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl OutletSyncState {
    fn try_begin(self: &Arc<Self>) -> Option<PassGuard> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(Arc::clone(self)))
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancels the running pass, if any; later passes get a fresh token.
    fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Returns the outlet to Idle when the pass ends, however it ends.
struct PassGuard(Arc<OutletSyncState>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.syncing.store(false, Ordering::Release);
    }
}

/// Totals over all batches of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub outlet_id: OutletId,
    pub batches: usize,
    pub synced: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub started_at_ms: TimestampMs,
    pub finished_at_ms: TimestampMs,
}

impl PassReport {
    fn absorb(&mut self, batch: &BatchReport) {
        self.batches += 1;
        self.synced += batch.synced;
        self.failed += batch.failed;
        self.deferred += batch.deferred;
        self.skipped += batch.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass for the outlet was already running.
    AlreadySyncing,
    /// The outlet is unknown or not active.
    Inactive,
    /// Stopped before finishing; the in-flight batch was abandoned.
    Cancelled(PassReport),
    NothingPending,
    /// The outlet's store could not be provisioned or has stopped.
    Unavailable,
}

pub struct SyncScheduler {
    registry: Arc<LocalStoreRegistry>,
    executor: TransferExecutor,
    states: Mutex<HashMap<OutletId, Arc<OutletSyncState>>>,
    workers: Arc<Semaphore>,
    wake: Notify,
    batch_size: usize,
    tick_interval: Duration,
    auto_requeue_failed_after_ms: Option<u64>,
}

impl SyncScheduler {
    pub fn new(registry: Arc<LocalStoreRegistry>, executor: TransferExecutor, config: &SyncConfig) -> Self {
        Self {
            registry,
            executor,
            states: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_concurrent_outlets.max(1))),
            wake: Notify::new(),
            batch_size: config.batch_size.max(1),
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            auto_requeue_failed_after_ms: config.auto_requeue_failed_after_ms,
        }
    }

    pub fn is_syncing(&self, outlet_id: &str) -> bool {
        self.states
            .lock()
            .get(outlet_id)
            .is_some_and(|s| s.syncing.load(Ordering::Acquire))
    }

    pub fn cancel_outlet(&self, outlet_id: &str) {
        if let Some(state) = self.states.lock().get(outlet_id) {
            state.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for state in self.states.lock().values() {
            state.cancel();
        }
    }

    /// Wakes the background loop for an immediate tick.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Runs one pass over `outlet_id`'s eligible records.
    ///
    /// At most one pass per outlet runs at a time; a concurrent call returns
    /// [`PassOutcome::AlreadySyncing`] without waiting.
    pub async fn sync_outlet(&self, outlet_id: &str) -> PassOutcome {
        let state = self.state(outlet_id);
        // Taken before the status check so a deactivation racing this call
        // either fails the check or cancels the token.
        let cancel = state.token();
        if !self.registry.is_syncable(outlet_id) {
            return PassOutcome::Inactive;
        }
        let Some(_guard) = state.try_begin() else {
            debug!(outlet_id, "pass already running");
            return PassOutcome::AlreadySyncing;
        };
        let Ok(_permit) = self.workers.acquire().await else {
            return PassOutcome::Unavailable;
        };

        let handle = match self.registry.get_or_create(outlet_id).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(outlet_id, error = %err, "skipping outlet this tick");
                return PassOutcome::Unavailable;
            }
        };

        let started_at_ms = now_ms();
        if let Some(after) = self.auto_requeue_failed_after_ms {
            let cutoff = started_at_ms.saturating_sub(after);
            match handle.requeue(RequeueSelector::FailedBefore(cutoff)).await {
                Ok(ids) if !ids.is_empty() => {
                    info!(outlet_id, records = ids.len(), "re-queued failed records");
                }
                Ok(_) => {}
                Err(err) => warn!(outlet_id, error = %err, "automatic re-queue failed"),
            }
        }

        let pending = match handle.list_pending(started_at_ms, None).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(outlet_id, error = %err, "could not read pending records");
                return PassOutcome::Unavailable;
            }
        };
        if pending.is_empty() {
            return PassOutcome::NothingPending;
        }

        let mut report = PassReport {
            outlet_id: outlet_id.to_string(),
            started_at_ms,
            ..PassReport::default()
        };

        for batch in pending.chunks(self.batch_size) {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.finished_at_ms = now_ms();
                    info!(outlet_id, synced = report.synced, "sync pass cancelled");
                    return PassOutcome::Cancelled(report);
                }
                sent = self.executor.send(outlet_id, batch) => sent,
            };
            let batch_report = match self.executor.apply(&handle, batch, sent, now_ms()).await {
                Ok(batch_report) => batch_report,
                Err(err) => {
                    error!(outlet_id, error = %err, "applying batch verdicts failed");
                    break;
                }
            };
            report.absorb(&batch_report);
            if batch_report.outcome == BatchOutcome::TransientFailure {
                debug!(outlet_id, "center unavailable; remaining batches wait for the next tick");
                break;
            }
        }

        report.finished_at_ms = now_ms();
        if report.synced > 0 {
            self.registry.record_synced_at(outlet_id, report.finished_at_ms);
        }
        info!(
            outlet_id,
            batches = report.batches,
            synced = report.synced,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped,
            "sync pass finished"
        );
        PassOutcome::Completed(report)
    }

    /// One pass over every active outlet, concurrently up to the worker limit.
    pub async fn tick(self: &Arc<Self>) -> Vec<(OutletId, PassOutcome)> {
        let mut set = JoinSet::new();
        for outlet_id in self.registry.syncable_outlet_ids() {
            let this = Arc::clone(self);
            set.spawn(async move {
                let outcome = this.sync_outlet(&outlet_id).await;
                (outlet_id, outcome)
            });
        }

        let mut out = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => out.push(result),
                Err(err) => error!(error = %err, "sync pass task failed"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Ticks every interval or on [`Self::trigger`] until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.tick_interval.as_millis() as u64, "sync scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            let outcomes = self.tick().await;
            debug!(outlets = outcomes.len(), "tick finished");
        }
        info!("sync scheduler stopped");
    }

    fn state(&self, outlet_id: &str) -> Arc<OutletSyncState> {
        let mut states = self.states.lock();
        Arc::clone(states.entry(outlet_id.to_string()).or_default())
    }
}
