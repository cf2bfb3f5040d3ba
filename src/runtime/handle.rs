use std::sync::Arc;

use serde::Deserialize;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{
    core::store::{SaleStore, StoreError, StoreSnapshotV1, StoreSummary},
    op::{Op, StoredOp},
    persist::{OpSink, PersistError},
    sale::{SaleDraft, SaleRecord, SyncTransition},
    types::{OpSeq, RecordId, TimestampMs},
};

use super::events::SaleEvent;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("outlet store runtime is closed")]
    ChannelClosed,
}

/// When `append` resolves relative to the journal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// As soon as the record is in memory and queued for persistence.
    InMemory,
    /// Only after the journal batch holding the record is flushed.
    #[default]
    Durable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub ack_mode: AckMode,
    pub flush_on_append: bool,
    pub batch_max_ops: usize,
    pub batch_max_latency_ms: u64,
    pub persist_queue_bound: usize,
    pub snapshot_every_ops: usize,
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Durable,
            flush_on_append: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
        }
    }
}

/// Cloneable handle to one outlet's single-writer store.
#[derive(Clone, Debug)]
pub struct OutletStoreHandle {
    outlet_id: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SaleEvent>,
}

/// Which failed records a re-queue should move back to pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueSelector {
    /// Exactly these records; ids that are not `Failed` are skipped.
    Ids(Vec<RecordId>),
    /// Every failed record.
    AllFailed,
    /// Failed records whose last attempt precedes the cutoff.
    FailedBefore(TimestampMs),
}

enum Command {
    Append {
        draft: SaleDraft,
        resp: oneshot::Sender<Result<RecordId, RuntimeError>>,
    },
    Transition {
        id: RecordId,
        transition: SyncTransition,
        expected_revision: Option<u64>,
        resp: oneshot::Sender<Result<SaleRecord, RuntimeError>>,
    },
    Requeue {
        selector: RequeueSelector,
        resp: oneshot::Sender<Result<Vec<RecordId>, RuntimeError>>,
    },
    Get {
        id: RecordId,
        resp: oneshot::Sender<Option<SaleRecord>>,
    },
    ListPending {
        now_ms: TimestampMs,
        limit: Option<usize>,
        resp: oneshot::Sender<Vec<SaleRecord>>,
    },
    Summary {
        resp: oneshot::Sender<StoreSummary>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

struct Loop {
    store: SaleStore,
    events_tx: broadcast::Sender<SaleEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    ops_since_snapshot: usize,
}

pub fn spawn_outlet_store(
    store: SaleStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> OutletStoreHandle {
    let outlet_id: Arc<str> = Arc::from(store.outlet_id());
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<SaleEvent>(1024);

    let (persist_tx, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let mut state = Loop {
        store,
        events_tx: events_tx.clone(),
        persist_tx,
        config,
        ops_since_snapshot: 0,
    };
    let loop_outlet = Arc::clone(&outlet_id);

    tokio::spawn(async move {
        loop {
            let mut worker_gone = false;
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        if state.handle_command(cmd).await {
                            break;
                        }
                    }
                    durable = rx.recv() => match durable {
                        Some(Ok(op_seq)) => {
                            let _ = state.events_tx.send(SaleEvent::DurableUpTo { op_seq });
                        }
                        Some(Err(err)) => {
                            error!(outlet_id = %loop_outlet, error = %err, "sale journal write failed");
                        }
                        None => worker_gone = true,
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                if state.handle_command(cmd).await {
                    break;
                }
            }
            if worker_gone {
                durable_rx = None;
            }
        }
        debug!(outlet_id = %loop_outlet, "outlet store runtime stopped");
    });

    OutletStoreHandle {
        outlet_id,
        cmd_tx,
        events_tx,
    }
}

impl OutletStoreHandle {
    pub fn outlet_id(&self) -> &str {
        &self.outlet_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaleEvent> {
        self.events_tx.subscribe()
    }

    /// True once the command loop has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub async fn append(&self, draft: SaleDraft) -> Result<RecordId, RuntimeError> {
        self.request(|resp| Command::Append { draft, resp }).await?
    }

    /// Applies a status transition and returns the updated record.
    pub async fn apply_transition(
        &self,
        id: impl Into<RecordId>,
        transition: SyncTransition,
        expected_revision: Option<u64>,
    ) -> Result<SaleRecord, RuntimeError> {
        let id = id.into();
        self.request(|resp| Command::Transition {
            id,
            transition,
            expected_revision,
            resp,
        })
        .await?
    }

    /// Moves selected failed records back to pending; returns those moved.
    pub async fn requeue(&self, selector: RequeueSelector) -> Result<Vec<RecordId>, RuntimeError> {
        self.request(|resp| Command::Requeue { selector, resp }).await?
    }

    pub async fn get(&self, id: impl Into<RecordId>) -> Result<Option<SaleRecord>, RuntimeError> {
        let id = id.into();
        self.request(|resp| Command::Get { id, resp }).await
    }

    pub async fn list_pending(
        &self,
        now_ms: TimestampMs,
        limit: Option<usize>,
    ) -> Result<Vec<SaleRecord>, RuntimeError> {
        self.request(|resp| Command::ListPending { now_ms, limit, resp })
            .await
    }

    pub async fn summary(&self) -> Result<StoreSummary, RuntimeError> {
        self.request(|resp| Command::Summary { resp }).await
    }

    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Checkpoint { resp }).await?
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

impl Loop {
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Append { draft, resp } => {
                let res = match self.store.append(draft) {
                    Ok((id, _)) => {
                        // The sale exists from here on; the journal write stays
                        // buffered and is retried on the next flush.
                        if let Err(err) = self.persist(true).await {
                            warn!(outlet_id = self.store.outlet_id(), record_id = %id, error = %err, "sale recorded before its journal write succeeded");
                        }
                        let _ = self.events_tx.send(SaleEvent::Recorded { id: id.clone() });
                        Ok(id)
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = resp.send(res);
            }
            Command::Transition {
                id,
                transition,
                expected_revision,
                resp,
            } => {
                let res = self.transition(&id, transition, expected_revision).await;
                let _ = resp.send(res);
            }
            Command::Requeue { selector, resp } => {
                let ids = match selector {
                    RequeueSelector::Ids(ids) => ids,
                    RequeueSelector::AllFailed => self.store.failed_ids(None),
                    RequeueSelector::FailedBefore(cutoff) => self.store.failed_ids(Some(cutoff)),
                };
                let mut moved = Vec::new();
                let mut res = Ok(());
                for id in ids {
                    match self.transition(&id, SyncTransition::Requeue, None).await {
                        Ok(_) => moved.push(id),
                        Err(RuntimeError::Store(err)) => {
                            debug!(outlet_id = self.store.outlet_id(), record_id = %id, error = %err, "requeue skipped");
                        }
                        Err(err) => {
                            res = Err(err);
                            break;
                        }
                    }
                }
                let _ = resp.send(res.map(|()| moved));
            }
            Command::Get { id, resp } => {
                let _ = resp.send(self.store.get_cloned(&id));
            }
            Command::ListPending { now_ms, limit, resp } => {
                let _ = resp.send(self.store.list_pending(now_ms, limit));
            }
            Command::Summary { resp } => {
                let _ = resp.send(self.store.summary());
            }
            Command::Flush { resp } => {
                let out = match self.persist_tx.as_ref() {
                    Some(tx) => flush_persist(tx).await,
                    None => Ok(self.store.latest_op_seq()),
                };
                let _ = resp.send(out);
            }
            Command::Checkpoint { resp } => {
                let out = match self.persist_tx.as_ref() {
                    Some(tx) => {
                        let res = checkpoint_persist(tx, &self.store, &self.config).await;
                        if res.is_ok() {
                            self.ops_since_snapshot = 0;
                        }
                        res
                    }
                    None => Ok(()),
                };
                let _ = resp.send(out);
            }
            Command::Shutdown { resp } => {
                let out = if let Some(tx) = self.persist_tx.as_ref() {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
                    }
                } else {
                    Ok(())
                };
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    async fn transition(
        &mut self,
        id: &str,
        transition: SyncTransition,
        expected_revision: Option<u64>,
    ) -> Result<SaleRecord, RuntimeError> {
        let event = match &transition {
            SyncTransition::MarkSynced { .. } => SaleEvent::Synced { id: id.to_string() },
            SyncTransition::Defer { .. } => SaleEvent::Deferred { id: id.to_string() },
            SyncTransition::MarkFailed { reason, .. } => SaleEvent::Failed {
                id: id.to_string(),
                reason: reason.clone(),
            },
            SyncTransition::Requeue => SaleEvent::Requeued { id: id.to_string() },
        };
        self.store.transition(id, transition, expected_revision)?;
        self.persist(false).await?;
        let _ = self.events_tx.send(event);
        self.store
            .get_cloned(id)
            .ok_or_else(|| StoreError::MissingRecord(id.to_string()).into())
    }

    /// Hands the store's new ops to the journal; with `await_durable` and
    /// [`AckMode::Durable`], waits for the flush.
    async fn persist(&mut self, await_durable: bool) -> Result<(), RuntimeError> {
        let ops = self.store.drain_pending_ops();
        let count = ops.len();
        match self.persist_tx.as_ref() {
            Some(tx) => {
                for stored in ops {
                    tx.send(PersistMsg::Op(stored))
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)?;
                }
                if await_durable && self.config.ack_mode == AckMode::Durable {
                    flush_persist(tx).await?;
                }
            }
            None => {
                let _ = self.events_tx.send(SaleEvent::DurableUpTo {
                    op_seq: self.store.latest_op_seq(),
                });
            }
        }

        self.ops_since_snapshot += count;
        self.maybe_auto_checkpoint().await;
        Ok(())
    }

    async fn maybe_auto_checkpoint(&mut self) {
        if self.config.snapshot_every_ops == 0 || self.ops_since_snapshot < self.config.snapshot_every_ops {
            return;
        }
        let Some(tx) = self.persist_tx.as_ref() else {
            return;
        };

        match checkpoint_persist(tx, &self.store, &self.config).await {
            Ok(()) => self.ops_since_snapshot = 0,
            Err(err) => warn!(outlet_id = self.store.outlet_id(), error = %err, "automatic checkpoint failed"),
        }
    }
}

async fn flush_persist(tx: &mpsc::Sender<PersistMsg>) -> Result<OpSeq, RuntimeError> {
    let (flush_tx, flush_rx) = oneshot::channel();
    tx.send(PersistMsg::Flush { resp: flush_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    flush_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

async fn checkpoint_persist(
    tx: &mpsc::Sender<PersistMsg>,
    store: &SaleStore,
    config: &RuntimeConfig,
) -> Result<(), RuntimeError> {
    let (cp_tx, cp_rx) = oneshot::channel();
    tx.send(PersistMsg::Checkpoint {
        snapshot: store.export_snapshot(),
        last_seq: store.latest_op_seq(),
        compact: config.compact_after_snapshot,
        resp: cp_tx,
    })
    .await
    .map_err(|_| RuntimeError::ChannelClosed)?;
    cp_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let latency = Duration::from_millis(config.batch_max_latency_ms);
        let mut deadline = Instant::now() + latency;
        let mut last_durable: OpSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let is_append = matches!(stored.op, Op::Append { .. });
                            buf.push(stored);

                            if buf.len() >= config.batch_max_ops || (config.flush_on_append && is_append) {
                                let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                                deadline = Instant::now() + latency;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let flush_result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let result = if let Err(err) = flush_result {
                                Err(err)
                            } else {
                                let sink_ref = Arc::clone(&sink);
                                match tokio::task::spawn_blocking(move || {
                                    let mut sink = sink_ref.blocking_lock();
                                    sink.write_snapshot(&snapshot, last_seq)?;
                                    if compact {
                                        let _ = sink.compact_through(last_seq)?;
                                    }
                                    Result::<(), PersistError>::Ok(())
                                }).await {
                                    Ok(inner) => inner,
                                    Err(e) => Err(PersistError::Message(format!("join error: {e}"))),
                                }
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, false).await;
                    deadline = Instant::now() + latency;
                }
            }
        }
    });
}

async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    last_durable: &mut OpSeq,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if buf.is_empty() {
        if call_flush {
            let sink_ref = Arc::clone(sink);
            tokio::task::spawn_blocking(move || {
                let mut sink = sink_ref.blocking_lock();
                sink.flush()
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        }
        return Ok(());
    }

    let ops = std::mem::take(buf);
    let sink_ref = Arc::clone(sink);
    let retained = ops.clone();
    let append_res: Result<OpSeq, PersistError> = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        let seq = sink.append_ops(&ops)?;
        if call_flush {
            sink.flush()?;
        }
        Ok(seq)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(seq) => {
            *last_durable = (*last_durable).max(seq);
            let _ = durable_tx.send(Ok(*last_durable));
            Ok(())
        }
        Err(err) => {
            // Keep the ops so the next flush retries them.
            *buf = retained;
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sale::LineItem, types::LifecycleStatus};

    fn draft(ts: u64) -> SaleDraft {
        SaleDraft {
            ts_ms: ts,
            line_items: vec![LineItem {
                product_id: "tea".to_string(),
                quantity: 1,
                unit_price: 300,
            }],
            lifecycle: LifecycleStatus::Completed,
        }
    }

    fn test_loop(persist_tx: Option<mpsc::Sender<PersistMsg>>) -> Loop {
        let (events_tx, _) = broadcast::channel(16);
        Loop {
            store: SaleStore::new("north"),
            events_tx,
            persist_tx,
            config: RuntimeConfig {
                ack_mode: AckMode::InMemory,
                ..RuntimeConfig::default()
            },
            ops_since_snapshot: 0,
        }
    }

    async fn append(state: &mut Loop, ts: u64) -> RecordId {
        let (resp, rx) = oneshot::channel();
        state
            .handle_command(Command::Append { draft: draft(ts), resp })
            .await;
        rx.await.expect("reply").expect("append")
    }

    #[tokio::test]
    async fn mutations_hand_their_ops_to_the_journal_without_keeping_copies() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut state = test_loop(Some(tx));

        let id = append(&mut state, 1).await;
        state
            .transition(&id, SyncTransition::MarkSynced { at_ms: 9 }, None)
            .await
            .expect("transition");

        assert!(state.store.drain_pending_ops().is_empty());
        let mut seqs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let PersistMsg::Op(stored) = msg {
                seqs.push(stored.seq);
            }
        }
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(state.ops_since_snapshot, 2);
    }

    #[tokio::test]
    async fn stores_without_a_journal_keep_no_op_history() {
        let mut state = test_loop(None);
        for ts in 0..20 {
            append(&mut state, ts).await;
        }
        assert_eq!(state.store.len(), 20);
        assert!(state.store.drain_pending_ops().is_empty());
    }
}
