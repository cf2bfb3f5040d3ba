use outletsync::{
    core::store::{SaleStore, StoreError},
    sale::{LineItem, SaleDraft, SyncTransition},
    types::{LifecycleStatus, SyncStatus},
};

fn draft(ts_ms: u64, qty: u32, price: i64) -> SaleDraft {
    SaleDraft {
        ts_ms,
        line_items: vec![LineItem {
            product_id: format!("sku-{qty}"),
            quantity: qty,
            unit_price: price,
        }],
        lifecycle: LifecycleStatus::Completed,
    }
}

#[test]
fn append_creates_pending_record_with_stored_total() {
    let mut store = SaleStore::new("north");
    let (id, op) = store.append(draft(10, 3, 250)).expect("append");

    let rec = store.get(&id).expect("record");
    assert_eq!(rec.outlet_id, "north");
    assert_eq!(rec.total, 750);
    assert_eq!(rec.sync_status, SyncStatus::Pending);
    assert_eq!(rec.last_sync_attempt_ms, None);
    assert_eq!(rec.sync_error, None);
    assert_eq!(op.seq, 1);
    assert_eq!(id.len(), 36);
}

#[test]
fn overflowing_total_is_rejected_without_consuming_a_seq() {
    let mut store = SaleStore::new("north");
    let err = store.append(draft(1, u32::MAX, i64::MAX)).unwrap_err();
    assert_eq!(err, StoreError::AmountOverflow);
    assert!(store.is_empty());
    assert_eq!(store.latest_op_seq(), 0);
}

#[test]
fn list_pending_orders_by_timestamp_and_skips_deferred() {
    let mut store = SaleStore::new("north");
    let (late, _) = store.append(draft(30, 1, 100)).expect("late");
    let (early, _) = store.append(draft(10, 1, 100)).expect("early");
    let (mid, _) = store.append(draft(20, 1, 100)).expect("mid");

    let ids: Vec<_> = store.list_pending(0, None).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![early.clone(), mid.clone(), late.clone()]);

    store
        .transition(
            &mid,
            SyncTransition::Defer {
                at_ms: 100,
                next_attempt_at_ms: 200,
            },
            None,
        )
        .expect("defer");

    let ids: Vec<_> = store.list_pending(150, None).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![early.clone(), late.clone()]);
    let ids: Vec<_> = store.list_pending(200, Some(2)).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![early, mid]);
}

#[test]
fn failed_records_leave_automatic_retry_until_requeued() {
    let mut store = SaleStore::new("north");
    let (id, _) = store.append(draft(1, 1, 100)).expect("append");

    store
        .transition(
            &id,
            SyncTransition::MarkFailed {
                at_ms: 5,
                reason: "unknown product".into(),
            },
            None,
        )
        .expect("fail");
    assert!(store.list_pending(u64::MAX, None).is_empty());
    assert_eq!(store.failed_ids(None), vec![id.clone()]);
    assert_eq!(store.failed_ids(Some(5)), Vec::<String>::new());
    assert_eq!(store.failed_ids(Some(6)), vec![id.clone()]);
    let rec = store.get(&id).expect("record");
    assert_eq!(rec.sync_error.as_deref(), Some("unknown product"));

    store.transition(&id, SyncTransition::Requeue, None).expect("requeue");
    let rec = store.get(&id).expect("record");
    assert_eq!(rec.sync_status, SyncStatus::Pending);
    assert_eq!(rec.sync_error, None);
    assert_eq!(rec.last_sync_attempt_ms, Some(5));
    assert_eq!(store.list_pending(0, None).len(), 1);
}

#[test]
fn synced_is_terminal() {
    let mut store = SaleStore::new("north");
    let (id, _) = store.append(draft(1, 1, 100)).expect("append");
    store
        .transition(&id, SyncTransition::MarkSynced { at_ms: 9 }, None)
        .expect("sync");
    let seq_before = store.latest_op_seq();

    for t in [
        SyncTransition::Requeue,
        SyncTransition::MarkFailed { at_ms: 10, reason: "late".into() },
        SyncTransition::Defer { at_ms: 10, next_attempt_at_ms: 20 },
        SyncTransition::MarkSynced { at_ms: 10 },
    ] {
        let err = store.transition(&id, t, None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: SyncStatus::Synced, .. }));
    }

    let rec = store.get(&id).expect("record");
    assert_eq!(rec.last_sync_attempt_ms, Some(9));
    assert_eq!(rec.sync_error, None);
    assert_eq!(store.latest_op_seq(), seq_before);
}

#[test]
fn stale_revision_is_a_conflict() {
    let mut store = SaleStore::new("north");
    let (id, _) = store.append(draft(1, 1, 100)).expect("append");
    let seen = store.get_cloned(&id).expect("record");

    store
        .transition(&id, SyncTransition::Defer { at_ms: 1, next_attempt_at_ms: 2 }, Some(seen.revision))
        .expect("first writer");
    let err = store
        .transition(&id, SyncTransition::MarkSynced { at_ms: 3 }, Some(seen.revision))
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::RevisionConflict {
            id: id.clone(),
            expected: 0,
            actual: 1,
        }
    );
}

#[test]
fn summary_counts_by_status() {
    let mut store = SaleStore::new("north");
    let (a, _) = store.append(draft(1, 2, 100)).expect("a");
    let (b, _) = store.append(draft(2, 1, 300)).expect("b");
    let _ = store.append(draft(3, 1, 50)).expect("c");

    store.transition(&a, SyncTransition::MarkSynced { at_ms: 40 }, None).expect("sync a");
    store
        .transition(&b, SyncTransition::MarkFailed { at_ms: 41, reason: "x".into() }, None)
        .expect("fail b");

    let summary = store.summary();
    assert_eq!((summary.pending, summary.synced, summary.failed), (1, 1, 1));
    assert_eq!(summary.last_successful_sync_at_ms, Some(40));
    assert_eq!(summary.synced_amount, 200);
    assert_eq!(summary.total_amount, 550);
}

#[test]
fn snapshot_round_trip_keeps_indices() {
    let mut store = SaleStore::new("north");
    let (a, _) = store.append(draft(5, 1, 100)).expect("a");
    let (b, _) = store.append(draft(1, 1, 100)).expect("b");
    store
        .transition(&a, SyncTransition::MarkFailed { at_ms: 7, reason: "x".into() }, None)
        .expect("fail");

    let restored = SaleStore::from_snapshot(store.export_snapshot()).expect("restore");
    assert_eq!(restored.ordered_ids(), store.ordered_ids());
    assert_eq!(restored.failed_ids(None), vec![a]);
    let pending: Vec<_> = restored.list_pending(0, None).into_iter().map(|r| r.id).collect();
    assert_eq!(pending, vec![b]);
    assert_eq!(restored.latest_op_seq(), store.latest_op_seq());
}
