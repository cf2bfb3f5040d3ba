use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use outletsync::{
    core::store::SaleStore,
    sale::{LineItem, SaleDraft, SyncTransition},
    types::LifecycleStatus,
};

fn draft(ts: u64) -> SaleDraft {
    SaleDraft {
        ts_ms: ts,
        line_items: vec![
            LineItem {
                product_id: format!("sku-{}", ts % 97),
                quantity: 1 + (ts % 4) as u32,
                unit_price: 125,
            },
            LineItem {
                product_id: "bag".to_string(),
                quantity: 1,
                unit_price: 10,
            },
        ],
        lifecycle: LifecycleStatus::Completed,
    }
}

fn bench_appends(c: &mut Criterion) {
    c.bench_function("store_append_50k", |b| {
        b.iter(|| {
            let mut store = SaleStore::new("bench");
            for i in 0..50_000u64 {
                let _ = store.append(draft(i)).expect("append");
            }
        });
    });
}

fn bench_transitions(c: &mut Criterion) {
    c.bench_function("store_mark_synced_10k", |b| {
        b.iter(|| {
            let mut store = SaleStore::new("bench");
            let mut ids = Vec::with_capacity(10_000);
            for i in 0..10_000u64 {
                let (id, _) = store.append(draft(i)).expect("append");
                ids.push(id);
            }
            for id in &ids {
                let _ = store
                    .transition(id, SyncTransition::MarkSynced { at_ms: 1 }, None)
                    .expect("transition");
            }
        });
    });
}

fn bench_list_pending(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_pending");
    let mut store = SaleStore::new("bench");
    for i in 0..50_000u64 {
        let (id, _) = store.append(draft(i)).expect("append");
        if i % 2 == 0 {
            let _ = store
                .transition(&id, SyncTransition::MarkSynced { at_ms: 1 }, None)
                .expect("transition");
        }
    }

    for n in [10usize, 50usize, 500usize] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let _ = store.list_pending(u64::MAX, Some(n));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_appends, bench_transitions, bench_list_pending);
criterion_main!(benches);
