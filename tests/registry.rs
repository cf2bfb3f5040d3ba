use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use outletsync::{
    SyncError,
    core::store::SaleStore,
    persist::{MemoryStoreFactory, OpSink, PersistError, PersistResult, StoreFactory},
    registry::{LocalStoreRegistry, Outlet},
    runtime::handle::RuntimeConfig,
    sale::{LineItem, SaleDraft},
    types::{LifecycleStatus, OutletStatus},
};

/// Counts provisioning calls; outlets named `slow-*` take a while, and the
/// first `fail_first` calls fail.
struct TestFactory {
    calls: AtomicUsize,
    fail_first: usize,
}

impl TestFactory {
    fn new(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }
}

impl StoreFactory for TestFactory {
    fn provision(&self, outlet_id: &str) -> PersistResult<(SaleStore, Option<Box<dyn OpSink>>)> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if outlet_id.starts_with("slow") {
            std::thread::sleep(Duration::from_millis(400));
        } else {
            std::thread::sleep(Duration::from_millis(20));
        }
        if n < self.fail_first {
            return Err(PersistError::Message("disk unavailable".to_string()));
        }
        Ok((SaleStore::new(outlet_id), None))
    }
}

fn draft() -> SaleDraft {
    SaleDraft {
        ts_ms: 1,
        line_items: vec![LineItem {
            product_id: "p".to_string(),
            quantity: 1,
            unit_price: 10,
        }],
        lifecycle: LifecycleStatus::Completed,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_provisions_once() {
    let factory = TestFactory::new(0);
    let registry = Arc::new(LocalStoreRegistry::new(factory.clone(), RuntimeConfig::default()));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move { registry.get_or_create("north").await }));
    }
    for task in tasks {
        let handle = task.await.expect("join").expect("handle");
        assert_eq!(handle.outlet_id(), "north");
    }
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

    // Every caller got the same store.
    let a = registry.get_or_create("north").await.expect("a");
    a.append(draft()).await.expect("append");
    let b = registry.get("north").expect("provisioned");
    assert_eq!(b.summary().await.expect("summary").pending, 1);
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_provisioning_does_not_block_other_outlets() {
    let registry = Arc::new(LocalStoreRegistry::new(TestFactory::new(0), RuntimeConfig::default()));

    let slow = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_or_create("slow-east").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = tokio::time::timeout(Duration::from_millis(250), registry.get_or_create("west"))
        .await
        .expect("west provisioned while east was still opening")
        .expect("west");
    assert_eq!(fast.outlet_id(), "west");
    assert!(registry.get("slow-east").is_none());

    slow.await.expect("join").expect("east");
    assert!(registry.get("slow-east").is_some());
}

#[tokio::test]
async fn failed_provisioning_is_retried_on_next_reference() {
    let factory = TestFactory::new(1);
    let registry = LocalStoreRegistry::new(factory.clone(), RuntimeConfig::default());

    let err = registry.get_or_create("north").await.unwrap_err();
    match err {
        SyncError::StoreProvisioning { outlet_id, reason } => {
            assert_eq!(outlet_id, "north");
            assert!(reason.contains("disk unavailable"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(registry.get("north").is_none());

    registry.get_or_create("north").await.expect("second attempt");
    assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_outlet_ids_are_provisioning_errors() {
    let registry = LocalStoreRegistry::new(Arc::new(MemoryStoreFactory), RuntimeConfig::default());
    for bad in ["", "../escape", "a/b"] {
        assert!(matches!(
            registry.get_or_create(bad).await,
            Err(SyncError::StoreProvisioning { .. })
        ));
        assert!(registry.outlet(bad).is_none(), "{bad:?} entered the directory");
        assert!(matches!(
            registry.register_outlet(Outlet::with_id(bad)),
            Err(SyncError::StoreProvisioning { .. })
        ));
    }
    assert!(registry.outlets().is_empty());
    assert!(registry.syncable_outlet_ids().is_empty());
}

#[tokio::test]
async fn directory_tracks_status_and_last_sync() {
    let registry = LocalStoreRegistry::new(Arc::new(MemoryStoreFactory), RuntimeConfig::default());
    registry.register_outlet(Outlet {
        id: "hq".into(),
        name: "Head office".into(),
        location: "Montreal".into(),
        address: "1 Main St".into(),
        is_headquarters: true,
        status: OutletStatus::Active,
        last_sync_time_ms: None,
    })
    .expect("register");
    registry.get_or_create("kiosk").await.expect("implicit outlet");

    assert_eq!(registry.syncable_outlet_ids(), vec!["hq".to_string(), "kiosk".to_string()]);
    assert_eq!(registry.outlet("kiosk").map(|o| o.status), Some(OutletStatus::Active));

    let previous = registry.set_status("kiosk", OutletStatus::Maintenance).expect("status");
    assert_eq!(previous, OutletStatus::Active);
    assert!(!registry.is_syncable("kiosk"));
    assert_eq!(registry.syncable_outlet_ids(), vec!["hq".to_string()]);
    assert!(matches!(
        registry.set_status("nowhere", OutletStatus::Inactive),
        Err(SyncError::UnknownOutlet(_))
    ));

    registry.record_synced_at("hq", 500);
    registry.record_synced_at("hq", 400);
    assert_eq!(registry.outlet("hq").and_then(|o| o.last_sync_time_ms), Some(500));
}

#[tokio::test]
async fn shutdown_all_stops_every_store() {
    let registry = LocalStoreRegistry::new(Arc::new(MemoryStoreFactory), RuntimeConfig::default());
    let north = registry.get_or_create("north").await.expect("north");
    registry.get_or_create("south").await.expect("south");
    assert_eq!(registry.handles().len(), 2);

    registry.shutdown_all().await.expect("shutdown");
    assert!(registry.handles().is_empty());
    assert!(north.append(draft()).await.is_err());

    // The outlet stays known and gets a fresh store on the next reference.
    let again = registry.get_or_create("north").await.expect("reprovision");
    assert!(again.append(draft()).await.is_ok());
}

#[tokio::test]
async fn stopped_store_is_provisioned_again() {
    let factory = TestFactory::new(0);
    let registry = LocalStoreRegistry::new(factory.clone(), RuntimeConfig::default());
    let first = registry.get_or_create("north").await.expect("north");
    first.shutdown().await.expect("shutdown");
    for _ in 0..50 {
        if first.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first.is_closed());

    let second = registry.get_or_create("north").await.expect("reprovision");
    assert!(!second.is_closed());
    second.append(draft()).await.expect("append");
    assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
}
