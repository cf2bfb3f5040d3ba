//! Outlet directory and lazily provisioned per-outlet stores.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    persist::{StoreFactory, validate_outlet_id},
    runtime::handle::{OutletStoreHandle, RuntimeConfig, spawn_outlet_store},
    types::{OutletId, OutletStatus, TimestampMs},
};

/// A retail location owning one local sale store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outlet {
    pub id: OutletId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub is_headquarters: bool,
    #[serde(default)]
    pub status: OutletStatus,
    /// End of the last pass in which the center accepted a record.
    #[serde(default)]
    pub last_sync_time_ms: Option<TimestampMs>,
}

impl Outlet {
    /// An active outlet known only by its id.
    pub fn with_id(id: impl Into<OutletId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            location: String::new(),
            address: String::new(),
            is_headquarters: false,
            status: OutletStatus::Active,
            last_sync_time_ms: None,
        }
    }
}

type Slot = Arc<OnceCell<OutletStoreHandle>>;

/// Maps outlet ids to their store handles, provisioning each store on first
/// reference.
///
/// The slot map lock is only held to fetch or insert a slot; provisioning
/// itself runs inside the slot's `OnceCell`, so a slow outlet never blocks
/// another and concurrent first references share a single store.
pub struct LocalStoreRegistry {
    factory: Arc<dyn StoreFactory>,
    runtime: RuntimeConfig,
    slots: Mutex<HashMap<OutletId, Slot>>,
    outlets: RwLock<HashMap<OutletId, Outlet>>,
}

impl LocalStoreRegistry {
    pub fn new(factory: Arc<dyn StoreFactory>, runtime: RuntimeConfig) -> Self {
        Self {
            factory,
            runtime,
            slots: Mutex::new(HashMap::new()),
            outlets: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the outlet's store handle, creating the store on first use.
    ///
    /// A failed provisioning leaves the slot empty, so the next call retries.
    pub async fn get_or_create(&self, outlet_id: &str) -> SyncResult<OutletStoreHandle> {
        check_outlet_id(outlet_id)?;
        self.ensure_outlet(outlet_id);
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(outlet_id.to_string()).or_default();
            // A store whose runtime has stopped is provisioned again.
            if slot.get().is_some_and(OutletStoreHandle::is_closed) {
                *slot = Slot::default();
            }
            Arc::clone(slot)
        };
        let handle = slot.get_or_try_init(|| self.provision(outlet_id)).await?;
        Ok(handle.clone())
    }

    /// The handle if the store is already provisioned.
    pub fn get(&self, outlet_id: &str) -> Option<OutletStoreHandle> {
        self.slots.lock().get(outlet_id).and_then(|slot| slot.get().cloned())
    }

    /// Handles of every provisioned store.
    pub fn handles(&self) -> Vec<OutletStoreHandle> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Adds or replaces an outlet's directory entry. Its store is still
    /// created lazily.
    pub fn register_outlet(&self, outlet: Outlet) -> SyncResult<()> {
        check_outlet_id(&outlet.id)?;
        self.outlets.write().insert(outlet.id.clone(), outlet);
        Ok(())
    }

    /// Registers an active outlet under `outlet_id` unless one exists.
    fn ensure_outlet(&self, outlet_id: &str) {
        if self.outlets.read().contains_key(outlet_id) {
            return;
        }
        self.outlets
            .write()
            .entry(outlet_id.to_string())
            .or_insert_with(|| Outlet::with_id(outlet_id));
    }

    pub fn outlet(&self, outlet_id: &str) -> Option<Outlet> {
        self.outlets.read().get(outlet_id).cloned()
    }

    /// All known outlets, ordered by id.
    pub fn outlets(&self) -> Vec<Outlet> {
        let mut out: Vec<Outlet> = self.outlets.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Ids of outlets whose status allows a sync pass, ordered by id.
    pub fn syncable_outlet_ids(&self) -> Vec<OutletId> {
        let mut ids: Vec<OutletId> = self
            .outlets
            .read()
            .values()
            .filter(|o| o.status.is_syncable())
            .map(|o| o.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_syncable(&self, outlet_id: &str) -> bool {
        self.outlets
            .read()
            .get(outlet_id)
            .is_some_and(|o| o.status.is_syncable())
    }

    /// Changes an outlet's status and returns the previous one.
    pub fn set_status(&self, outlet_id: &str, status: OutletStatus) -> SyncResult<OutletStatus> {
        let mut outlets = self.outlets.write();
        let outlet = outlets
            .get_mut(outlet_id)
            .ok_or_else(|| SyncError::UnknownOutlet(outlet_id.to_string()))?;
        Ok(std::mem::replace(&mut outlet.status, status))
    }

    pub fn record_synced_at(&self, outlet_id: &str, at_ms: TimestampMs) {
        if let Some(outlet) = self.outlets.write().get_mut(outlet_id) {
            outlet.last_sync_time_ms = outlet.last_sync_time_ms.max(Some(at_ms));
        }
    }

    /// Flushes and stops every provisioned store. Later references provision
    /// the stores again.
    pub async fn shutdown_all(&self) -> SyncResult<()> {
        let slots: Vec<(OutletId, Slot)> = self.slots.lock().drain().collect();
        let mut first_err = None;
        for (outlet_id, slot) in slots {
            let Some(handle) = slot.get() else {
                continue;
            };
            if let Err(err) = handle.shutdown().await {
                warn!(outlet_id = %outlet_id, error = %err, "outlet store shutdown failed");
                first_err.get_or_insert(SyncError::from(err));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn provision(&self, outlet_id: &str) -> SyncResult<OutletStoreHandle> {
        let factory = Arc::clone(&self.factory);
        let id = outlet_id.to_string();
        let provisioned = tokio::task::spawn_blocking(move || factory.provision(&id))
            .await
            .map_err(|e| e.to_string())
            .and_then(|res| res.map_err(|e| e.to_string()));

        match provisioned {
            Ok((store, sink)) => {
                info!(outlet_id, records = store.len(), durable = sink.is_some(), "outlet store provisioned");
                Ok(spawn_outlet_store(store, sink, self.runtime.clone()))
            }
            Err(reason) => {
                warn!(outlet_id, reason = %reason, "outlet store provisioning failed");
                Err(SyncError::StoreProvisioning {
                    outlet_id: outlet_id.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Ids that could never name a store are refused before they enter the
/// directory.
fn check_outlet_id(outlet_id: &str) -> SyncResult<()> {
    validate_outlet_id(outlet_id).map_err(|e| SyncError::StoreProvisioning {
        outlet_id: outlet_id.to_string(),
        reason: e.to_string(),
    })
}
