//! Per-outlet sale stores with idempotent, retrying upload to a central store.
//!
//! Every outlet records sales into its own local store (an authoritative
//! in-memory structure journaled to SQLite). The engine finds pending
//! records, uploads them in timestamp-ordered batches, and moves each record
//! to `Synced`, back to `Pending` with backoff, or to `Failed` with the
//! center's reason.
//!
//! # Examples
//!
//! In-memory stores against an in-process center:
//! ```
//! use std::sync::Arc;
//!
//! use outletsync::{
//!     config::SyncConfig,
//!     engine::SyncEngine,
//!     persist::MemoryStoreFactory,
//!     sale::{LineItem, SaleDraft},
//!     sync::{central::InMemoryCentralStore, scheduler::PassOutcome},
//!     types::{LifecycleStatus, SyncStatus},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let central = Arc::new(InMemoryCentralStore::new());
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStoreFactory),
//!     central.clone(),
//! )
//! .expect("engine");
//!
//! let id = engine
//!     .record_sale("north", SaleDraft {
//!         ts_ms: 1,
//!         line_items: vec![LineItem { product_id: "tea".into(), quantity: 2, unit_price: 350 }],
//!         lifecycle: LifecycleStatus::Completed,
//!     })
//!     .await
//!     .expect("record");
//!
//! let outcome = engine.sync_now("north").await.expect("sync");
//! assert!(matches!(outcome, PassOutcome::Completed(_)));
//! let rec = engine.get_sale("north", &id).await.expect("get").expect("record");
//! assert_eq!(rec.sync_status, SyncStatus::Synced);
//! assert_eq!(central.len(), 1);
//! engine.shutdown().await.expect("shutdown");
//! # }
//! ```
//!
//! Durable stores, one SQLite file per outlet:
//! ```no_run
//! use std::sync::Arc;
//!
//! use outletsync::{
//!     config::SyncConfig,
//!     engine::SyncEngine,
//!     persist::sqlite::SqliteStoreFactory,
//!     sync::http::HttpCentralStore,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncConfig::from_path("outletsync.json").expect("config");
//! let central = HttpCentralStore::new(
//!     &config.central,
//!     std::time::Duration::from_millis(config.transfer_timeout_ms),
//! )
//! .expect("client");
//! let engine = SyncEngine::new(config, Arc::new(SqliteStoreFactory::new("data")), Arc::new(central))
//!     .expect("engine");
//! engine.start();
//! # }
//! ```

/// Engine configuration.
pub mod config;
/// Core in-memory sale store and index helpers.
pub mod core;
/// Engine facade.
pub mod engine;
/// Crate-level error taxonomy.
pub mod error;
/// Journal op model and persistence envelope.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Outlet directory and per-outlet store registry.
pub mod registry;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Sale records and sync-status transitions.
pub mod sale;
/// Upload to the central store.
pub mod sync;
/// Shared primitive types and enums.
pub mod types;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
