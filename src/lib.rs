//! Stock reservation and concurrency engine.
//!
//! Guarantees that no combination of concurrent checkout sessions can
//! reserve more units of a product than physically exist. Reservations are
//! session-scoped claims recorded in an append-only movement ledger; the
//! product row carries derived `stock_reserved` / `stock_available`
//! aggregates that are recomputed from the ledger inside the same
//! transaction as every ledger mutation.
//!
//! The engine is storage-agnostic: [`ReservationManager`] runs against any
//! [`store::StockStore`]. [`store::PgStockStore`] is the production Postgres
//! implementation, [`store::MemoryStore`] a deterministic in-memory one for
//! tests.

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod store;
pub mod tasks;

pub use config::EngineConfig;
pub use error::StockError;
pub use manager::ReservationManager;
pub use metrics::EngineMetrics;
pub use model::{
    AvailabilitySnapshot, BulkReleaseOutcome, Movement, MovementKind, Product, ProductKind,
    ReleaseOutcome, ReleaseRequest, RenewOutcome, ReservationOutcome, ReserveRequest, SweepOutcome,
};
pub use store::{MemoryStore, PgStockStore, StockStore, StockTx};

/// Fallback low-stock threshold for products created without one.
pub const DEFAULT_MIN_STOCK: i64 = 5;
