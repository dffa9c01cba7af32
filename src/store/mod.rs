//! Storage seam of the engine.
//!
//! The manager never talks to a database client directly; it is injected
//! with a [`StockStore`] and performs every operation inside one
//! [`StockTx`]. Dropping a transaction without committing discards its
//! work, so no partial state is ever externally visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StockError;
use crate::model::{Movement, NewMovement, Product};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStockStore;

/// In-place update of an existing reservation row (merge and partial
/// release paths).
#[derive(Debug, Clone)]
pub struct ReservationPatch {
    pub quantity: i64,
    /// When set, refreshes the reservation timestamp (merge). Partial
    /// release leaves the original age untouched so the sweeper still sees
    /// the reservation's true start.
    pub touch: Option<DateTime<Utc>>,
    pub note: String,
    pub actor_id: Option<i64>,
    pub source_ip: Option<String>,
}

#[async_trait]
pub trait StockStore: Send + Sync {
    type Tx: StockTx;

    async fn begin(&self) -> Result<Self::Tx, StockError>;
}

#[async_trait]
pub trait StockTx: Send {
    /// Load the product row without locking it (read-only snapshots).
    async fn product(&mut self, product_id: i64) -> Result<Option<Product>, StockError>;

    /// Load the product row and take its row-level write lock for the rest
    /// of the transaction.
    async fn product_for_update(&mut self, product_id: i64) -> Result<Option<Product>, StockError>;

    /// Sum of active reservation quantities held by sessions other than
    /// `session_key`.
    async fn reserved_by_others(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<i64, StockError>;

    /// Sum of all active reservation quantities for the product.
    async fn reserved_total(&mut self, product_id: i64) -> Result<i64, StockError>;

    /// The session's own active reservation for the product, if any. At
    /// most one such row exists per `(product, session)`.
    async fn session_reservation(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<Option<Movement>, StockError>;

    /// Every active reservation the session holds, across all products.
    async fn session_reservations(&mut self, session_key: &str)
        -> Result<Vec<Movement>, StockError>;

    /// Most recent active reservations for a product, newest first.
    async fn recent_reservations(
        &mut self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<Movement>, StockError>;

    /// Active reservations recorded strictly before `cutoff`, locked for
    /// this transaction so a concurrent renewal cannot interleave.
    async fn reservations_older_than(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Movement>, StockError>;

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<i64, StockError>;

    async fn update_reservation(
        &mut self,
        movement_id: i64,
        patch: ReservationPatch,
    ) -> Result<(), StockError>;

    async fn delete_movements(&mut self, movement_ids: &[i64]) -> Result<u64, StockError>;

    /// Heartbeat: refresh `recorded_at` and the audit note on all of the
    /// session's active reservations. Returns how many rows were touched.
    async fn touch_session_reservations(
        &mut self,
        session_key: &str,
        recorded_at: DateTime<Utc>,
        note: &str,
    ) -> Result<u64, StockError>;

    /// Persist the derived aggregates onto the product row.
    async fn store_aggregates(
        &mut self,
        product_id: i64,
        stock_reserved: i64,
        stock_available: i64,
    ) -> Result<(), StockError>;

    async fn commit(self) -> Result<(), StockError>;
}
