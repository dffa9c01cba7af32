use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ReservationPatch, StockStore, StockTx};
use crate::error::StockError;
use crate::model::{Movement, NewMovement, Product};

#[derive(Debug, Clone)]
struct MemoryState {
    products: HashMap<i64, Product>,
    movements: Vec<Movement>,
    next_movement_id: i64,
    ledger_writes: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        MemoryState {
            products: HashMap::new(),
            movements: Vec::new(),
            next_movement_id: 1,
            ledger_writes: 0,
        }
    }
}

/// Deterministic in-memory transactional store.
///
/// `begin` takes a single owned lock, so transactions serialize exactly
/// like row-locked Postgres transactions on a contended product. The
/// transaction mutates a working copy of the state; `commit` publishes it,
/// dropping without commit discards it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    conflicts_to_inject: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn product(&self, product_id: i64) -> Option<Product> {
        self.state.lock().await.products.get(&product_id).cloned()
    }

    pub async fn movements(&self) -> Vec<Movement> {
        self.state.lock().await.movements.clone()
    }

    pub async fn active_reservations(&self, product_id: i64) -> Vec<Movement> {
        self.state
            .lock()
            .await
            .movements
            .iter()
            .filter(|m| m.is_active_reservation() && m.product_id == product_id)
            .cloned()
            .collect()
    }

    /// Total ledger writes (inserts, updates, deletes) performed so far.
    pub async fn ledger_writes(&self) -> u64 {
        self.state.lock().await.ledger_writes
    }

    /// Shift every active reservation of the session into the past, for
    /// expiry tests.
    pub async fn backdate_session(&self, session_key: &str, by: std::time::Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock().await;
        for movement in state.movements.iter_mut() {
            if movement.is_active_reservation()
                && movement.session_key.as_deref() == Some(session_key)
            {
                movement.recorded_at -= by;
            }
        }
    }

    /// Make the next `n` transactions fail at `begin` with a serialization
    /// conflict, to exercise the retry decorator end to end.
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts_to_inject.fetch_add(n, Ordering::SeqCst);
    }
}

fn take_injected(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StockStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StockError> {
        let guard = self.state.clone().lock_owned().await;
        if take_injected(&self.conflicts_to_inject) {
            return Err(StockError::TransactionConflict(
                "injected serialization failure".into(),
            ));
        }
        let work = guard.clone();
        Ok(MemoryTx { guard, work })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

#[async_trait]
impl StockTx for MemoryTx {
    async fn product(&mut self, product_id: i64) -> Result<Option<Product>, StockError> {
        Ok(self.work.products.get(&product_id).cloned())
    }

    async fn product_for_update(&mut self, product_id: i64) -> Result<Option<Product>, StockError> {
        // The store-wide lock held since `begin` already excludes writers.
        Ok(self.work.products.get(&product_id).cloned())
    }

    async fn reserved_by_others(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<i64, StockError> {
        Ok(self
            .work
            .movements
            .iter()
            .filter(|m| {
                m.is_active_reservation()
                    && m.product_id == product_id
                    && m.session_key.as_deref() != Some(session_key)
            })
            .map(|m| m.quantity)
            .sum())
    }

    async fn reserved_total(&mut self, product_id: i64) -> Result<i64, StockError> {
        Ok(self
            .work
            .movements
            .iter()
            .filter(|m| m.is_active_reservation() && m.product_id == product_id)
            .map(|m| m.quantity)
            .sum())
    }

    async fn session_reservation(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<Option<Movement>, StockError> {
        Ok(self
            .work
            .movements
            .iter()
            .find(|m| {
                m.is_active_reservation()
                    && m.product_id == product_id
                    && m.session_key.as_deref() == Some(session_key)
            })
            .cloned())
    }

    async fn session_reservations(
        &mut self,
        session_key: &str,
    ) -> Result<Vec<Movement>, StockError> {
        let mut found: Vec<Movement> = self
            .work
            .movements
            .iter()
            .filter(|m| {
                m.is_active_reservation() && m.session_key.as_deref() == Some(session_key)
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.product_id, m.id));
        Ok(found)
    }

    async fn recent_reservations(
        &mut self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<Movement>, StockError> {
        let mut found: Vec<Movement> = self
            .work
            .movements
            .iter()
            .filter(|m| m.is_active_reservation() && m.product_id == product_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn reservations_older_than(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Movement>, StockError> {
        let mut found: Vec<Movement> = self
            .work
            .movements
            .iter()
            .filter(|m| m.is_active_reservation() && m.recorded_at < cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.product_id, m.id));
        Ok(found)
    }

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<i64, StockError> {
        let id = self.work.next_movement_id;
        self.work.next_movement_id += 1;
        self.work.movements.push(Movement {
            id,
            product_id: movement.product_id,
            kind: movement.kind,
            quantity: movement.quantity,
            stock_before: movement.stock_before,
            stock_after: movement.stock_after,
            session_key: movement.session_key,
            sale_ref: None,
            actor_id: movement.actor_id,
            source_ip: movement.source_ip,
            note: movement.note,
            recorded_at: movement.recorded_at,
        });
        self.work.ledger_writes += 1;
        Ok(id)
    }

    async fn update_reservation(
        &mut self,
        movement_id: i64,
        patch: ReservationPatch,
    ) -> Result<(), StockError> {
        let movement = self
            .work
            .movements
            .iter_mut()
            .find(|m| m.id == movement_id)
            .ok_or(StockError::Storage(sqlx::Error::RowNotFound))?;
        movement.quantity = patch.quantity;
        if let Some(at) = patch.touch {
            movement.recorded_at = at;
        }
        movement.note = Some(patch.note);
        movement.actor_id = patch.actor_id;
        movement.source_ip = patch.source_ip;
        self.work.ledger_writes += 1;
        Ok(())
    }

    async fn delete_movements(&mut self, movement_ids: &[i64]) -> Result<u64, StockError> {
        let before = self.work.movements.len();
        self.work.movements.retain(|m| !movement_ids.contains(&m.id));
        let removed = (before - self.work.movements.len()) as u64;
        self.work.ledger_writes += removed;
        Ok(removed)
    }

    async fn touch_session_reservations(
        &mut self,
        session_key: &str,
        recorded_at: DateTime<Utc>,
        note: &str,
    ) -> Result<u64, StockError> {
        let mut touched = 0;
        for movement in self.work.movements.iter_mut() {
            if movement.is_active_reservation()
                && movement.session_key.as_deref() == Some(session_key)
            {
                movement.recorded_at = recorded_at;
                movement.note = Some(note.to_string());
                touched += 1;
            }
        }
        self.work.ledger_writes += touched;
        Ok(touched)
    }

    async fn store_aggregates(
        &mut self,
        product_id: i64,
        stock_reserved: i64,
        stock_available: i64,
    ) -> Result<(), StockError> {
        let product = self
            .work
            .products
            .get_mut(&product_id)
            .ok_or(StockError::ProductNotFound(product_id))?;
        product.stock_reserved = stock_reserved;
        product.stock_available = stock_available;
        Ok(())
    }

    async fn commit(self) -> Result<(), StockError> {
        let MemoryTx { mut guard, work } = self;
        *guard = work;
        Ok(())
    }
}
