use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{ReservationPatch, StockStore, StockTx};
use crate::error::StockError;
use crate::model::{Movement, MovementKind, NewMovement, Product, ProductKind};

/// Postgres-backed store.
///
/// Runs under the default Read Committed isolation; correctness comes from
/// `SELECT ... FOR UPDATE` on the product row combined with in-transaction
/// re-validation of the reservation invariants before commit. Conflict
/// SQLSTATEs are classified retryable by [`StockError::from_sqlx`].
#[derive(Clone)]
pub struct PgStockStore {
    pool: PgPool,
}

impl PgStockStore {
    pub fn new(pool: PgPool) -> Self {
        PgStockStore { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StockError> {
        let pool = PgPool::connect(url).await.map_err(StockError::from_sqlx)?;
        Ok(PgStockStore { pool })
    }

    pub async fn migrate(&self) -> Result<(), StockError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StockError::Storage(sqlx::Error::Migrate(Box::new(err))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    type Tx = PgStockTx;

    async fn begin(&self) -> Result<PgStockTx, StockError> {
        let tx = self.pool.begin().await.map_err(StockError::from_sqlx)?;
        Ok(PgStockTx { tx })
    }
}

pub struct PgStockTx {
    tx: Transaction<'static, Postgres>,
}

const MOVEMENT_COLUMNS: &str = "id, product_id, kind, quantity, stock_before, stock_after, session_key, sale_ref, actor_id, source_ip, note, recorded_at";

fn product_from_row(row: &PgRow) -> Result<Product, StockError> {
    let kind: String = row.get("kind");
    Ok(Product {
        id: row.get("id"),
        name: row.get("name"),
        kind: parse_product_kind(&kind)?,
        active: row.get("active"),
        stock: row.get("stock"),
        stock_reserved: row.get("stock_reserved"),
        stock_available: row.get("stock_available"),
        min_stock: row.get("min_stock"),
    })
}

fn movement_from_row(row: &PgRow) -> Result<Movement, StockError> {
    let kind: String = row.get("kind");
    Ok(Movement {
        id: row.get("id"),
        product_id: row.get("product_id"),
        kind: parse_movement_kind(&kind)?,
        quantity: row.get("quantity"),
        stock_before: row.get("stock_before"),
        stock_after: row.get("stock_after"),
        session_key: row.get("session_key"),
        sale_ref: row.get("sale_ref"),
        actor_id: row.get("actor_id"),
        source_ip: row.get("source_ip"),
        note: row.get("note"),
        recorded_at: row.get("recorded_at"),
    })
}

fn parse_product_kind(value: &str) -> Result<ProductKind, StockError> {
    ProductKind::parse(value).ok_or_else(|| {
        StockError::Storage(sqlx::Error::Decode(
            format!("unknown product kind {value:?}").into(),
        ))
    })
}

fn parse_movement_kind(value: &str) -> Result<MovementKind, StockError> {
    MovementKind::parse(value).ok_or_else(|| {
        StockError::Storage(sqlx::Error::Decode(
            format!("unknown movement kind {value:?}").into(),
        ))
    })
}

#[async_trait]
impl StockTx for PgStockTx {
    async fn product(&mut self, product_id: i64) -> Result<Option<Product>, StockError> {
        let row = sqlx::query(
            "SELECT id, name, kind, active, stock, stock_reserved, stock_available, min_stock FROM products WHERE id = $1",
        )
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        row.map(|r| product_from_row(&r)).transpose()
    }

    async fn product_for_update(&mut self, product_id: i64) -> Result<Option<Product>, StockError> {
        let row = sqlx::query(
            "SELECT id, name, kind, active, stock, stock_reserved, stock_available, min_stock FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        row.map(|r| product_from_row(&r)).transpose()
    }

    async fn reserved_by_others(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<i64, StockError> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM stock_movements WHERE product_id = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL AND session_key IS DISTINCT FROM $2",
        )
        .bind(product_id)
        .bind(session_key)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)
    }

    async fn reserved_total(&mut self, product_id: i64) -> Result<i64, StockError> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM stock_movements WHERE product_id = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL",
        )
        .bind(product_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)
    }

    async fn session_reservation(
        &mut self,
        product_id: i64,
        session_key: &str,
    ) -> Result<Option<Movement>, StockError> {
        let row = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE product_id = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL AND session_key = $2 LIMIT 1"
        ))
        .bind(product_id)
        .bind(session_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        row.map(|r| movement_from_row(&r)).transpose()
    }

    async fn session_reservations(
        &mut self,
        session_key: &str,
    ) -> Result<Vec<Movement>, StockError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE session_key = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL ORDER BY product_id, id"
        ))
        .bind(session_key)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn recent_reservations(
        &mut self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<Movement>, StockError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE product_id = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL ORDER BY recorded_at DESC, id DESC LIMIT $2"
        ))
        .bind(product_id)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn reservations_older_than(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Movement>, StockError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE kind = 'RESERVATION' AND sale_ref IS NULL AND recorded_at < $1 ORDER BY product_id, id FOR UPDATE"
        ))
        .bind(cutoff)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn insert_movement(&mut self, movement: NewMovement) -> Result<i64, StockError> {
        sqlx::query_scalar(
            "INSERT INTO stock_movements (product_id, kind, quantity, stock_before, stock_after, session_key, sale_ref, actor_id, source_ip, note, recorded_at) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9, $10) RETURNING id",
        )
        .bind(movement.product_id)
        .bind(movement.kind.as_str())
        .bind(movement.quantity)
        .bind(movement.stock_before)
        .bind(movement.stock_after)
        .bind(movement.session_key)
        .bind(movement.actor_id)
        .bind(movement.source_ip)
        .bind(movement.note)
        .bind(movement.recorded_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)
    }

    async fn update_reservation(
        &mut self,
        movement_id: i64,
        patch: ReservationPatch,
    ) -> Result<(), StockError> {
        sqlx::query(
            "UPDATE stock_movements SET quantity = $2, recorded_at = COALESCE($3, recorded_at), note = $4, actor_id = $5, source_ip = $6 WHERE id = $1",
        )
        .bind(movement_id)
        .bind(patch.quantity)
        .bind(patch.touch)
        .bind(patch.note)
        .bind(patch.actor_id)
        .bind(patch.source_ip)
        .execute(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        Ok(())
    }

    async fn delete_movements(&mut self, movement_ids: &[i64]) -> Result<u64, StockError> {
        let result = sqlx::query("DELETE FROM stock_movements WHERE id = ANY($1)")
            .bind(movement_ids.to_vec())
            .execute(&mut *self.tx)
            .await
            .map_err(StockError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn touch_session_reservations(
        &mut self,
        session_key: &str,
        recorded_at: DateTime<Utc>,
        note: &str,
    ) -> Result<u64, StockError> {
        let result = sqlx::query(
            "UPDATE stock_movements SET recorded_at = $2, note = $3 WHERE session_key = $1 AND kind = 'RESERVATION' AND sale_ref IS NULL",
        )
        .bind(session_key)
        .bind(recorded_at)
        .bind(note)
        .execute(&mut *self.tx)
        .await
        .map_err(StockError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn store_aggregates(
        &mut self,
        product_id: i64,
        stock_reserved: i64,
        stock_available: i64,
    ) -> Result<(), StockError> {
        sqlx::query("UPDATE products SET stock_reserved = $2, stock_available = $3 WHERE id = $1")
            .bind(product_id)
            .bind(stock_reserved)
            .bind(stock_available)
            .execute(&mut *self.tx)
            .await
            .map_err(StockError::from_sqlx)?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StockError> {
        self.tx.commit().await.map_err(StockError::from_sqlx)
    }
}
