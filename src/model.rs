use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_MIN_STOCK;

/// Stock figure reported for services, which are exempt from reservation
/// logic and treated as effectively unlimited.
pub const SERVICE_STOCK: i64 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    Product,
    Service,
}

impl ProductKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductKind::Product => "PRODUCT",
            ProductKind::Service => "SERVICE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PRODUCT" => Some(ProductKind::Product),
            "SERVICE" => Some(ProductKind::Service),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Reservation,
    Release,
    Inbound,
    Outbound,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Reservation => "RESERVATION",
            MovementKind::Release => "RELEASE",
            MovementKind::Inbound => "INBOUND",
            MovementKind::Outbound => "OUTBOUND",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RESERVATION" => Some(MovementKind::Reservation),
            "RELEASE" => Some(MovementKind::Release),
            "INBOUND" => Some(MovementKind::Inbound),
            "OUTBOUND" => Some(MovementKind::Outbound),
            _ => None,
        }
    }
}

/// Per-product record owned by the catalog subsystem. The engine reads
/// `stock` and writes only the derived `stock_reserved` /
/// `stock_available` aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub kind: ProductKind,
    pub active: bool,
    pub stock: i64,
    pub stock_reserved: i64,
    pub stock_available: i64,
    pub min_stock: i64,
}

impl Product {
    pub fn physical(id: i64, name: impl Into<String>, stock: i64) -> Self {
        Product {
            id,
            name: name.into(),
            kind: ProductKind::Product,
            active: true,
            stock,
            stock_reserved: 0,
            stock_available: stock,
            min_stock: DEFAULT_MIN_STOCK,
        }
    }

    pub fn service(id: i64, name: impl Into<String>) -> Self {
        Product {
            id,
            name: name.into(),
            kind: ProductKind::Service,
            active: true,
            stock: 0,
            stock_reserved: 0,
            stock_available: 0,
            min_stock: 0,
        }
    }
}

/// One row of the append-only movement ledger.
///
/// A movement with `kind == Reservation` and no `sale_ref` is an *active*
/// reservation. Once the calling layer finalizes the sale it links
/// `sale_ref`, which excludes the row from active-reservation sums.
#[derive(Debug, Clone, Serialize)]
pub struct Movement {
    pub id: i64,
    pub product_id: i64,
    pub kind: MovementKind,
    pub quantity: i64,
    pub stock_before: i64,
    pub stock_after: i64,
    pub session_key: Option<String>,
    pub sale_ref: Option<i64>,
    pub actor_id: Option<i64>,
    pub source_ip: Option<String>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Movement {
    pub fn is_active_reservation(&self) -> bool {
        self.kind == MovementKind::Reservation && self.sale_ref.is_none()
    }
}

/// Ledger insert payload. `sale_ref` is always NULL at creation time.
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub product_id: i64,
    pub kind: MovementKind,
    pub quantity: i64,
    pub stock_before: i64,
    pub stock_after: i64,
    pub session_key: Option<String>,
    pub actor_id: Option<i64>,
    pub source_ip: Option<String>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveRequest {
    pub product_id: i64,
    pub quantity: i64,
    pub session_key: String,
    pub actor_id: Option<i64>,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub product_id: i64,
    pub session_key: String,
    /// Partial release when less than the held quantity; full release when
    /// omitted or equal to it.
    pub quantity: Option<i64>,
    pub actor_id: Option<i64>,
    pub source_ip: Option<String>,
}

/// Denormalized stock counters returned by every mutating operation so the
/// caller can emit its stock-changed notification without a second read.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StockLevels {
    pub stock_total: i64,
    pub stock_reserved: i64,
    pub stock_available: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationOutcome {
    pub reserved: bool,
    pub service: bool,
    #[serde(flatten)]
    pub levels: StockLevels,
    pub reserved_quantity: i64,
    pub session_key: String,
    pub movement_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub released: bool,
    pub released_quantity: i64,
    pub partial: bool,
    /// `None` when the call was an idempotent no-op (nothing was held).
    pub levels: Option<StockLevels>,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReleaseEntry {
    pub product_id: i64,
    pub quantity_released: i64,
    pub reservations_removed: usize,
    #[serde(flatten)]
    pub levels: StockLevels,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReleaseOutcome {
    pub released: bool,
    pub products_affected: usize,
    pub entries: Vec<BulkReleaseEntry>,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationView {
    pub id: i64,
    pub quantity: i64,
    pub recorded_at: DateTime<Utc>,
    pub is_own: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilitySnapshot {
    pub product_id: i64,
    pub name: String,
    pub kind: ProductKind,
    #[serde(flatten)]
    pub levels: StockLevels,
    pub min_stock: i64,
    pub service: bool,
    pub requires_stock_validation: bool,
    pub low_stock: bool,
    pub out_of_stock: bool,
    pub active_reservations: Vec<ReservationView>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepEntry {
    pub product_id: i64,
    pub quantity_released: i64,
    pub reservations_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepOutcome {
    pub reservations_released: usize,
    pub products_affected: usize,
    pub entries: Vec<SweepEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewOutcome {
    pub renewed: bool,
    pub reservations_renewed: usize,
    pub renewed_at: DateTime<Utc>,
}
