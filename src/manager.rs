//! The Reservation Manager: computes availability and creates, merges,
//! releases, renews and expires reservations, each operation inside a
//! single storage transaction so the ledger write and the aggregate
//! recomputation commit together.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::StockError;
use crate::metrics::EngineMetrics;
use crate::model::{
    AvailabilitySnapshot, BulkReleaseEntry, BulkReleaseOutcome, Movement, MovementKind,
    NewMovement, Product, ProductKind, ReleaseOutcome, ReleaseRequest, RenewOutcome,
    ReservationOutcome, ReservationView, ReserveRequest, StockLevels, SweepEntry, SweepOutcome,
    SERVICE_STOCK,
};
use crate::retry::RetryPolicy;
use crate::store::{ReservationPatch, StockStore, StockTx};

pub struct ReservationManager<S: StockStore> {
    store: S,
    config: EngineConfig,
    retry: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl<S: StockStore> ReservationManager<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_retries,
            base_delay: config.retry_base_delay,
            max_jitter: config.retry_max_jitter,
        };
        ReservationManager {
            store,
            retry,
            metrics: Arc::new(EngineMetrics::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Reserve `quantity` units of a product for a checkout session.
    ///
    /// Repeated calls for the same `(product, session)` merge into the one
    /// existing reservation: the quantity is replaced, not stacked. The
    /// whole attempt runs in one transaction under the retry decorator.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<ReservationOutcome, StockError> {
        if req.quantity <= 0 {
            return Err(StockError::InvalidQuantity(req.quantity));
        }
        let result = self.transact(|| self.reserve_once(&req)).await;
        match &result {
            Ok(outcome) if !outcome.service => self.metrics.reservations_total.inc(),
            Ok(_) => {}
            Err(StockError::InsufficientStock { .. }) => {
                self.metrics.insufficient_stock_total.inc()
            }
            Err(_) => {}
        }
        result
    }

    /// Release a session's reservation on a product, entirely or in part.
    /// Idempotent: releasing when nothing is held is a successful no-op.
    pub async fn release(&self, req: ReleaseRequest) -> Result<ReleaseOutcome, StockError> {
        if let Some(quantity) = req.quantity {
            if quantity <= 0 {
                return Err(StockError::InvalidQuantity(quantity));
            }
        }
        let result = self.transact(|| self.release_once(&req)).await;
        if let Ok(outcome) = &result {
            if outcome.released_quantity > 0 {
                self.metrics.releases_total.inc();
            }
        }
        result
    }

    /// Release every reservation the session holds, across all products,
    /// writing one aggregated release movement per product.
    pub async fn release_all_for_session(
        &self,
        session_key: &str,
        actor_id: Option<i64>,
        source_ip: Option<String>,
    ) -> Result<BulkReleaseOutcome, StockError> {
        let result = self
            .transact(|| self.release_all_once(session_key, actor_id, source_ip.as_deref()))
            .await;
        if let Ok(outcome) = &result {
            self.metrics
                .releases_total
                .inc_by(outcome.products_affected as u64);
        }
        result
    }

    /// Consistent read-only snapshot of a product's availability.
    ///
    /// When `session_key` is given, that session's own holdings are
    /// excluded from the reported reserved figure, so a checkout UI sees
    /// what it could still claim. A snapshot is never a reservation
    /// guarantee; only `reserve` is authoritative.
    pub async fn availability(
        &self,
        product_id: i64,
        session_key: Option<&str>,
    ) -> Result<AvailabilitySnapshot, StockError> {
        let mut tx = self.store.begin().await?;
        let product = tx
            .product(product_id)
            .await?
            .filter(|p| p.active)
            .ok_or(StockError::ProductNotFound(product_id))?;

        if product.kind == ProductKind::Service {
            return Ok(AvailabilitySnapshot {
                product_id: product.id,
                name: product.name,
                kind: product.kind,
                levels: StockLevels {
                    stock_total: SERVICE_STOCK,
                    stock_reserved: 0,
                    stock_available: SERVICE_STOCK,
                },
                min_stock: product.min_stock,
                service: true,
                requires_stock_validation: false,
                low_stock: false,
                out_of_stock: false,
                active_reservations: Vec::new(),
                taken_at: Utc::now(),
            });
        }

        let reserved_by_others = match session_key {
            Some(key) => tx.reserved_by_others(product.id, key).await?,
            None => tx.reserved_total(product.id).await?,
        };
        let available = (product.stock - reserved_by_others).max(0);
        let recent = tx
            .recent_reservations(product.id, self.config.recent_reservations_limit)
            .await?;
        // Read-only: dropping the transaction discards it.

        let active_reservations = recent
            .iter()
            .map(|m| ReservationView {
                id: m.id,
                quantity: m.quantity,
                recorded_at: m.recorded_at,
                is_own: session_key.is_some() && m.session_key.as_deref() == session_key,
            })
            .collect();

        Ok(AvailabilitySnapshot {
            product_id: product.id,
            name: product.name.clone(),
            kind: product.kind,
            levels: StockLevels {
                stock_total: product.stock,
                stock_reserved: reserved_by_others,
                stock_available: available,
            },
            min_stock: product.min_stock,
            service: false,
            requires_stock_validation: true,
            low_stock: available <= product.min_stock,
            out_of_stock: available == 0,
            active_reservations,
            taken_at: Utc::now(),
        })
    }

    /// Heartbeat: refresh the age of every active reservation the session
    /// holds, without touching quantities, so a long checkout stays ahead
    /// of the expiration sweeper.
    pub async fn renew(
        &self,
        session_key: &str,
        actor_id: Option<i64>,
    ) -> Result<RenewOutcome, StockError> {
        let mut tx = self.store.begin().await?;
        let now = Utc::now();
        let note = format!("reservation renewed by heartbeat at {}", now.to_rfc3339());
        let touched = tx.touch_session_reservations(session_key, now, &note).await?;
        if touched == 0 {
            debug!(session_key = %session_key, "nothing to renew for session");
            return Ok(RenewOutcome {
                renewed: false,
                reservations_renewed: 0,
                renewed_at: now,
            });
        }
        tx.commit().await?;
        info!(
            session_key = %session_key,
            actor_id = ?actor_id,
            count = touched,
            "session reservations renewed"
        );
        Ok(RenewOutcome {
            renewed: true,
            reservations_renewed: touched as usize,
            renewed_at: now,
        })
    }

    /// Force-release every active reservation older than `max_age`,
    /// attributing the release movements to the system. Idempotent and safe
    /// to re-run concurrently with live traffic: the expired set is
    /// selected and locked inside the same transaction that deletes it, so
    /// a reservation renewed after the cutoff is never swept.
    pub async fn sweep_expired(&self, max_age: Duration) -> Result<SweepOutcome, StockError> {
        let outcome = self.transact(|| self.sweep_once(max_age)).await?;
        if outcome.reservations_released > 0 {
            self.metrics
                .reservations_expired_total
                .inc_by(outcome.reservations_released as u64);
            info!(
                released = outcome.reservations_released,
                products = outcome.products_affected,
                "expired reservations released"
            );
        }
        Ok(outcome)
    }

    /// Run one attempt of `op` per transaction, under the attempt timeout
    /// and the retry decorator. A timed-out attempt counts as a retryable
    /// conflict.
    async fn transact<T, F, Fut>(&self, mut op: F) -> Result<T, StockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StockError>>,
    {
        let budget = self.config.tx_timeout;
        let metrics = self.metrics.clone();
        self.retry
            .run_with(
                || {
                    let attempt = op();
                    async move {
                        match tokio::time::timeout(budget, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(StockError::TransactionConflict(format!(
                                "transaction exceeded its {}ms budget",
                                budget.as_millis()
                            ))),
                        }
                    }
                },
                move |_| metrics.conflict_retries_total.inc(),
            )
            .await
    }

    async fn reserve_once(&self, req: &ReserveRequest) -> Result<ReservationOutcome, StockError> {
        let mut tx = self.store.begin().await?;
        let product = tx
            .product_for_update(req.product_id)
            .await?
            .filter(|p| p.active)
            .ok_or(StockError::ProductNotFound(req.product_id))?;

        // Services are exempt from reservation logic entirely.
        if product.kind == ProductKind::Service {
            debug!(product_id = product.id, session_key = %req.session_key, "service product, no reservation written");
            return Ok(ReservationOutcome {
                reserved: true,
                service: true,
                levels: StockLevels {
                    stock_total: SERVICE_STOCK,
                    stock_reserved: 0,
                    stock_available: SERVICE_STOCK,
                },
                reserved_quantity: req.quantity,
                session_key: req.session_key.clone(),
                movement_id: None,
            });
        }

        let reserved_by_others = tx.reserved_by_others(product.id, &req.session_key).await?;
        let available = (product.stock - reserved_by_others).max(0);

        let existing = tx.session_reservation(product.id, &req.session_key).await?;
        let already_held = existing.as_ref().map(|m| m.quantity).unwrap_or(0);
        let additional_needed = (req.quantity - already_held).max(0);

        if additional_needed > available {
            return Err(StockError::InsufficientStock {
                requested: req.quantity,
                available,
                already_held,
            });
        }
        // Re-validate the global cap directly: the delta check above can be
        // satisfied while the projected total still exceeds physical stock.
        if reserved_by_others + req.quantity > product.stock {
            return Err(StockError::InsufficientStock {
                requested: req.quantity,
                available,
                already_held,
            });
        }

        let now = Utc::now();
        let movement_id = match existing {
            Some(reservation) => {
                debug!(
                    movement_id = reservation.id,
                    previous = reservation.quantity,
                    new = req.quantity,
                    "merging into existing reservation"
                );
                tx.update_reservation(
                    reservation.id,
                    ReservationPatch {
                        quantity: req.quantity,
                        touch: Some(now),
                        note: format!("reservation updated for session {}", req.session_key),
                        actor_id: req.actor_id,
                        source_ip: req.source_ip.clone(),
                    },
                )
                .await?;
                reservation.id
            }
            None => {
                tx.insert_movement(NewMovement {
                    product_id: product.id,
                    kind: MovementKind::Reservation,
                    quantity: req.quantity,
                    stock_before: product.stock,
                    stock_after: product.stock,
                    session_key: Some(req.session_key.clone()),
                    actor_id: req.actor_id,
                    source_ip: req.source_ip.clone(),
                    note: Some(format!(
                        "temporary checkout reservation for session {}",
                        req.session_key
                    )),
                    recorded_at: now,
                })
                .await?
            }
        };

        let levels = refresh_aggregates(&mut tx, &product).await?;
        tx.commit().await?;

        info!(
            product_id = product.id,
            session_key = %req.session_key,
            quantity = req.quantity,
            available = levels.stock_available,
            "stock reserved"
        );

        Ok(ReservationOutcome {
            reserved: true,
            service: false,
            levels,
            reserved_quantity: req.quantity,
            session_key: req.session_key.clone(),
            movement_id: Some(movement_id),
        })
    }

    async fn release_once(&self, req: &ReleaseRequest) -> Result<ReleaseOutcome, StockError> {
        let mut tx = self.store.begin().await?;
        let product = tx
            .product_for_update(req.product_id)
            .await?
            .ok_or(StockError::ProductNotFound(req.product_id))?;

        let Some(reservation) = tx.session_reservation(product.id, &req.session_key).await? else {
            debug!(
                product_id = product.id,
                session_key = %req.session_key,
                "no active reservation to release"
            );
            return Ok(ReleaseOutcome {
                released: true,
                released_quantity: 0,
                partial: false,
                levels: None,
                session_key: req.session_key.clone(),
            });
        };

        // A request above the held amount releases everything held.
        let to_release = req
            .quantity
            .unwrap_or(reservation.quantity)
            .min(reservation.quantity);
        let partial = to_release < reservation.quantity;
        let now = Utc::now();

        tx.insert_movement(NewMovement {
            product_id: product.id,
            kind: MovementKind::Release,
            quantity: to_release,
            stock_before: reservation.stock_before,
            stock_after: reservation.stock_before,
            session_key: Some(req.session_key.clone()),
            actor_id: req.actor_id,
            source_ip: req.source_ip.clone(),
            note: Some(if partial {
                format!("partial release for session {}", req.session_key)
            } else {
                format!("release for session {}", req.session_key)
            }),
            recorded_at: now,
        })
        .await?;

        if partial {
            tx.update_reservation(
                reservation.id,
                ReservationPatch {
                    quantity: reservation.quantity - to_release,
                    touch: None,
                    note: format!(
                        "{} - partial release of {} units",
                        reservation.note.clone().unwrap_or_default(),
                        to_release
                    ),
                    actor_id: reservation.actor_id,
                    source_ip: reservation.source_ip.clone(),
                },
            )
            .await?;
        } else {
            tx.delete_movements(&[reservation.id]).await?;
        }

        let levels = refresh_aggregates(&mut tx, &product).await?;
        tx.commit().await?;

        info!(
            product_id = product.id,
            session_key = %req.session_key,
            released = to_release,
            partial,
            "stock released"
        );

        Ok(ReleaseOutcome {
            released: true,
            released_quantity: to_release,
            partial,
            levels: Some(levels),
            session_key: req.session_key.clone(),
        })
    }

    async fn release_all_once(
        &self,
        session_key: &str,
        actor_id: Option<i64>,
        source_ip: Option<&str>,
    ) -> Result<BulkReleaseOutcome, StockError> {
        let mut tx = self.store.begin().await?;
        let reservations = tx.session_reservations(session_key).await?;
        if reservations.is_empty() {
            debug!(session_key = %session_key, "session holds no reservations");
            return Ok(BulkReleaseOutcome {
                released: true,
                products_affected: 0,
                entries: Vec::new(),
                session_key: session_key.to_string(),
            });
        }

        let mut by_product: BTreeMap<i64, Vec<&Movement>> = BTreeMap::new();
        for reservation in &reservations {
            by_product
                .entry(reservation.product_id)
                .or_default()
                .push(reservation);
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(by_product.len());
        for (product_id, group) in by_product {
            let product = tx
                .product_for_update(product_id)
                .await?
                .ok_or(StockError::ProductNotFound(product_id))?;
            let total: i64 = group.iter().map(|m| m.quantity).sum();
            tx.insert_movement(NewMovement {
                product_id,
                kind: MovementKind::Release,
                quantity: total,
                stock_before: product.stock,
                stock_after: product.stock,
                session_key: Some(session_key.to_string()),
                actor_id,
                source_ip: source_ip.map(|ip| ip.to_string()),
                note: Some(format!(
                    "bulk release for session {session_key} ({} reservations)",
                    group.len()
                )),
                recorded_at: now,
            })
            .await?;
            let ids: Vec<i64> = group.iter().map(|m| m.id).collect();
            tx.delete_movements(&ids).await?;
            let levels = refresh_aggregates(&mut tx, &product).await?;
            entries.push(BulkReleaseEntry {
                product_id,
                quantity_released: total,
                reservations_removed: group.len(),
                levels,
            });
        }
        tx.commit().await?;

        info!(
            session_key = %session_key,
            products = entries.len(),
            "all session reservations released"
        );

        Ok(BulkReleaseOutcome {
            released: true,
            products_affected: entries.len(),
            entries,
            session_key: session_key.to_string(),
        })
    }

    async fn sweep_once(&self, max_age: Duration) -> Result<SweepOutcome, StockError> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let cutoff = Utc::now() - max_age;

        let mut tx = self.store.begin().await?;
        let expired = tx.reservations_older_than(cutoff).await?;
        if expired.is_empty() {
            return Ok(SweepOutcome {
                reservations_released: 0,
                products_affected: 0,
                entries: Vec::new(),
            });
        }

        let mut by_product: BTreeMap<i64, Vec<&Movement>> = BTreeMap::new();
        for reservation in &expired {
            by_product
                .entry(reservation.product_id)
                .or_default()
                .push(reservation);
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(by_product.len());
        for (product_id, group) in by_product {
            let product = tx
                .product_for_update(product_id)
                .await?
                .ok_or(StockError::ProductNotFound(product_id))?;
            let total: i64 = group.iter().map(|m| m.quantity).sum();
            let ids: Vec<i64> = group.iter().map(|m| m.id).collect();
            tx.insert_movement(NewMovement {
                product_id,
                kind: MovementKind::Release,
                quantity: total,
                stock_before: product.stock,
                stock_after: product.stock,
                session_key: None,
                actor_id: None,
                source_ip: None,
                note: Some(format!(
                    "expired reservation cleanup ({} reservations, ids {:?})",
                    ids.len(),
                    ids
                )),
                recorded_at: now,
            })
            .await?;
            tx.delete_movements(&ids).await?;
            let levels = refresh_aggregates(&mut tx, &product).await?;
            debug!(
                product_id,
                released = total,
                available = levels.stock_available,
                "expired reservations removed for product"
            );
            entries.push(SweepEntry {
                product_id,
                quantity_released: total,
                reservations_removed: ids.len(),
            });
        }
        tx.commit().await?;

        Ok(SweepOutcome {
            reservations_released: expired.len(),
            products_affected: entries.len(),
            entries,
        })
    }
}

/// Recompute the derived aggregates from the ledger and persist them onto
/// the product row, inside the caller's transaction.
async fn refresh_aggregates<T: StockTx>(
    tx: &mut T,
    product: &Product,
) -> Result<StockLevels, StockError> {
    let reserved = tx.reserved_total(product.id).await?;
    let available = (product.stock - reserved).max(0);
    tx.store_aggregates(product.id, reserved, available).await?;
    Ok(StockLevels {
        stock_total: product.stock,
        stock_reserved: reserved,
        stock_available: available,
    })
}
