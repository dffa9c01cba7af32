//! Concurrency properties: competing sessions can never oversell, and
//! transaction conflicts are absorbed by the retry decorator.

use std::sync::Arc;
use std::time::Duration;

use stock_engine::model::{Product, ReserveRequest};
use stock_engine::{EngineConfig, MemoryStore, ReservationManager, StockError};

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_max_jitter: Duration::ZERO,
        ..EngineConfig::default()
    }
}

fn reserve_req(product_id: i64, quantity: i64, session: &str) -> ReserveRequest {
    ReserveRequest {
        product_id,
        quantity,
        session_key: session.to_string(),
        actor_id: None,
        source_ip: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_oversell() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "compressor", 10)).await;
    let manager = Arc::new(ReservationManager::new(store.clone(), fast_config()));

    let a = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reserve(reserve_req(1, 6, "A")).await })
    };
    let b = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reserve(reserve_req(1, 6, "B")).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of two 6-unit claims on stock 10 may win");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(StockError::InsufficientStock { .. }))));

    let reserved: i64 = store
        .active_reservations(1)
        .await
        .iter()
        .map(|m| m.quantity)
        .sum();
    assert_eq!(reserved, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn contended_sessions_stay_under_physical_stock() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "starter motor", 10)).await;
    let manager = Arc::new(ReservationManager::new(store.clone(), fast_config()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.reserve(reserve_req(1, 3, &format!("S{i}"))).await
        }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) | Err(StockError::InsufficientStock { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let reserved: i64 = store
        .active_reservations(1)
        .await
        .iter()
        .map(|m| m.quantity)
        .sum();
    assert!(reserved <= 10, "total reserved {reserved} exceeds stock");

    let product = store.product(1).await.unwrap();
    assert_eq!(product.stock_reserved, reserved);
}

#[tokio::test]
async fn injected_conflicts_are_retried_transparently() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "shock absorber", 10)).await;
    let manager = ReservationManager::new(store.clone(), fast_config());

    // Two failed attempts, success on the third and final one.
    store.inject_conflicts(2);
    let outcome = manager.reserve(reserve_req(1, 2, "S1")).await.unwrap();
    assert!(outcome.reserved);
    assert_eq!(manager.metrics().conflict_retries_total.get(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_the_conflict() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "driveshaft", 10)).await;
    let manager = ReservationManager::new(store.clone(), fast_config());

    store.inject_conflicts(3);
    let err = manager.reserve(reserve_req(1, 2, "S1")).await.unwrap_err();
    assert!(matches!(err, StockError::TransactionConflict(_)));
    assert!(store.active_reservations(1).await.is_empty());

    // The store recovers once the conflicts stop.
    let outcome = manager.reserve(reserve_req(1, 2, "S1")).await.unwrap();
    assert!(outcome.reserved);
}

#[tokio::test]
async fn conflicts_during_release_are_also_retried() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "control arm", 10)).await;
    let manager = ReservationManager::new(store.clone(), fast_config());

    manager.reserve(reserve_req(1, 4, "S1")).await.unwrap();
    store.inject_conflicts(2);
    let outcome = manager
        .release(stock_engine::model::ReleaseRequest {
            product_id: 1,
            session_key: "S1".to_string(),
            quantity: None,
            actor_id: None,
            source_ip: None,
        })
        .await
        .unwrap();
    assert!(outcome.released);
    assert_eq!(outcome.released_quantity, 4);
    assert!(store.active_reservations(1).await.is_empty());
}
