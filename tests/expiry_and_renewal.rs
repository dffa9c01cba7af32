//! Expiration sweeper and heartbeat renewal behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stock_engine::model::{MovementKind, Product, ReserveRequest};
use stock_engine::{EngineConfig, MemoryStore, ReservationManager};

fn engine() -> (MemoryStore, ReservationManager<MemoryStore>) {
    let store = MemoryStore::new();
    let manager = ReservationManager::new(store.clone(), EngineConfig::default());
    (store, manager)
}

fn reserve_req(product_id: i64, quantity: i64, session: &str) -> ReserveRequest {
    ReserveRequest {
        product_id,
        quantity,
        session_key: session.to_string(),
        actor_id: Some(1),
        source_ip: Some("127.0.0.1".to_string()),
    }
}

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn sweep_releases_backdated_reservations() {
    let (store, manager) = engine();
    store.seed_product(Product::physical(1, "timing chain", 20)).await;

    manager.reserve(reserve_req(1, 5, "S1")).await.unwrap();
    store.backdate_session("S1", 3 * HOUR).await;

    let outcome = manager.sweep_expired(2 * HOUR).await.unwrap();
    assert_eq!(outcome.reservations_released, 1);
    assert_eq!(outcome.products_affected, 1);
    assert_eq!(outcome.entries[0].quantity_released, 5);

    assert!(store.active_reservations(1).await.is_empty());
    let snapshot = manager.availability(1, None).await.unwrap();
    assert_eq!(snapshot.levels.stock_available, 20);

    // The sweep wrote one aggregated, system-attributed release movement.
    let releases: Vec<_> = store
        .movements()
        .await
        .into_iter()
        .filter(|m| m.kind == MovementKind::Release)
        .collect();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].quantity, 5);
    assert!(releases[0].session_key.is_none());
    assert!(releases[0].actor_id.is_none());
}

#[tokio::test]
async fn sweep_is_noop_without_expired_reservations() {
    let (store, manager) = engine();
    store.seed_product(Product::physical(1, "gasket", 20)).await;
    manager.reserve(reserve_req(1, 5, "S1")).await.unwrap();

    let writes_before = store.ledger_writes().await;
    let outcome = manager.sweep_expired(2 * HOUR).await.unwrap();
    assert_eq!(outcome.reservations_released, 0);
    assert_eq!(store.ledger_writes().await, writes_before);
    assert_eq!(store.active_reservations(1).await.len(), 1);

    // Re-running is equally safe.
    let again = manager.sweep_expired(2 * HOUR).await.unwrap();
    assert_eq!(again.reservations_released, 0);
}

#[tokio::test]
async fn renewed_reservations_survive_the_sweep() {
    let (store, manager) = engine();
    store.seed_product(Product::physical(1, "injector", 20)).await;

    manager.reserve(reserve_req(1, 4, "S1")).await.unwrap();
    manager.reserve(reserve_req(1, 6, "S2")).await.unwrap();
    store.backdate_session("S1", 3 * HOUR).await;
    store.backdate_session("S2", 3 * HOUR).await;

    // S1's checkout is still alive and heartbeats.
    let renewed = manager.renew("S1", Some(1)).await.unwrap();
    assert!(renewed.renewed);
    assert_eq!(renewed.reservations_renewed, 1);

    let outcome = manager.sweep_expired(2 * HOUR).await.unwrap();
    assert_eq!(outcome.reservations_released, 1, "only S2 expired");

    let active = store.active_reservations(1).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_key.as_deref(), Some("S1"));
    assert_eq!(active[0].quantity, 4);

    let product = store.product(1).await.unwrap();
    assert_eq!(product.stock_reserved, 4);
    assert_eq!(product.stock_available, 16);
}

#[tokio::test]
async fn renew_without_reservations_reports_nothing_to_renew() {
    let (store, manager) = engine();
    store.seed_product(Product::physical(1, "thermostat", 20)).await;

    let outcome = manager.renew("ghost-session", Some(1)).await.unwrap();
    assert!(!outcome.renewed);
    assert_eq!(outcome.reservations_renewed, 0);
    assert_eq!(store.ledger_writes().await, 0);
}

#[tokio::test]
async fn sweep_groups_multiple_products_per_session() {
    let (store, manager) = engine();
    store.seed_product(Product::physical(1, "hose", 10)).await;
    store.seed_product(Product::physical(2, "clamp", 10)).await;

    manager.reserve(reserve_req(1, 2, "S1")).await.unwrap();
    manager.reserve(reserve_req(2, 3, "S1")).await.unwrap();
    manager.reserve(reserve_req(2, 4, "S2")).await.unwrap();
    store.backdate_session("S1", 3 * HOUR).await;
    store.backdate_session("S2", 3 * HOUR).await;

    let outcome = manager.sweep_expired(2 * HOUR).await.unwrap();
    assert_eq!(outcome.reservations_released, 3);
    assert_eq!(outcome.products_affected, 2);

    // Product 2 had two expired reservations but gets one aggregated release.
    let product2_releases: Vec<_> = store
        .movements()
        .await
        .into_iter()
        .filter(|m| m.kind == MovementKind::Release && m.product_id == 2)
        .collect();
    assert_eq!(product2_releases.len(), 1);
    assert_eq!(product2_releases[0].quantity, 7);

    assert_eq!(store.product(1).await.unwrap().stock_available, 10);
    assert_eq!(store.product(2).await.unwrap().stock_available, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_sweeper_releases_expired_reservations() {
    let store = MemoryStore::new();
    store.seed_product(Product::physical(1, "axle", 20)).await;
    let manager = Arc::new(ReservationManager::new(
        store.clone(),
        EngineConfig::default(),
    ));

    manager.reserve(reserve_req(1, 5, "S1")).await.unwrap();
    store.backdate_session("S1", 3 * HOUR).await;

    let handle = stock_engine::tasks::spawn_sweeper(
        manager.clone(),
        Duration::from_millis(25),
        2 * HOUR,
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if store.active_reservations(1).await.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "sweeper did not run in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.abort();

    assert_eq!(store.product(1).await.unwrap().stock_available, 20);
}
