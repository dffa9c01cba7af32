use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

/// Engine counters and the sweep duration histogram, registered on an owned
/// registry that the embedding service can gather and export.
#[derive(Clone)]
pub struct EngineMetrics {
    pub registry: Registry,
    pub reservations_total: IntCounter,
    pub releases_total: IntCounter,
    pub insufficient_stock_total: IntCounter,
    pub conflict_retries_total: IntCounter,
    pub reservations_expired_total: IntCounter,
    pub sweeper_duration_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let reservations_total = IntCounter::new(
            "stock_reservations_total",
            "Successful stock reservations (creations and merges)",
        )
        .unwrap();
        let releases_total = IntCounter::new(
            "stock_releases_total",
            "Reservation releases, including bulk releases per product",
        )
        .unwrap();
        let insufficient_stock_total = IntCounter::new(
            "stock_insufficient_total",
            "Reservation attempts rejected for insufficient stock",
        )
        .unwrap();
        let conflict_retries_total = IntCounter::new(
            "stock_conflict_retries_total",
            "Transaction conflicts absorbed by the retry decorator",
        )
        .unwrap();
        let reservations_expired_total = IntCounter::new(
            "stock_reservations_expired_total",
            "Reservations force-released by the expiration sweeper",
        )
        .unwrap();
        let sweeper_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "stock_sweeper_duration_seconds",
                "Duration of a reservation expiration sweep",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        )
        .unwrap();
        let _ = registry.register(Box::new(reservations_total.clone()));
        let _ = registry.register(Box::new(releases_total.clone()));
        let _ = registry.register(Box::new(insufficient_stock_total.clone()));
        let _ = registry.register(Box::new(conflict_retries_total.clone()));
        let _ = registry.register(Box::new(reservations_expired_total.clone()));
        let _ = registry.register(Box::new(sweeper_duration_seconds.clone()));
        EngineMetrics {
            registry,
            reservations_total,
            releases_total,
            insufficient_stock_total,
            conflict_retries_total,
            reservations_expired_total,
            sweeper_duration_seconds,
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
