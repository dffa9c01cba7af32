//! Background expiration sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::manager::ReservationManager;
use crate::store::StockStore;

/// Spawn the periodic reservation expiration sweep. The task survives
/// individual sweep failures and observes each sweep's duration in the
/// manager's metrics.
pub fn spawn_sweeper<S>(
    manager: Arc<ReservationManager<S>>,
    sweep_interval: Duration,
    max_age: Duration,
) -> JoinHandle<()>
where
    S: StockStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the job
        // waits one full interval before its first sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let start = std::time::Instant::now();
            match manager.sweep_expired(max_age).await {
                Ok(outcome) if outcome.reservations_released > 0 => {
                    info!(
                        released = outcome.reservations_released,
                        products = outcome.products_affected,
                        "sweep released expired reservations"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "reservation sweep failed"),
            }
            manager
                .metrics()
                .sweeper_duration_seconds
                .observe(start.elapsed().as_secs_f64());
        }
    })
}
