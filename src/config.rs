use std::{env, time::Duration};

/// Engine tuning knobs. `Default` matches the production values; `from_env`
/// lets a deployment override individual settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts per write operation, counting the first one.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_jitter: Duration,
    /// Hard budget for a single transaction attempt; exceeding it aborts
    /// the attempt and counts as a retryable conflict.
    pub tx_timeout: Duration,
    /// Cadence of the background expiration sweeper.
    pub sweep_interval: Duration,
    /// Age past which an unrenewed reservation is force-released.
    pub reservation_max_age: Duration,
    /// How many recent active reservations an availability snapshot lists.
    pub recent_reservations_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_jitter: Duration::from_millis(50),
            tx_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(3600),
            reservation_max_age: Duration::from_secs(2 * 3600),
            recent_reservations_limit: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_u64("STOCK_MAX_RETRIES") {
            cfg.max_retries = n as u32;
        }
        if let Some(ms) = env_u64("STOCK_RETRY_BASE_DELAY_MS") {
            cfg.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("STOCK_TX_TIMEOUT_SECS") {
            cfg.tx_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STOCK_SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STOCK_RESERVATION_MAX_AGE_SECS") {
            cfg.reservation_max_age = Duration::from_secs(secs);
        }
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}
