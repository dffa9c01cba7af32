use thiserror::Error;

/// Error taxonomy of the engine.
///
/// Business errors (`ProductNotFound`, `InvalidQuantity`,
/// `InsufficientStock`) are never retried and surface immediately with
/// structured detail. `TransactionConflict` covers serialization failures,
/// database-detected deadlocks and lock/transaction timeouts; the retry
/// decorator retries it transparently and only surfaces the last failure
/// after the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("product {0} not found or inactive")]
    ProductNotFound(i64),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("insufficient stock: requested {requested}, available {available} (session already holds {already_held})")]
    InsufficientStock {
        requested: i64,
        available: i64,
        already_held: i64,
    },

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("storage error")]
    Storage(#[source] sqlx::Error),
}

impl StockError {
    /// Single classification point used by the retry decorator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StockError::TransactionConflict(_))
    }

    /// Classify a driver error. Postgres SQLSTATEs 40001
    /// (serialization_failure), 40P01 (deadlock_detected) and 55P03
    /// (lock_not_available) become retryable conflicts; everything else is
    /// a fatal storage error.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                if matches!(code.as_ref(), "40001" | "40P01" | "55P03") {
                    return StockError::TransactionConflict(db.message().to_string());
                }
            }
        }
        if matches!(err, sqlx::Error::PoolTimedOut) {
            return StockError::TransactionConflict("timed out waiting for a pooled connection".into());
        }
        StockError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_retryable() {
        let err = StockError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_is_fatal() {
        let err = StockError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
        assert!(matches!(err, StockError::Storage(_)));
    }

    #[test]
    fn business_errors_are_not_retryable() {
        assert!(!StockError::ProductNotFound(7).is_retryable());
        assert!(!StockError::InsufficientStock {
            requested: 6,
            available: 4,
            already_held: 0
        }
        .is_retryable());
    }
}
