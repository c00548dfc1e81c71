//! Errors surfaced by the ledger engine and its storage backends.
//!
//! Business-rule violations arrive as [`StockError`] and are never retried
//! automatically. `Conflict` and `Storage` are infrastructure failures: the unit
//! of work guarantees nothing partial was committed, so retrying with the same
//! idempotency key is safe.

use thiserror::Error;

use stockpile_core::DomainError;
use stockpile_inventory::{LocationId, ProductId, StockError, StockMovement};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Bad input, rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown product {0}")]
    UnknownProduct(ProductId),

    #[error("unknown location {0}")]
    UnknownLocation(LocationId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The idempotency key was already committed. Callers should treat this as
    /// success and use `existing`.
    #[error("movement key '{key}' was already committed")]
    DuplicateMovement {
        key: String,
        existing: Box<StockMovement>,
    },

    #[error(transparent)]
    Stock(StockError),

    /// Concurrent edit, stale version or an idempotency key still in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a blind retry of the same request (same idempotency key) is safe
    /// and may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_) | LedgerError::Storage(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::DuplicateMovement { .. })
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::Unauthorized(msg) => LedgerError::Unauthorized(msg),
        }
    }
}

impl From<StockError> for LedgerError {
    fn from(value: StockError) -> Self {
        match value {
            StockError::Validation(msg) => LedgerError::Validation(msg),
            StockError::Domain(err) => err.into(),
            other => LedgerError::Stock(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockpile_inventory::AdjustmentId;

    #[test]
    fn stock_validation_flattens_to_validation() {
        let err: LedgerError = StockError::validation("qty must be positive").into();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn nested_domain_errors_keep_their_category() {
        let err: LedgerError = StockError::Domain(DomainError::conflict("stale")).into();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn business_rules_stay_typed() {
        let err: LedgerError = StockError::AlreadyConfirmed(AdjustmentId::generate()).into();
        assert!(matches!(
            err,
            LedgerError::Stock(StockError::AlreadyConfirmed(_))
        ));
    }
}
