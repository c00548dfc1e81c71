//! Business-rule violations raised by the inventory domain.

use thiserror::Error;

use stockpile_core::{DomainError, Quantity};

use crate::ids::{AdjustmentId, LocationId, OrderLineId, ProductId};

pub type StockResult<T> = Result<T, StockError>;

/// Inventory rule violations. None of these are retried automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Bad input (non-positive quantity, inconsistent kind/direction, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An outbound movement would take on-hand below what is already reserved.
    #[error(
        "insufficient stock for product {product_id} at {location_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        location_id: LocationId,
        requested: Quantity,
        available: Quantity,
    },

    /// A reservation exceeds on-hand minus reserved.
    #[error(
        "insufficient available quantity for product {product_id} at {location_id}: requested {requested}, available {available}"
    )]
    InsufficientAvailable {
        product_id: ProductId,
        location_id: LocationId,
        requested: Quantity,
        available: Quantity,
    },

    /// A receipt/delivery would push the fulfilled counter past the ordered quantity.
    #[error(
        "over-fulfillment of order line {line_id}: ordered {ordered}, fulfilled {fulfilled}, requested {requested}"
    )]
    OverFulfillment {
        line_id: OrderLineId,
        ordered: Quantity,
        fulfilled: Quantity,
        requested: Quantity,
    },

    /// A release asked for more than is reserved (reported, then clamped).
    #[error(
        "over-release for product {product_id} at {location_id}: requested {requested}, reserved {reserved}"
    )]
    OverRelease {
        product_id: ProductId,
        location_id: LocationId,
        requested: Quantity,
        reserved: Quantity,
    },

    #[error("stock adjustment {0} is already confirmed")]
    AlreadyConfirmed(AdjustmentId),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StockError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
