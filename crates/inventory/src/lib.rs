//! Inventory ledger domain module.
//!
//! This crate contains the business rules of the stock ledger (movements,
//! balances, reservations, order-line fulfillment counters, stock adjustments,
//! aging), implemented purely as deterministic domain logic (no IO, no storage).

pub mod adjustment;
pub mod aging;
pub mod balance;
pub mod error;
pub mod fulfillment;
pub mod ids;
pub mod movement;

pub use adjustment::{AdjustmentStatus, Confirmation, StockAdjustment, StockAdjustmentLine};
pub use aging::{AgingBucket, DEFAULT_AGING_BOUNDARIES, FifoLayer, age_buckets, fifo_layers};
pub use balance::{BalanceEffect, Release, StockBalance};
pub use error::{StockError, StockResult};
pub use fulfillment::{OrderKind, OrderLine};
pub use ids::{AdjustmentId, AdjustmentLineId, LocationId, MovementId, OrderLineId, ProductId};
pub use movement::{
    BalanceKey, Direction, FloorPolicy, MovementDraft, MovementKind, MovementReference,
    ReferenceType, StockMovement, fold_movements,
};
