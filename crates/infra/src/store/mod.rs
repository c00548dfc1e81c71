//! Ledger storage boundary.
//!
//! A [`LedgerStore`] owns the movement log, the balance rows, the order-line
//! fulfillment counters and the adjustment documents. Every mutation that
//! touches more than one of them goes through [`LedgerStore::commit`] as one
//! [`UnitOfWork`]: either every effect is applied or none is.
//!
//! Backends:
//! - [`InMemoryLedgerStore`]: keyed locks per (product, location) pair, per
//!   order line and per adjustment (tests, dev, single-process).
//! - [`PostgresLedgerStore`]: one database transaction per unit of work, with
//!   single-statement conditional updates for every counter.

pub mod in_memory;
pub mod postgres;
pub mod query;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use stockpile_core::Quantity;
use stockpile_inventory::{
    AdjustmentId, AdjustmentLineId, BalanceKey, Confirmation, MovementDraft, MovementId, OrderLine,
    OrderLineId, ProductId, Release, StockAdjustment, StockBalance, StockMovement,
};

use crate::error::{LedgerError, LedgerResult};

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use query::{
    AdjustmentFilter, AdjustmentState, BalanceFilter, MovementFilter, MovementSummary, Page,
    PageLimits, Pagination,
};

/// Increment of an order line's fulfilled counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FulfillmentIncrement {
    pub line_id: OrderLineId,
    pub quantity: Quantity,
}

/// Flip of an adjustment header from draft to confirmed.
///
/// `expected_version` is the version the movements were computed from; a
/// header edited since then fails the commit with `Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustmentConfirmation {
    pub adjustment_id: AdjustmentId,
    pub expected_version: u64,
    pub confirmation: Confirmation,
}

/// Everything one logical operation writes.
///
/// Applied in this order: key claims, adjustment header check, fulfillment
/// counter, reservation releases, movements (each with its balance delta).
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub movements: Vec<MovementDraft>,
    /// Clamped at the reserved quantity; never fails.
    pub releases: Vec<(BalanceKey, Quantity)>,
    pub fulfillment: Option<FulfillmentIncrement>,
    pub confirm_adjustment: Option<AdjustmentConfirmation>,
    pub recorded_at: DateTime<Utc>,
}

impl UnitOfWork {
    pub fn new(recorded_at: DateTime<Utc>) -> Self {
        Self {
            movements: Vec::new(),
            releases: Vec::new(),
            fulfillment: None,
            confirm_adjustment: None,
            recorded_at,
        }
    }

    pub fn movement(mut self, draft: MovementDraft) -> Self {
        self.movements.push(draft);
        self
    }

    pub fn release(mut self, key: BalanceKey, quantity: Quantity) -> Self {
        self.releases.push((key, quantity));
        self
    }

    pub fn fulfill(mut self, line_id: OrderLineId, quantity: Quantity) -> Self {
        self.fulfillment = Some(FulfillmentIncrement { line_id, quantity });
        self
    }

    pub fn confirm(mut self, confirmation: AdjustmentConfirmation) -> Self {
        self.confirm_adjustment = Some(confirmation);
        self
    }

    /// Pairs touched by this unit, sorted and deduplicated (lock order).
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> = self
            .movements
            .iter()
            .map(MovementDraft::balance_key)
            .chain(self.releases.iter().map(|(k, _)| *k))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Shape checks every backend runs before touching storage.
    pub fn validate(&self) -> LedgerResult<()> {
        for draft in &self.movements {
            draft.validate()?;
        }
        let mut keys: Vec<&str> = self.movements.iter().map(|d| d.movement_key.as_str()).collect();
        keys.sort_unstable();
        if let Some(w) = keys.windows(2).find(|w| w[0] == w[1]) {
            return Err(LedgerError::validation(format!(
                "movement key '{}' appears twice in one unit of work",
                w[0]
            )));
        }
        for (_, qty) in &self.releases {
            if !qty.is_positive() {
                return Err(LedgerError::validation(format!(
                    "release quantity must be positive, got {qty}"
                )));
            }
        }
        if let Some(f) = &self.fulfillment {
            if !f.quantity.is_positive() {
                return Err(LedgerError::validation(format!(
                    "fulfillment quantity must be positive, got {}",
                    f.quantity
                )));
            }
        }
        Ok(())
    }
}

/// What a committed unit of work produced.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// In the order the drafts were given.
    pub movements: Vec<StockMovement>,
    /// Post-commit balance of every touched pair, sorted by key.
    pub balances: Vec<StockBalance>,
    /// One per requested release, in order.
    pub releases: Vec<Release>,
    /// Reservations cut back by unchecked decreases.
    pub truncated_reservations: Vec<(BalanceKey, Quantity)>,
    pub order_line: Option<OrderLine>,
    pub adjustment: Option<StockAdjustment>,
}

impl CommitReceipt {
    pub fn balance(&self, key: BalanceKey) -> Option<&StockBalance> {
        self.balances.iter().find(|b| b.key() == key)
    }
}

/// Durable ledger storage.
///
/// Implementations must make each `commit` atomic and must serialize updates
/// per balance pair, per order line and per adjustment without a global lock.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply a unit of work atomically.
    ///
    /// Fails with `DuplicateMovement` (carrying the committed movement) if any
    /// movement key was already committed; nothing else is applied then.
    async fn commit(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt>;

    /// Compare-and-increment of `reserved` (`reserved + qty <= on_hand`).
    async fn reserve(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockBalance>;

    /// Decrement of `reserved`, floored at zero.
    async fn release(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<(StockBalance, Release)>;

    async fn balance(&self, key: BalanceKey) -> LedgerResult<Option<StockBalance>>;

    /// Unordered; callers sort.
    async fn balances(&self, filter: &BalanceFilter) -> LedgerResult<Vec<StockBalance>>;

    /// Newest first: `effective_at` desc, then commit sequence desc.
    async fn movements(
        &self,
        filter: &MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>>;

    async fn summarize(&self, filter: &MovementFilter) -> LedgerResult<MovementSummary>;

    /// Every movement of one pair in commit order.
    async fn pair_history(&self, key: BalanceKey) -> LedgerResult<Vec<StockMovement>>;

    async fn movement(&self, id: MovementId) -> LedgerResult<Option<StockMovement>>;

    async fn movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>>;

    /// Fails with `Conflict` if the line id is taken.
    async fn insert_order_line(&self, line: OrderLine) -> LedgerResult<OrderLine>;

    async fn set_ordered_quantity(
        &self,
        line_id: OrderLineId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<OrderLine>;

    async fn order_line(&self, line_id: OrderLineId) -> LedgerResult<Option<OrderLine>>;

    /// Fails with `Conflict` if the adjustment id is taken.
    async fn insert_adjustment(&self, adjustment: StockAdjustment)
        -> LedgerResult<StockAdjustment>;

    /// Add a counted line; `quantity_before` is read from the pair's current
    /// on-hand under the adjustment's lock.
    async fn add_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment>;

    async fn update_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment>;

    async fn remove_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
    ) -> LedgerResult<StockAdjustment>;

    async fn adjustment(&self, adjustment_id: AdjustmentId)
        -> LedgerResult<Option<StockAdjustment>>;

    /// Newest adjustment date first.
    async fn adjustments(&self, filter: &AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>>;
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn commit(&self, work: UnitOfWork) -> LedgerResult<CommitReceipt> {
        (**self).commit(work).await
    }

    async fn reserve(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockBalance> {
        (**self).reserve(key, quantity, at).await
    }

    async fn release(
        &self,
        key: BalanceKey,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<(StockBalance, Release)> {
        (**self).release(key, quantity, at).await
    }

    async fn balance(&self, key: BalanceKey) -> LedgerResult<Option<StockBalance>> {
        (**self).balance(key).await
    }

    async fn balances(&self, filter: &BalanceFilter) -> LedgerResult<Vec<StockBalance>> {
        (**self).balances(filter).await
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>> {
        (**self).movements(filter, page).await
    }

    async fn summarize(&self, filter: &MovementFilter) -> LedgerResult<MovementSummary> {
        (**self).summarize(filter).await
    }

    async fn pair_history(&self, key: BalanceKey) -> LedgerResult<Vec<StockMovement>> {
        (**self).pair_history(key).await
    }

    async fn movement(&self, id: MovementId) -> LedgerResult<Option<StockMovement>> {
        (**self).movement(id).await
    }

    async fn movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        (**self).movement_by_key(movement_key).await
    }

    async fn insert_order_line(&self, line: OrderLine) -> LedgerResult<OrderLine> {
        (**self).insert_order_line(line).await
    }

    async fn set_ordered_quantity(
        &self,
        line_id: OrderLineId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<OrderLine> {
        (**self).set_ordered_quantity(line_id, ordered, at).await
    }

    async fn order_line(&self, line_id: OrderLineId) -> LedgerResult<Option<OrderLine>> {
        (**self).order_line(line_id).await
    }

    async fn insert_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> LedgerResult<StockAdjustment> {
        (**self).insert_adjustment(adjustment).await
    }

    async fn add_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        (**self)
            .add_adjustment_line(adjustment_id, line_id, product_id, counted)
            .await
    }

    async fn update_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        (**self)
            .update_adjustment_line(adjustment_id, line_id, counted)
            .await
    }

    async fn remove_adjustment_line(
        &self,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
    ) -> LedgerResult<StockAdjustment> {
        (**self).remove_adjustment_line(adjustment_id, line_id).await
    }

    async fn adjustment(
        &self,
        adjustment_id: AdjustmentId,
    ) -> LedgerResult<Option<StockAdjustment>> {
        (**self).adjustment(adjustment_id).await
    }

    async fn adjustments(&self, filter: &AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>> {
        (**self).adjustments(filter).await
    }
}
