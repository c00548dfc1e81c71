//! Order-line fulfillment counters (received / delivered quantity).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockpile_core::Quantity;

use crate::error::{StockError, StockResult};
use crate::ids::{LocationId, OrderLineId, ProductId};
use crate::movement::{BalanceKey, Direction, MovementKind, MovementReference, ReferenceType};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Purchase,
    Sale,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Purchase => "purchase",
            OrderKind::Sale => "sale",
        }
    }

    pub fn parse(s: &str) -> StockResult<Self> {
        match s {
            "purchase" => Ok(OrderKind::Purchase),
            "sale" => Ok(OrderKind::Sale),
            other => Err(StockError::validation(format!("unknown order kind '{other}'"))),
        }
    }

    fn key_prefix(&self) -> &'static str {
        match self {
            OrderKind::Purchase => "PO",
            OrderKind::Sale => "SO",
        }
    }
}

/// A purchase-order or sales-order line as seen by the ledger.
///
/// The owning order module decides `ordered`; the ledger owns `fulfilled`.
/// Invariant: `0 <= fulfilled <= ordered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub kind: OrderKind,
    pub document_id: Uuid,
    pub line_no: u32,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub ordered: Quantity,
    pub fulfilled: Quantity,
    pub updated_at: DateTime<Utc>,
}

impl OrderLine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OrderLineId,
        kind: OrderKind,
        document_id: Uuid,
        line_no: u32,
        product_id: ProductId,
        location_id: LocationId,
        ordered: Quantity,
        at: DateTime<Utc>,
    ) -> StockResult<Self> {
        if !ordered.is_positive() {
            return Err(StockError::validation(format!(
                "ordered quantity must be positive, got {ordered}"
            )));
        }
        if line_no == 0 {
            return Err(StockError::validation("line numbers start at 1"));
        }
        Ok(Self {
            id,
            kind,
            document_id,
            line_no,
            product_id,
            location_id,
            ordered,
            fulfilled: Quantity::ZERO,
            updated_at: at,
        })
    }

    pub fn remaining(&self) -> Quantity {
        self.ordered - self.fulfilled
    }

    pub fn is_complete(&self) -> bool {
        self.fulfilled == self.ordered
    }

    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.location_id)
    }

    /// Check-and-increment of the fulfilled counter.
    pub fn increment(&mut self, qty: Quantity, at: DateTime<Utc>) -> StockResult<()> {
        if !qty.is_positive() {
            return Err(StockError::validation(format!(
                "fulfillment quantity must be positive, got {qty}"
            )));
        }
        let next = self.fulfilled.checked_add(qty)?;
        if next > self.ordered {
            return Err(StockError::OverFulfillment {
                line_id: self.id,
                ordered: self.ordered,
                fulfilled: self.fulfilled,
                requested: qty,
            });
        }
        self.fulfilled = next;
        self.updated_at = at;
        Ok(())
    }

    /// Owner-side change of the ordered quantity; never below what was fulfilled.
    pub fn set_ordered(&mut self, ordered: Quantity, at: DateTime<Utc>) -> StockResult<()> {
        if !ordered.is_positive() {
            return Err(StockError::validation(format!(
                "ordered quantity must be positive, got {ordered}"
            )));
        }
        if ordered < self.fulfilled {
            return Err(StockError::validation(format!(
                "ordered quantity {ordered} is below the fulfilled quantity {}",
                self.fulfilled
            )));
        }
        self.ordered = ordered;
        self.updated_at = at;
        Ok(())
    }

    /// Deterministic idempotency key for the `sequence`-th receipt/delivery.
    pub fn movement_key(&self, sequence: u32) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind.key_prefix(),
            self.document_id,
            self.line_no,
            sequence
        )
    }

    pub fn reference(&self) -> MovementReference {
        let reference_type = match self.kind {
            OrderKind::Purchase => ReferenceType::PurchaseOrderLine,
            OrderKind::Sale => ReferenceType::SalesOrderLine,
        };
        MovementReference::new(reference_type, *self.id.as_uuid())
    }

    /// Movement shape posted when this line is fulfilled.
    pub fn movement_shape(&self) -> (MovementKind, Direction) {
        match self.kind {
            OrderKind::Purchase => (MovementKind::In, Direction::Increase),
            OrderKind::Sale => (MovementKind::Out, Direction::Decrease),
        }
    }
}
