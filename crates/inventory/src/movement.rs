//! Stock movements: the immutable, append-only facts of the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockpile_core::{Quantity, UserId};

use crate::error::{StockError, StockResult};
use crate::ids::{LocationId, MovementId, ProductId};

/// Longest accepted idempotency key.
pub const MAX_MOVEMENT_KEY_LEN: usize = 128;

/// Semantic tag of a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    In,
    Out,
    Adjustment,
    Transfer,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "in",
            MovementKind::Out => "out",
            MovementKind::Adjustment => "adjustment",
            MovementKind::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> StockResult<Self> {
        match s {
            "in" => Ok(MovementKind::In),
            "out" => Ok(MovementKind::Out),
            "adjustment" => Ok(MovementKind::Adjustment),
            "transfer" => Ok(MovementKind::Transfer),
            other => Err(StockError::validation(format!("unknown movement kind '{other}'"))),
        }
    }
}

/// Sign of a movement's effect on on-hand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Increase => "increase",
            Direction::Decrease => "decrease",
        }
    }

    pub fn parse(s: &str) -> StockResult<Self> {
        match s {
            "increase" => Ok(Direction::Increase),
            "decrease" => Ok(Direction::Decrease),
            other => Err(StockError::validation(format!("unknown direction '{other}'"))),
        }
    }
}

/// Whether a decrease is checked against the stock floor.
///
/// Only adjustment movements may be posted `Unchecked`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorPolicy {
    Enforced,
    Unchecked,
}

impl FloorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FloorPolicy::Enforced => "enforced",
            FloorPolicy::Unchecked => "unchecked",
        }
    }

    pub fn parse(s: &str) -> StockResult<Self> {
        match s {
            "enforced" => Ok(FloorPolicy::Enforced),
            "unchecked" => Ok(FloorPolicy::Unchecked),
            other => Err(StockError::validation(format!("unknown floor policy '{other}'"))),
        }
    }
}

/// Originating document of a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    PurchaseOrderLine,
    SalesOrderLine,
    AdjustmentLine,
    Transfer,
    External,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::PurchaseOrderLine => "purchase_order_line",
            ReferenceType::SalesOrderLine => "sales_order_line",
            ReferenceType::AdjustmentLine => "adjustment_line",
            ReferenceType::Transfer => "transfer",
            ReferenceType::External => "external",
        }
    }

    pub fn parse(s: &str) -> StockResult<Self> {
        match s {
            "purchase_order_line" => Ok(ReferenceType::PurchaseOrderLine),
            "sales_order_line" => Ok(ReferenceType::SalesOrderLine),
            "adjustment_line" => Ok(ReferenceType::AdjustmentLine),
            "transfer" => Ok(ReferenceType::Transfer),
            "external" => Ok(ReferenceType::External),
            other => Err(StockError::validation(format!("unknown reference type '{other}'"))),
        }
    }
}

/// `(reference_type, reference_id)` pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
}

impl MovementReference {
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<Uuid>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
        }
    }
}

/// Key of one balance row: (product, location).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub product_id: ProductId,
    pub location_id: LocationId,
}

impl BalanceKey {
    pub fn new(product_id: ProductId, location_id: LocationId) -> Self {
        Self {
            product_id,
            location_id,
        }
    }
}

/// A movement requested by a caller, not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementDraft {
    /// Caller-supplied idempotency key ("movement number").
    pub movement_key: String,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    pub direction: Direction,
    /// Always-positive magnitude.
    pub quantity: Quantity,
    pub reference: Option<MovementReference>,
    pub effective_at: DateTime<Utc>,
    pub note: Option<String>,
    pub floor: FloorPolicy,
    pub posted_by: UserId,
}

impl MovementDraft {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        movement_key: impl Into<String>,
        product_id: ProductId,
        location_id: LocationId,
        kind: MovementKind,
        direction: Direction,
        quantity: Quantity,
        effective_at: DateTime<Utc>,
        posted_by: UserId,
    ) -> Self {
        Self {
            movement_key: movement_key.into(),
            product_id,
            location_id,
            kind,
            direction,
            quantity,
            reference: None,
            effective_at,
            note: None,
            floor: FloorPolicy::Enforced,
            posted_by,
        }
    }

    pub fn with_reference(mut self, reference: MovementReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.floor = FloorPolicy::Unchecked;
        self
    }

    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.location_id)
    }

    pub fn signed_delta(&self) -> Quantity {
        signed(self.direction, self.quantity)
    }

    /// Reject malformed drafts before anything is written.
    pub fn validate(&self) -> StockResult<()> {
        let key = self.movement_key.trim();
        if key.is_empty() {
            return Err(StockError::validation("movement key cannot be empty"));
        }
        if key.len() != self.movement_key.len() {
            return Err(StockError::validation(
                "movement key cannot have leading or trailing whitespace",
            ));
        }
        if self.movement_key.len() > MAX_MOVEMENT_KEY_LEN {
            return Err(StockError::validation(format!(
                "movement key longer than {MAX_MOVEMENT_KEY_LEN} characters"
            )));
        }
        if !self.quantity.is_positive() {
            return Err(StockError::validation(format!(
                "movement quantity must be positive, got {}",
                self.quantity
            )));
        }
        match (self.kind, self.direction) {
            (MovementKind::In, Direction::Decrease) => {
                return Err(StockError::validation("'in' movements must increase stock"));
            }
            (MovementKind::Out, Direction::Increase) => {
                return Err(StockError::validation("'out' movements must decrease stock"));
            }
            _ => {}
        }
        if self.floor == FloorPolicy::Unchecked && self.kind != MovementKind::Adjustment {
            return Err(StockError::validation(
                "only adjustment movements may bypass the stock floor",
            ));
        }
        Ok(())
    }
}

/// A committed movement. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    /// Global commit order; tie-break for equal effective times.
    pub sequence: u64,
    pub movement_key: String,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    pub direction: Direction,
    pub quantity: Quantity,
    pub reference: Option<MovementReference>,
    pub effective_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
    pub floor: FloorPolicy,
    pub posted_by: UserId,
}

impl StockMovement {
    pub fn from_draft(
        draft: MovementDraft,
        id: MovementId,
        sequence: u64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sequence,
            movement_key: draft.movement_key,
            product_id: draft.product_id,
            location_id: draft.location_id,
            kind: draft.kind,
            direction: draft.direction,
            quantity: draft.quantity,
            reference: draft.reference,
            effective_at: draft.effective_at,
            recorded_at,
            note: draft.note,
            floor: draft.floor,
            posted_by: draft.posted_by,
        }
    }

    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.location_id)
    }

    pub fn signed_delta(&self) -> Quantity {
        signed(self.direction, self.quantity)
    }
}

/// Fold movements by signed quantity (the on-hand they imply).
pub fn fold_movements<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> Quantity {
    movements.into_iter().map(StockMovement::signed_delta).sum()
}

fn signed(direction: Direction, quantity: Quantity) -> Quantity {
    match direction {
        Direction::Increase => quantity,
        Direction::Decrease => -quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: MovementKind, direction: Direction, qty: i64) -> MovementDraft {
        MovementDraft::new(
            "MV-0001",
            ProductId::generate(),
            LocationId::generate(),
            kind,
            direction,
            Quantity::from_i64(qty),
            Utc::now(),
            UserId::new(),
        )
    }

    #[test]
    fn signed_delta_follows_direction() {
        assert_eq!(
            draft(MovementKind::In, Direction::Increase, 5).signed_delta(),
            Quantity::from_i64(5)
        );
        assert_eq!(
            draft(MovementKind::Out, Direction::Decrease, 5).signed_delta(),
            Quantity::from_i64(-5)
        );
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let err = draft(MovementKind::In, Direction::Increase, 0).validate().unwrap_err();
        assert!(matches!(err, StockError::Validation(_)));
    }

    #[test]
    fn kind_and_direction_must_agree() {
        assert!(draft(MovementKind::In, Direction::Decrease, 1).validate().is_err());
        assert!(draft(MovementKind::Out, Direction::Increase, 1).validate().is_err());
        assert!(draft(MovementKind::Transfer, Direction::Increase, 1).validate().is_ok());
        assert!(draft(MovementKind::Adjustment, Direction::Decrease, 1).validate().is_ok());
    }

    #[test]
    fn only_adjustments_may_skip_the_floor() {
        assert!(draft(MovementKind::Out, Direction::Decrease, 1)
            .unchecked()
            .validate()
            .is_err());
        assert!(draft(MovementKind::Adjustment, Direction::Decrease, 1)
            .unchecked()
            .validate()
            .is_ok());
    }

    #[test]
    fn blank_or_padded_keys_are_rejected() {
        let mut d = draft(MovementKind::In, Direction::Increase, 1);
        d.movement_key = "   ".to_string();
        assert!(d.validate().is_err());
        d.movement_key = " MV-1".to_string();
        assert!(d.validate().is_err());
        d.movement_key = "x".repeat(MAX_MOVEMENT_KEY_LEN + 1);
        assert!(d.validate().is_err());
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            MovementKind::In,
            MovementKind::Out,
            MovementKind::Adjustment,
            MovementKind::Transfer,
        ] {
            assert_eq!(MovementKind::parse(kind.as_str()).unwrap(), kind);
        }
    }
}
