//! Stock adjustments: a physical count reconciled against the system quantity.
//!
//! Lifecycle is `Draft -> Confirmed`, nothing else. Lines are editable while
//! draft; confirmation freezes them and is the only step that yields ledger
//! movements (one per non-zero line, exactly once).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockpile_core::{AggregateRoot, Quantity, UserId};

use crate::error::{StockError, StockResult};
use crate::ids::{AdjustmentId, AdjustmentLineId, LocationId, ProductId};
use crate::movement::{Direction, MovementDraft, MovementKind, MovementReference, ReferenceType};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed_by: UserId,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum AdjustmentStatus {
    Draft,
    Confirmed(Confirmation),
}

impl AdjustmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentStatus::Draft => "draft",
            AdjustmentStatus::Confirmed(_) => "confirmed",
        }
    }
}

/// One counted product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustmentLine {
    pub id: AdjustmentLineId,
    pub product_id: ProductId,
    /// System on-hand captured when the line was added.
    pub quantity_before: Quantity,
    /// Counted quantity.
    pub quantity_after: Quantity,
    /// `quantity_after - quantity_before`.
    pub difference: Quantity,
}

impl StockAdjustmentLine {
    pub fn new(
        id: AdjustmentLineId,
        product_id: ProductId,
        quantity_before: Quantity,
        quantity_after: Quantity,
    ) -> Self {
        Self {
            id,
            product_id,
            quantity_before,
            quantity_after,
            difference: quantity_after - quantity_before,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    id: AdjustmentId,
    location_id: LocationId,
    adjustment_date: NaiveDate,
    reason: String,
    status: AdjustmentStatus,
    lines: Vec<StockAdjustmentLine>,
    created_by: UserId,
    created_at: DateTime<Utc>,
    version: u64,
}

impl StockAdjustment {
    /// Open a new draft.
    pub fn draft(
        id: AdjustmentId,
        location_id: LocationId,
        adjustment_date: NaiveDate,
        reason: impl Into<String>,
        created_by: UserId,
        created_at: DateTime<Utc>,
    ) -> StockResult<Self> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(StockError::validation("adjustment reason cannot be empty"));
        }
        Ok(Self {
            id,
            location_id,
            adjustment_date,
            reason,
            status: AdjustmentStatus::Draft,
            lines: Vec::new(),
            created_by,
            created_at,
            version: 1,
        })
    }

    /// Rebuild from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: AdjustmentId,
        location_id: LocationId,
        adjustment_date: NaiveDate,
        reason: String,
        status: AdjustmentStatus,
        lines: Vec<StockAdjustmentLine>,
        created_by: UserId,
        created_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            id,
            location_id,
            adjustment_date,
            reason,
            status,
            lines,
            created_by,
            created_at,
            version,
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn adjustment_date(&self) -> NaiveDate {
        self.adjustment_date
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn status(&self) -> AdjustmentStatus {
        self.status
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.status, AdjustmentStatus::Draft)
    }

    pub fn lines(&self) -> &[StockAdjustmentLine] {
        &self.lines
    }

    pub fn line(&self, line_id: AdjustmentLineId) -> Option<&StockAdjustmentLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Idempotency key of the movement a line produces.
    pub fn movement_key(&self, line_id: AdjustmentLineId) -> String {
        format!("ADJ:{}:{}", self.id, line_id)
    }

    pub fn add_line(
        &mut self,
        line_id: AdjustmentLineId,
        product_id: ProductId,
        quantity_before: Quantity,
        counted: Quantity,
    ) -> StockResult<&StockAdjustmentLine> {
        self.ensure_draft()?;
        ensure_counted(counted)?;
        if self.lines.iter().any(|l| l.product_id == product_id) {
            return Err(StockError::validation(format!(
                "product {product_id} is already counted on adjustment {}",
                self.id
            )));
        }
        if self.lines.iter().any(|l| l.id == line_id) {
            return Err(StockError::validation(format!("duplicate line id {line_id}")));
        }

        self.lines.push(StockAdjustmentLine::new(
            line_id,
            product_id,
            quantity_before,
            counted,
        ));
        self.version += 1;
        let idx = self.lines.len() - 1;
        Ok(&self.lines[idx])
    }

    /// Change the counted quantity; the `quantity_before` snapshot is kept.
    pub fn update_line(
        &mut self,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> StockResult<&StockAdjustmentLine> {
        self.ensure_draft()?;
        ensure_counted(counted)?;
        let idx = self.line_index(line_id)?;
        let line = &mut self.lines[idx];
        line.quantity_after = counted;
        line.difference = counted - line.quantity_before;
        self.version += 1;
        Ok(&self.lines[idx])
    }

    pub fn remove_line(&mut self, line_id: AdjustmentLineId) -> StockResult<StockAdjustmentLine> {
        self.ensure_draft()?;
        let idx = self.line_index(line_id)?;
        self.version += 1;
        Ok(self.lines.remove(idx))
    }

    /// Movements a confirmation must post: one `adjustment` per non-zero line.
    ///
    /// Adjustment movements bypass the stock floor.
    pub fn movement_drafts(
        &self,
        posted_by: UserId,
        effective_at: DateTime<Utc>,
    ) -> StockResult<Vec<MovementDraft>> {
        self.ensure_draft()?;
        if self.lines.is_empty() {
            return Err(StockError::validation(
                "cannot confirm a stock adjustment without lines",
            ));
        }

        Ok(self
            .lines
            .iter()
            .filter(|l| !l.difference.is_zero())
            .map(|l| {
                let direction = if l.difference.is_positive() {
                    Direction::Increase
                } else {
                    Direction::Decrease
                };
                MovementDraft::new(
                    self.movement_key(l.id),
                    l.product_id,
                    self.location_id,
                    MovementKind::Adjustment,
                    direction,
                    l.difference.abs(),
                    effective_at,
                    posted_by,
                )
                .with_reference(MovementReference::new(
                    ReferenceType::AdjustmentLine,
                    *l.id.as_uuid(),
                ))
                .with_note(self.reason.clone())
                .unchecked()
            })
            .collect())
    }

    /// The single legal transition: `Draft -> Confirmed`.
    pub fn confirm(&mut self, confirmation: Confirmation) -> StockResult<()> {
        self.ensure_draft()?;
        self.status = AdjustmentStatus::Confirmed(confirmation);
        self.version += 1;
        Ok(())
    }

    fn ensure_draft(&self) -> StockResult<()> {
        match self.status {
            AdjustmentStatus::Draft => Ok(()),
            AdjustmentStatus::Confirmed(_) => Err(StockError::AlreadyConfirmed(self.id)),
        }
    }

    fn line_index(&self, line_id: AdjustmentLineId) -> StockResult<usize> {
        self.lines
            .iter()
            .position(|l| l.id == line_id)
            .ok_or_else(|| {
                StockError::Domain(stockpile_core::DomainError::not_found(format!(
                    "adjustment line {line_id}"
                )))
            })
    }
}

impl AggregateRoot for StockAdjustment {
    type Id = AdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn ensure_counted(counted: Quantity) -> StockResult<()> {
    if counted.is_negative() {
        return Err(StockError::validation(format!(
            "counted quantity cannot be negative, got {counted}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(v: i64) -> Quantity {
        Quantity::from_i64(v)
    }

    fn adjustment() -> StockAdjustment {
        StockAdjustment::draft(
            AdjustmentId::generate(),
            LocationId::generate(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            "quarter-end count",
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn line_difference_is_after_minus_before() {
        let mut adj = adjustment();
        let line = adj
            .add_line(AdjustmentLineId::generate(), ProductId::generate(), q(30), q(45))
            .unwrap();
        assert_eq!(line.difference, q(15));
    }

    #[test]
    fn update_keeps_the_before_snapshot() {
        let mut adj = adjustment();
        let line_id = AdjustmentLineId::generate();
        adj.add_line(line_id, ProductId::generate(), q(30), q(45)).unwrap();

        let line = adj.update_line(line_id, q(28)).unwrap();
        assert_eq!(line.quantity_before, q(30));
        assert_eq!(line.difference, q(-2));
    }

    #[test]
    fn movement_drafts_skip_zero_lines() {
        let mut adj = adjustment();
        let up = AdjustmentLineId::generate();
        let down = AdjustmentLineId::generate();
        adj.add_line(up, ProductId::generate(), q(30), q(45)).unwrap();
        adj.add_line(AdjustmentLineId::generate(), ProductId::generate(), q(7), q(7))
            .unwrap();
        adj.add_line(down, ProductId::generate(), q(10), q(4)).unwrap();

        let drafts = adj.movement_drafts(UserId::new(), Utc::now()).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].signed_delta(), q(15));
        assert_eq!(drafts[0].movement_key, adj.movement_key(up));
        assert_eq!(drafts[1].signed_delta(), q(-6));
        assert!(drafts.iter().all(|d| d.kind == MovementKind::Adjustment));
        assert!(drafts.iter().all(|d| d.validate().is_ok()));
    }

    #[test]
    fn confirm_is_terminal() {
        let mut adj = adjustment();
        let line_id = AdjustmentLineId::generate();
        adj.add_line(line_id, ProductId::generate(), q(1), q(2)).unwrap();

        let confirmation = Confirmation {
            confirmed_by: UserId::new(),
            confirmed_at: Utc::now(),
        };
        adj.confirm(confirmation).unwrap();
        assert!(!adj.is_draft());

        assert!(matches!(
            adj.confirm(confirmation),
            Err(StockError::AlreadyConfirmed(_))
        ));
        assert!(matches!(
            adj.update_line(line_id, q(3)),
            Err(StockError::AlreadyConfirmed(_))
        ));
        assert!(matches!(
            adj.movement_drafts(UserId::new(), Utc::now()),
            Err(StockError::AlreadyConfirmed(_))
        ));
    }

    #[test]
    fn each_mutation_bumps_the_version() {
        let mut adj = adjustment();
        let v0 = adj.version();
        let line_id = AdjustmentLineId::generate();
        adj.add_line(line_id, ProductId::generate(), q(1), q(2)).unwrap();
        adj.update_line(line_id, q(5)).unwrap();
        adj.remove_line(line_id).unwrap();
        assert_eq!(adj.version(), v0 + 3);
    }

    #[test]
    fn rejects_duplicate_products_and_negative_counts() {
        let mut adj = adjustment();
        let product = ProductId::generate();
        adj.add_line(AdjustmentLineId::generate(), product, q(1), q(2)).unwrap();
        assert!(adj
            .add_line(AdjustmentLineId::generate(), product, q(1), q(3))
            .is_err());
        assert!(adj
            .add_line(AdjustmentLineId::generate(), ProductId::generate(), q(1), q(-1))
            .is_err());
    }

    #[test]
    fn empty_adjustment_cannot_be_confirmed() {
        let adj = adjustment();
        assert!(matches!(
            adj.movement_drafts(UserId::new(), Utc::now()),
            Err(StockError::Validation(_))
        ));
    }
}
