//! Adjustment Reconciler: draft edits and all-or-nothing confirmation.

use chrono::NaiveDate;
use tracing::{info, instrument};

use stockpile_core::{Actor, AggregateRoot, Capability, Quantity, Resource};
use stockpile_inventory::{
    AdjustmentId, AdjustmentLineId, Confirmation, LocationId, ProductId, ReferenceType,
    StockAdjustment, StockAdjustmentLine, StockError, StockMovement,
};

use super::{EngineContext, authorize, report_truncations};
use crate::error::{LedgerError, LedgerResult};
use crate::store::{AdjustmentConfirmation, AdjustmentFilter, LedgerStore, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedAdjustment {
    pub adjustment: StockAdjustment,
    /// One per line with a non-zero difference.
    pub movements: Vec<StockMovement>,
}

pub struct AdjustmentService<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> AdjustmentService<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, actor, reason), fields(%location_id, %adjustment_date), err)]
    pub async fn create(
        &self,
        actor: &Actor,
        location_id: LocationId,
        adjustment_date: NaiveDate,
        reason: impl Into<String> + Send,
    ) -> LedgerResult<StockAdjustment> {
        authorize(actor, Resource::Adjustments, Capability::Create)?;
        self.ctx.location(location_id)?;

        let adjustment = StockAdjustment::draft(
            AdjustmentId::generate(),
            location_id,
            adjustment_date,
            reason,
            actor.user_id(),
            self.ctx.now(),
        )?;
        let adjustment = self.ctx.store.insert_adjustment(adjustment).await?;
        info!(adjustment_id = %adjustment.id(), "stock adjustment drafted");
        Ok(adjustment)
    }

    /// Add a counted line. `quantity_before` is the pair's on-hand right now.
    #[instrument(skip(self, actor), fields(%adjustment_id, %product_id, %counted), err)]
    pub async fn add_line(
        &self,
        actor: &Actor,
        adjustment_id: AdjustmentId,
        product_id: ProductId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustmentLine> {
        authorize(actor, Resource::Adjustments, Capability::Update)?;
        self.ctx.product(product_id)?;

        let line_id = AdjustmentLineId::generate();
        let adjustment = self
            .ctx
            .store
            .add_adjustment_line(adjustment_id, line_id, product_id, counted)
            .await?;
        let line = adjustment
            .line(line_id)
            .cloned()
            .ok_or_else(|| LedgerError::storage("added adjustment line was not stored"))?;
        info!(
            %line_id,
            before = %line.quantity_before,
            after = %line.quantity_after,
            "adjustment line added"
        );
        Ok(line)
    }

    /// Change the counted quantity; the `quantity_before` snapshot is kept.
    #[instrument(skip(self, actor), fields(%adjustment_id, %line_id, %counted), err)]
    pub async fn update_line(
        &self,
        actor: &Actor,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
        counted: Quantity,
    ) -> LedgerResult<StockAdjustment> {
        authorize(actor, Resource::Adjustments, Capability::Update)?;
        self.ctx
            .store
            .update_adjustment_line(adjustment_id, line_id, counted)
            .await
    }

    #[instrument(skip(self, actor), fields(%adjustment_id, %line_id), err)]
    pub async fn remove_line(
        &self,
        actor: &Actor,
        adjustment_id: AdjustmentId,
        line_id: AdjustmentLineId,
    ) -> LedgerResult<StockAdjustment> {
        authorize(actor, Resource::Adjustments, Capability::Delete)?;
        self.ctx
            .store
            .remove_adjustment_line(adjustment_id, line_id)
            .await
    }

    pub async fn get(&self, adjustment_id: AdjustmentId) -> LedgerResult<StockAdjustment> {
        self.ctx
            .store
            .adjustment(adjustment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("stock adjustment {adjustment_id}")))
    }

    /// Newest adjustment date first.
    pub async fn list(&self, filter: AdjustmentFilter) -> LedgerResult<Vec<StockAdjustment>> {
        self.ctx.store.adjustments(&filter).await
    }

    /// Post one adjustment movement per non-zero line and flip the header to
    /// confirmed, all in one unit of work.
    ///
    /// The header version read here travels with the commit; an edit landing
    /// in between fails the confirmation with `Conflict`.
    #[instrument(skip(self, actor), fields(%adjustment_id), err)]
    pub async fn confirm(
        &self,
        actor: &Actor,
        adjustment_id: AdjustmentId,
    ) -> LedgerResult<ConfirmedAdjustment> {
        authorize(actor, Resource::Adjustments, Capability::Update)?;
        let adjustment = self.get(adjustment_id).await?;

        let now = self.ctx.now();
        let drafts = adjustment.movement_drafts(actor.user_id(), now)?;
        let confirmation = AdjustmentConfirmation {
            adjustment_id,
            expected_version: adjustment.version(),
            confirmation: Confirmation {
                confirmed_by: actor.user_id(),
                confirmed_at: now,
            },
        };
        let work = drafts
            .into_iter()
            .fold(UnitOfWork::new(now), UnitOfWork::movement)
            .confirm(confirmation);

        let receipt = self.ctx.store.commit(work).await.map_err(|err| match err {
            // A line movement posted by a concurrent confirmation of this document.
            LedgerError::DuplicateMovement { existing, .. }
                if posted_by_confirmation(&adjustment, &existing) =>
            {
                LedgerError::Stock(StockError::AlreadyConfirmed(adjustment_id))
            }
            other => other,
        })?;
        report_truncations(&receipt);

        let confirmed = receipt
            .adjustment
            .clone()
            .ok_or_else(|| LedgerError::storage("commit receipt is missing the adjustment"))?;
        info!(
            lines = confirmed.lines().len(),
            movements = receipt.movements.len(),
            "stock adjustment confirmed"
        );
        Ok(ConfirmedAdjustment {
            adjustment: confirmed,
            movements: receipt.movements,
        })
    }
}

fn posted_by_confirmation(adjustment: &StockAdjustment, movement: &StockMovement) -> bool {
    movement.reference.is_some_and(|r| {
        r.reference_type == ReferenceType::AdjustmentLine
            && adjustment.lines().iter().any(|l| l.id.as_uuid() == &r.reference_id)
    })
}
