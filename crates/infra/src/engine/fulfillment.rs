//! Fulfillment Tracker: receipts and deliveries against order lines.
//!
//! A receipt or delivery increments the line's fulfilled counter and posts
//! the matching movement in the same unit of work. The movement key is
//! derived from (document, line number, caller sub-sequence), so a retried
//! call replays instead of double-posting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stockpile_core::{Actor, Capability, Quantity, Resource};
use stockpile_inventory::{
    LocationId, MovementDraft, OrderKind, OrderLine, OrderLineId, ProductId, StockBalance,
    StockMovement,
};

use super::{EngineContext, authorize, first_movement, report_truncations};
use crate::error::{LedgerError, LedgerResult};
use crate::store::{LedgerStore, UnitOfWork};

/// Registration of an order line owned by a purchase or sales order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOrderLine {
    pub line_id: OrderLineId,
    pub kind: OrderKind,
    pub document_id: Uuid,
    pub line_no: u32,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub ordered: Quantity,
}

/// Per-call settings for a receipt or delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FulfillmentOptions {
    /// Caller-chosen sub-sequence within the line (1st receipt, 2nd, ...).
    pub sequence: u32,
    pub effective_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// Deliveries only: release up to the delivered quantity of any
    /// reservation on the pair before posting the outbound movement.
    pub consume_reservation: bool,
}

impl FulfillmentOptions {
    pub fn sequence(sequence: u32) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    pub fn at(mut self, effective_at: DateTime<Utc>) -> Self {
        self.effective_at = Some(effective_at);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn consuming_reservation(mut self) -> Self {
        self.consume_reservation = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Applied {
        movement: StockMovement,
        line: OrderLine,
        balance: StockBalance,
        /// Reservation consumed by a delivery.
        released: Quantity,
    },
    /// The sub-sequence was already posted; nothing changed.
    Replayed {
        movement: StockMovement,
        line: OrderLine,
    },
}

impl FulfillmentOutcome {
    pub fn movement(&self) -> &StockMovement {
        match self {
            FulfillmentOutcome::Applied { movement, .. }
            | FulfillmentOutcome::Replayed { movement, .. } => movement,
        }
    }

    pub fn line(&self) -> &OrderLine {
        match self {
            FulfillmentOutcome::Applied { line, .. } | FulfillmentOutcome::Replayed { line, .. } => {
                line
            }
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, FulfillmentOutcome::Replayed { .. })
    }
}

pub struct FulfillmentService<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> FulfillmentService<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(
        skip(self, actor, request),
        fields(line_id = %request.line_id, kind = request.kind.as_str()),
        err
    )]
    pub async fn register_line(
        &self,
        actor: &Actor,
        request: RegisterOrderLine,
    ) -> LedgerResult<OrderLine> {
        authorize(actor, Resource::Fulfillment, Capability::Create)?;
        self.ctx.product(request.product_id)?;
        self.ctx.location(request.location_id)?;

        let line = OrderLine::new(
            request.line_id,
            request.kind,
            request.document_id,
            request.line_no,
            request.product_id,
            request.location_id,
            request.ordered,
            self.ctx.now(),
        )?;
        let line = self.ctx.store.insert_order_line(line).await?;
        info!(ordered = %line.ordered, "order line registered");
        Ok(line)
    }

    /// Owner-side change of `ordered`; never below what was already fulfilled.
    #[instrument(skip(self, actor), fields(%line_id, %ordered), err)]
    pub async fn set_ordered(
        &self,
        actor: &Actor,
        line_id: OrderLineId,
        ordered: Quantity,
    ) -> LedgerResult<OrderLine> {
        authorize(actor, Resource::Fulfillment, Capability::Update)?;
        self.ctx
            .store
            .set_ordered_quantity(line_id, ordered, self.ctx.now())
            .await
    }

    pub async fn order_line(&self, line_id: OrderLineId) -> LedgerResult<OrderLine> {
        self.ctx
            .store
            .order_line(line_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("order line {line_id}")))
    }

    /// Goods receipt against a purchase line.
    pub async fn apply_receipt(
        &self,
        actor: &Actor,
        line_id: OrderLineId,
        quantity: Quantity,
        options: FulfillmentOptions,
    ) -> LedgerResult<FulfillmentOutcome> {
        self.apply(actor, OrderKind::Purchase, line_id, quantity, options)
            .await
    }

    /// Delivery against a sales line.
    pub async fn apply_delivery(
        &self,
        actor: &Actor,
        line_id: OrderLineId,
        quantity: Quantity,
        options: FulfillmentOptions,
    ) -> LedgerResult<FulfillmentOutcome> {
        self.apply(actor, OrderKind::Sale, line_id, quantity, options)
            .await
    }

    #[instrument(
        skip(self, actor, options),
        fields(kind = expected.as_str(), sequence = options.sequence),
        err
    )]
    async fn apply(
        &self,
        actor: &Actor,
        expected: OrderKind,
        line_id: OrderLineId,
        quantity: Quantity,
        options: FulfillmentOptions,
    ) -> LedgerResult<FulfillmentOutcome> {
        authorize(actor, Resource::Fulfillment, Capability::Update)?;
        let line = self.order_line(line_id).await?;
        if line.kind != expected {
            return Err(LedgerError::validation(format!(
                "order line {line_id} is a {} line, expected {}",
                line.kind.as_str(),
                expected.as_str()
            )));
        }
        if options.consume_reservation && expected != OrderKind::Sale {
            return Err(LedgerError::validation(
                "only deliveries can consume a reservation",
            ));
        }

        let now = self.ctx.now();
        let key = line.balance_key();
        let (kind, direction) = line.movement_shape();
        let mut draft = MovementDraft::new(
            line.movement_key(options.sequence),
            line.product_id,
            line.location_id,
            kind,
            direction,
            quantity,
            options.effective_at.unwrap_or(now),
            actor.user_id(),
        )
        .with_reference(line.reference());
        draft.note = options.note;

        let mut work = UnitOfWork::new(now).movement(draft).fulfill(line.id, quantity);
        if options.consume_reservation {
            work = work.release(key, quantity);
        }

        let receipt = match self.ctx.store.commit(work).await {
            Ok(receipt) => receipt,
            Err(LedgerError::DuplicateMovement { key, existing }) => {
                if existing.reference != Some(line.reference()) {
                    return Err(LedgerError::Conflict(format!(
                        "movement key '{key}' belongs to another document"
                    )));
                }
                if existing.quantity != quantity
                    || existing.kind != kind
                    || existing.direction != direction
                {
                    return Err(LedgerError::validation(format!(
                        "movement key '{key}' was already posted for {} {}, not {quantity}",
                        existing.kind.as_str(),
                        existing.quantity
                    )));
                }
                warn!(movement_key = %key, "fulfillment replayed");
                return Ok(FulfillmentOutcome::Replayed {
                    movement: *existing,
                    line,
                });
            }
            Err(err) => return Err(err),
        };
        report_truncations(&receipt);

        let movement = first_movement(&receipt)?;
        let line = receipt
            .order_line
            .clone()
            .ok_or_else(|| LedgerError::storage("commit receipt is missing the order line"))?;
        let balance = receipt
            .balance(key)
            .cloned()
            .ok_or_else(|| LedgerError::storage("commit receipt is missing the balance"))?;
        let released = receipt
            .releases
            .first()
            .map(|r| r.released)
            .unwrap_or(Quantity::ZERO);

        info!(
            movement_key = %movement.movement_key,
            fulfilled = %line.fulfilled,
            ordered = %line.ordered,
            on_hand = %balance.on_hand,
            "fulfillment applied"
        );
        Ok(FulfillmentOutcome::Applied {
            movement,
            line,
            balance,
            released,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AppendMovement;
    use crate::engine::test_support::{Fixture, q};
    use stockpile_inventory::{MovementKind, ReferenceType, StockError};

    async fn register(fx: &Fixture, kind: OrderKind, ordered: i64) -> OrderLine {
        fx.engine
            .fulfillment()
            .register_line(
                &fx.actor,
                RegisterOrderLine {
                    line_id: OrderLineId::generate(),
                    kind,
                    document_id: Uuid::now_v7(),
                    line_no: 1,
                    product_id: fx.product,
                    location_id: fx.location,
                    ordered: q(ordered),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn receipt_posts_movement_and_bumps_counter() {
        let fx = Fixture::new();
        let line = register(&fx, OrderKind::Purchase, 10).await;
        let fulfillment = fx.engine.fulfillment();

        let outcome = fulfillment
            .apply_receipt(&fx.actor, line.id, q(6), FulfillmentOptions::sequence(1))
            .await
            .unwrap();
        let movement = outcome.movement();
        assert_eq!(movement.kind, MovementKind::In);
        assert_eq!(movement.movement_key, line.movement_key(1));
        assert_eq!(
            movement.reference.map(|r| r.reference_type),
            Some(ReferenceType::PurchaseOrderLine)
        );
        assert_eq!(outcome.line().fulfilled, q(6));
        assert_eq!(fulfillment.order_line(line.id).await.unwrap().fulfilled, q(6));
    }

    #[tokio::test]
    async fn over_fulfillment_posts_nothing() {
        let fx = Fixture::new();
        let line = register(&fx, OrderKind::Purchase, 5).await;
        let fulfillment = fx.engine.fulfillment();
        fulfillment
            .apply_receipt(&fx.actor, line.id, q(4), FulfillmentOptions::sequence(1))
            .await
            .unwrap();

        let err = fulfillment
            .apply_receipt(&fx.actor, line.id, q(2), FulfillmentOptions::sequence(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Stock(StockError::OverFulfillment { .. })));

        assert_eq!(fulfillment.order_line(line.id).await.unwrap().fulfilled, q(4));
        let balance = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(balance.on_hand, q(4));
        assert!(
            fx.engine
                .ledger()
                .movement_by_key(&line.movement_key(2))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn retried_sub_sequence_replays() {
        let fx = Fixture::new();
        let line = register(&fx, OrderKind::Purchase, 10).await;
        let fulfillment = fx.engine.fulfillment();

        let first = fulfillment
            .apply_receipt(&fx.actor, line.id, q(3), FulfillmentOptions::sequence(1))
            .await
            .unwrap();
        let retry = fulfillment
            .apply_receipt(&fx.actor, line.id, q(3), FulfillmentOptions::sequence(1))
            .await
            .unwrap();

        assert!(retry.is_replayed());
        assert_eq!(first.movement(), retry.movement());
        assert_eq!(fulfillment.order_line(line.id).await.unwrap().fulfilled, q(3));
    }

    #[tokio::test]
    async fn reused_sub_sequence_with_other_quantity_is_rejected() {
        let fx = Fixture::new();
        let line = register(&fx, OrderKind::Purchase, 10).await;
        let fulfillment = fx.engine.fulfillment();

        fulfillment
            .apply_receipt(&fx.actor, line.id, q(6), FulfillmentOptions::default())
            .await
            .unwrap();
        let err = fulfillment
            .apply_receipt(&fx.actor, line.id, q(4), FulfillmentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        assert_eq!(fulfillment.order_line(line.id).await.unwrap().fulfilled, q(6));
        let balance = fx.engine.projector().get_balance(fx.product, fx.location).await.unwrap();
        assert_eq!(balance.on_hand, q(6));
    }

    #[tokio::test]
    async fn delivery_can_consume_its_reservation() {
        let fx = Fixture::new();
        fx.engine
            .ledger()
            .append(&fx.actor, AppendMovement::inbound("GRN-1", fx.product, fx.location, q(10)))
            .await
            .unwrap();
        fx.engine
            .reservations()
            .reserve(&fx.actor, fx.product, fx.location, q(8))
            .await
            .unwrap();
        let line = register(&fx, OrderKind::Sale, 8).await;

        // Without consuming, the reserved 8 blocks a delivery of 5.
        let err = fx
            .engine
            .fulfillment()
            .apply_delivery(&fx.actor, line.id, q(5), FulfillmentOptions::sequence(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Stock(StockError::InsufficientStock { .. })));

        let outcome = fx
            .engine
            .fulfillment()
            .apply_delivery(
                &fx.actor,
                line.id,
                q(5),
                FulfillmentOptions::sequence(1).consuming_reservation(),
            )
            .await
            .unwrap();
        match outcome {
            FulfillmentOutcome::Applied { balance, released, .. } => {
                assert_eq!(released, q(5));
                assert_eq!(balance.on_hand, q(5));
                assert_eq!(balance.reserved, q(3));
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receipt_against_sales_line_is_rejected() {
        let fx = Fixture::new();
        let line = register(&fx, OrderKind::Sale, 3).await;
        let err = fx
            .engine
            .fulfillment()
            .apply_receipt(&fx.actor, line.id, q(1), FulfillmentOptions::sequence(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
