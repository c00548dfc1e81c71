//! Ledger Store front door: movement appends, idempotent replays and transfers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stockpile_core::{Actor, Capability, Quantity, Resource};
use stockpile_inventory::{
    BalanceKey, Direction, FloorPolicy, LocationId, MovementDraft, MovementId, MovementKind,
    MovementReference, ProductId, ReferenceType, StockBalance, StockMovement,
};

use super::{EngineContext, authorize, first_movement, report_truncations};
use crate::error::{LedgerError, LedgerResult};
use crate::store::{LedgerStore, UnitOfWork};

/// A caller's request to post one movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendMovement {
    /// Idempotency key ("movement number").
    pub movement_key: String,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub kind: MovementKind,
    pub direction: Direction,
    pub quantity: Quantity,
    pub reference: Option<MovementReference>,
    /// Defaults to the engine clock.
    pub effective_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub floor: FloorPolicy,
}

impl AppendMovement {
    pub fn new(
        movement_key: impl Into<String>,
        product_id: ProductId,
        location_id: LocationId,
        kind: MovementKind,
        direction: Direction,
        quantity: Quantity,
    ) -> Self {
        Self {
            movement_key: movement_key.into(),
            product_id,
            location_id,
            kind,
            direction,
            quantity,
            reference: None,
            effective_at: None,
            note: None,
            floor: FloorPolicy::Enforced,
        }
    }

    pub fn inbound(
        movement_key: impl Into<String>,
        product_id: ProductId,
        location_id: LocationId,
        quantity: Quantity,
    ) -> Self {
        Self::new(
            movement_key,
            product_id,
            location_id,
            MovementKind::In,
            Direction::Increase,
            quantity,
        )
    }

    pub fn outbound(
        movement_key: impl Into<String>,
        product_id: ProductId,
        location_id: LocationId,
        quantity: Quantity,
    ) -> Self {
        Self::new(
            movement_key,
            product_id,
            location_id,
            MovementKind::Out,
            Direction::Decrease,
            quantity,
        )
    }

    pub fn at(mut self, effective_at: DateTime<Utc>) -> Self {
        self.effective_at = Some(effective_at);
        self
    }

    pub fn with_reference(mut self, reference: MovementReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Skip the stock floor. Only accepted for `adjustment` movements.
    pub fn unchecked(mut self) -> Self {
        self.floor = FloorPolicy::Unchecked;
        self
    }

    fn balance_key(&self) -> BalanceKey {
        BalanceKey::new(self.product_id, self.location_id)
    }

    fn into_draft(self, actor: &Actor, now: DateTime<Utc>) -> MovementDraft {
        let mut draft = MovementDraft::new(
            self.movement_key,
            self.product_id,
            self.location_id,
            self.kind,
            self.direction,
            self.quantity,
            self.effective_at.unwrap_or(now),
            actor.user_id(),
        );
        draft.reference = self.reference;
        draft.note = self.note;
        draft.floor = self.floor;
        draft
    }

    /// Whether `existing` is what this request would have produced.
    fn same_payload(&self, existing: &StockMovement) -> bool {
        existing.product_id == self.product_id
            && existing.location_id == self.location_id
            && existing.kind == self.kind
            && existing.direction == self.direction
            && existing.quantity == self.quantity
            && existing.reference == self.reference
    }
}

/// Result of an idempotent append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Committed by this call.
    Fresh(StockMovement),
    /// The key was already committed; nothing was written.
    Replayed(StockMovement),
}

impl AppendOutcome {
    pub fn movement(&self) -> &StockMovement {
        match self {
            AppendOutcome::Fresh(m) | AppendOutcome::Replayed(m) => m,
        }
    }

    pub fn into_movement(self) -> StockMovement {
        match self {
            AppendOutcome::Fresh(m) | AppendOutcome::Replayed(m) => m,
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, AppendOutcome::Replayed(_))
    }
}

/// Move stock between two locations in one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Base key; the two legs use `<key>:out` and `<key>:in`.
    pub movement_key: String,
    pub product_id: ProductId,
    pub from: LocationId,
    pub to: LocationId,
    pub quantity: Quantity,
    pub effective_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: Uuid,
    pub outbound: StockMovement,
    pub inbound: StockMovement,
    pub from_balance: StockBalance,
    pub to_balance: StockBalance,
}

pub struct LedgerService<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> LedgerService<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Append one movement and apply its delta to the pair's balance.
    ///
    /// A reused key fails with `DuplicateMovement` carrying the committed
    /// movement; see [`append_or_get`](Self::append_or_get).
    #[instrument(
        skip(self, actor, request),
        fields(
            movement_key = %request.movement_key,
            product_id = %request.product_id,
            location_id = %request.location_id,
            kind = request.kind.as_str(),
        ),
        err
    )]
    pub async fn append(&self, actor: &Actor, request: AppendMovement) -> LedgerResult<StockMovement> {
        authorize(actor, Resource::Movements, Capability::Create)?;
        self.ctx.ensure_pair(request.balance_key())?;

        let now = self.ctx.now();
        let key = request.balance_key();
        let work = UnitOfWork::new(now).movement(request.into_draft(actor, now));

        let receipt = match self.ctx.store.commit(work).await {
            Ok(receipt) => receipt,
            Err(LedgerError::DuplicateMovement { key, existing }) => {
                warn!(sequence = existing.sequence, "movement key already committed");
                return Err(LedgerError::DuplicateMovement { key, existing });
            }
            Err(err) => return Err(err),
        };
        report_truncations(&receipt);

        let movement = first_movement(&receipt)?;
        if let Some(balance) = receipt.balance(key) {
            info!(
                sequence = movement.sequence,
                quantity = %movement.quantity,
                on_hand = %balance.on_hand,
                reserved = %balance.reserved,
                "movement committed"
            );
        }
        Ok(movement)
    }

    /// Append, treating an already-committed key as success.
    ///
    /// A key reused for a different product, location, kind, direction,
    /// quantity or reference is rejected instead of replayed.
    pub async fn append_or_get(
        &self,
        actor: &Actor,
        request: AppendMovement,
    ) -> LedgerResult<AppendOutcome> {
        let original = request.clone();
        match self.append(actor, request).await {
            Ok(movement) => Ok(AppendOutcome::Fresh(movement)),
            Err(LedgerError::DuplicateMovement { key, existing }) => {
                if original.same_payload(&existing) {
                    Ok(AppendOutcome::Replayed(*existing))
                } else {
                    Err(LedgerError::validation(format!(
                        "movement key '{key}' was already used for a different movement"
                    )))
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Floor-checked decrease at `from` and increase at `to`, atomically.
    #[instrument(
        skip(self, actor, request),
        fields(
            movement_key = %request.movement_key,
            product_id = %request.product_id,
            from = %request.from,
            to = %request.to,
        ),
        err
    )]
    pub async fn transfer(&self, actor: &Actor, request: Transfer) -> LedgerResult<TransferReceipt> {
        authorize(actor, Resource::Movements, Capability::Create)?;
        if request.from == request.to {
            return Err(LedgerError::validation(
                "transfer source and destination must differ",
            ));
        }
        self.ctx.product(request.product_id)?;
        self.ctx.location(request.from)?;
        self.ctx.location(request.to)?;

        let now = self.ctx.now();
        let transfer_id = Uuid::now_v7();
        let reference = MovementReference::new(ReferenceType::Transfer, transfer_id);
        let effective_at = request.effective_at.unwrap_or(now);

        let leg = |suffix: &str, location: LocationId, direction: Direction| {
            let mut draft = MovementDraft::new(
                format!("{}:{suffix}", request.movement_key),
                request.product_id,
                location,
                MovementKind::Transfer,
                direction,
                request.quantity,
                effective_at,
                actor.user_id(),
            )
            .with_reference(reference);
            draft.note = request.note.clone();
            draft
        };

        let work = UnitOfWork::new(now)
            .movement(leg("out", request.from, Direction::Decrease))
            .movement(leg("in", request.to, Direction::Increase));

        let receipt = self.ctx.store.commit(work).await?;
        report_truncations(&receipt);

        let (outbound, inbound) = match receipt.movements.as_slice() {
            [outbound, inbound] => (outbound.clone(), inbound.clone()),
            _ => return Err(LedgerError::storage("transfer receipt must carry two movements")),
        };
        let balance_of = |location: LocationId| {
            receipt
                .balance(BalanceKey::new(request.product_id, location))
                .cloned()
                .ok_or_else(|| LedgerError::storage("transfer receipt is missing a balance"))
        };
        let from_balance = balance_of(request.from)?;
        let to_balance = balance_of(request.to)?;

        info!(
            %transfer_id,
            quantity = %request.quantity,
            from_on_hand = %from_balance.on_hand,
            to_on_hand = %to_balance.on_hand,
            "transfer committed"
        );

        Ok(TransferReceipt {
            transfer_id,
            outbound,
            inbound,
            from_balance,
            to_balance,
        })
    }

    pub async fn movement(&self, id: MovementId) -> LedgerResult<StockMovement> {
        self.ctx
            .store
            .movement(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("movement {id}")))
    }

    pub async fn movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        self.ctx.store.movement_by_key(movement_key).await
    }
}
