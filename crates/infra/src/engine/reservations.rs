//! Reservation Manager: soft claims against available quantity.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockpile_core::{Actor, Capability, Quantity, Resource};
use stockpile_inventory::{BalanceKey, LocationId, ProductId, Release, StockBalance};

use super::{EngineContext, authorize, ensure_positive};
use crate::error::LedgerResult;
use crate::store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub balance: StockBalance,
    pub release: Release,
}

pub struct ReservationService<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> ReservationService<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Atomic `reserved += qty` guarded by `reserved + qty <= on_hand`.
    #[instrument(skip(self, actor), fields(%product_id, %location_id, %quantity), err)]
    pub async fn reserve(
        &self,
        actor: &Actor,
        product_id: ProductId,
        location_id: LocationId,
        quantity: Quantity,
    ) -> LedgerResult<StockBalance> {
        authorize(actor, Resource::Reservations, Capability::Create)?;
        ensure_positive(quantity, "reservation")?;
        let key = BalanceKey::new(product_id, location_id);
        self.ctx.ensure_pair(key)?;

        let balance = self.ctx.store.reserve(key, quantity, self.ctx.now()).await?;
        info!(
            reserved = %balance.reserved,
            available = %balance.available(),
            "reservation placed"
        );
        Ok(balance)
    }

    /// `reserved -= qty`, floored at zero.
    ///
    /// Releasing more than is reserved is reported as an over-release warning
    /// and clamped; it does not fail.
    #[instrument(skip(self, actor), fields(%product_id, %location_id, %quantity), err)]
    pub async fn release(
        &self,
        actor: &Actor,
        product_id: ProductId,
        location_id: LocationId,
        quantity: Quantity,
    ) -> LedgerResult<ReleaseOutcome> {
        authorize(actor, Resource::Reservations, Capability::Update)?;
        ensure_positive(quantity, "release")?;
        let key = BalanceKey::new(product_id, location_id);

        let (balance, release) = self.ctx.store.release(key, quantity, self.ctx.now()).await?;
        if let Some(err) = balance.over_release_error(&release) {
            warn!(error = %err, clamped_to = %release.released, "over-release clamped");
        } else {
            info!(reserved = %balance.reserved, "reservation released");
        }
        Ok(ReleaseOutcome { balance, release })
    }
}
