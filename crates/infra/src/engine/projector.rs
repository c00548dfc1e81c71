//! Balance Projector read side.
//!
//! Balance rows are written only inside a store commit; this service reads
//! them, orders listings by master-data names and checks conservation.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use stockpile_core::Quantity;
use stockpile_inventory::{
    BalanceKey, LocationId, ProductId, StockBalance, fold_movements,
};

use super::EngineContext;
use crate::error::LedgerResult;
use crate::store::{BalanceFilter, LedgerStore, Page, Pagination};

/// One row of a balance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceListing {
    #[serde(flatten)]
    pub balance: StockBalance,
    pub available: Quantity,
    pub product_name: String,
    pub location_name: String,
}

/// Recorded on-hand versus the fold of the pair's movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAudit {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub recorded_on_hand: Quantity,
    pub ledger_on_hand: Quantity,
    pub movement_count: usize,
    pub consistent: bool,
}

pub struct BalanceProjector<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> BalanceProjector<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// A pair that never saw a movement reads as all zeros.
    pub async fn get_balance(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<StockBalance> {
        let key = BalanceKey::new(product_id, location_id);
        let balance = self.ctx.store.balance(key).await?;
        debug!(%product_id, %location_id, found = balance.is_some(), "balance read");
        Ok(balance.unwrap_or_else(|| StockBalance::empty(key)))
    }

    /// Sorted by product name, then location name.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_balances(
        &self,
        filter: BalanceFilter,
        page: Pagination,
    ) -> LedgerResult<Page<BalanceListing>> {
        let page = self.ctx.limits.clamp(page);
        let mut rows: Vec<BalanceListing> = self
            .ctx
            .store
            .balances(&filter)
            .await?
            .into_iter()
            .map(|balance| {
                let product_name = self
                    .ctx
                    .master_data
                    .product(balance.product_id)
                    .map(|p| p.name)
                    .unwrap_or_default();
                let location_name = self
                    .ctx
                    .master_data
                    .location(balance.location_id)
                    .map(|l| l.name)
                    .unwrap_or_default();
                BalanceListing {
                    available: balance.available(),
                    balance,
                    product_name,
                    location_name,
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            a.product_name
                .cmp(&b.product_name)
                .then_with(|| a.location_name.cmp(&b.location_name))
                .then_with(|| a.balance.key().cmp(&b.balance.key()))
        });
        Ok(page.apply(rows))
    }

    /// Conservation check for one pair. Only meaningful while no writer is
    /// touching the pair.
    pub async fn audit_balance(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> LedgerResult<BalanceAudit> {
        let key = BalanceKey::new(product_id, location_id);
        let history = self.ctx.store.pair_history(key).await?;
        let recorded_on_hand = self
            .ctx
            .store
            .balance(key)
            .await?
            .map(|b| b.on_hand)
            .unwrap_or(Quantity::ZERO);
        let ledger_on_hand = fold_movements(&history);
        let consistent = recorded_on_hand == ledger_on_hand;
        if !consistent {
            warn!(
                %product_id,
                %location_id,
                recorded = %recorded_on_hand,
                ledger = %ledger_on_hand,
                "balance disagrees with movement history"
            );
        }

        Ok(BalanceAudit {
            product_id,
            location_id,
            recorded_on_hand,
            ledger_on_hand,
            movement_count: history.len(),
            consistent,
        })
    }
}
