//! Query Surface: movement history, rollups and stock aging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stockpile_core::Quantity;
use stockpile_inventory::{
    AgingBucket, BalanceKey, DEFAULT_AGING_BOUNDARIES, FifoLayer, LocationId, MovementId,
    ProductId, StockMovement, age_buckets, fifo_layers,
};

use super::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{LedgerStore, MovementFilter, MovementSummary, Page, Pagination};

/// On-hand of one pair split by age of the receipts that supplied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAging {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub as_of: DateTime<Utc>,
    /// Sum of the layers; zero while the pair is in deficit.
    pub on_hand: Quantity,
    pub buckets: Vec<AgingBucket>,
    /// Oldest first.
    pub layers: Vec<FifoLayer>,
}

pub struct QueryService<S: ?Sized> {
    ctx: EngineContext<S>,
}

impl<S> QueryService<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Newest first: effective time desc, then commit order desc.
    pub async fn list_movements(
        &self,
        filter: MovementFilter,
        page: Pagination,
    ) -> LedgerResult<Page<StockMovement>> {
        check_range(&filter)?;
        let page = self.ctx.limits.clamp(page);
        let result = self.ctx.store.movements(&filter, page).await?;
        debug!(total = result.total, returned = result.items.len(), "movements listed");
        Ok(result)
    }

    pub async fn summarize_movements(&self, filter: MovementFilter) -> LedgerResult<MovementSummary> {
        check_range(&filter)?;
        self.ctx.store.summarize(&filter).await
    }

    pub async fn get_movement(&self, id: MovementId) -> LedgerResult<StockMovement> {
        self.ctx
            .store
            .movement(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("movement {id}")))
    }

    pub async fn find_movement_by_key(&self, movement_key: &str) -> LedgerResult<Option<StockMovement>> {
        self.ctx.store.movement_by_key(movement_key).await
    }

    /// FIFO aging of the pair's stock at `as_of` (default: now).
    ///
    /// `boundaries` are bucket upper bounds in days (default 30/60/90).
    pub async fn stock_aging(
        &self,
        product_id: ProductId,
        location_id: LocationId,
        as_of: Option<DateTime<Utc>>,
        boundaries: Option<&[u32]>,
    ) -> LedgerResult<StockAging> {
        let as_of = as_of.unwrap_or_else(|| self.ctx.now());
        let history: Vec<StockMovement> = self
            .ctx
            .store
            .pair_history(BalanceKey::new(product_id, location_id))
            .await?
            .into_iter()
            .filter(|m| m.effective_at <= as_of)
            .collect();

        let layers = fifo_layers(&history);
        let buckets = age_buckets(&layers, as_of, boundaries.unwrap_or(&DEFAULT_AGING_BOUNDARIES))?;
        let on_hand: Quantity = layers.iter().map(|l| l.quantity).sum();
        debug!(%product_id, %location_id, layers = layers.len(), "stock aging computed");

        Ok(StockAging {
            product_id,
            location_id,
            as_of,
            on_hand,
            buckets,
            layers,
        })
    }
}

fn check_range(filter: &MovementFilter) -> LedgerResult<()> {
    match (filter.date_from, filter.date_to) {
        (Some(from), Some(to)) if from > to => Err(LedgerError::validation(format!(
            "date range is inverted: {from} is after {to}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AppendMovement;
    use crate::engine::test_support::{Fixture, q};
    use chrono::Duration;
    use stockpile_inventory::MovementKind;

    #[tokio::test]
    async fn listing_is_newest_first_and_paged() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        let base = fx.clock_now();
        for i in 0..5 {
            ledger
                .append(
                    &fx.actor,
                    AppendMovement::inbound(format!("L-{i}"), fx.product, fx.location, q(1))
                        .at(base + Duration::hours(i)),
                )
                .await
                .unwrap();
        }

        let page = fx
            .engine
            .queries()
            .list_movements(
                MovementFilter::for_pair(fx.product, fx.location),
                Pagination::new(Some(2), Some(1)),
            )
            .await
            .unwrap();
        let keys: Vec<&str> = page.items.iter().map(|m| m.movement_key.as_str()).collect();
        assert_eq!(keys, vec!["L-3", "L-2"]);
        assert_eq!(page.total, 5);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn summary_nets_increases_and_decreases() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        ledger
            .append(&fx.actor, AppendMovement::inbound("S-1", fx.product, fx.location, q(9)))
            .await
            .unwrap();
        ledger
            .append(&fx.actor, AppendMovement::outbound("S-2", fx.product, fx.location, q(4)))
            .await
            .unwrap();

        let summary = fx
            .engine
            .queries()
            .summarize_movements(MovementFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.movement_count, 2);
        assert_eq!(summary.net(), q(5));
        assert_eq!(summary.by_kind.get(MovementKind::Out.as_str()), Some(&q(-4)));
    }

    #[tokio::test]
    async fn summary_of_largest_quantities_across_pairs() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        let largest: Quantity = "99999999999999999999".parse().unwrap();
        ledger
            .append(&fx.actor, AppendMovement::inbound("B-1", fx.product, fx.location, largest))
            .await
            .unwrap();
        ledger
            .append(
                &fx.actor,
                AppendMovement::inbound("B-2", fx.other_product, fx.other_location, largest),
            )
            .await
            .unwrap();

        let summary = fx
            .engine
            .queries()
            .summarize_movements(MovementFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.movement_count, 2);
        assert_eq!(summary.total_increase, largest + largest);
    }

    #[tokio::test]
    async fn aging_rejects_unbounded_boundary() {
        let fx = Fixture::new();
        let err = fx
            .engine
            .queries()
            .stock_aging(fx.product, fx.location, None, Some(&[u32::MAX]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn inverted_date_range_is_rejected() {
        let fx = Fixture::new();
        let now = fx.clock_now();
        let err = fx
            .engine
            .queries()
            .list_movements(
                MovementFilter {
                    date_from: Some(now),
                    date_to: Some(now - Duration::days(1)),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn aging_consumes_oldest_receipts_first() {
        let fx = Fixture::new();
        let ledger = fx.engine.ledger();
        let now = fx.clock_now();
        ledger
            .append(
                &fx.actor,
                AppendMovement::inbound("AG-1", fx.product, fx.location, q(10))
                    .at(now - Duration::days(100)),
            )
            .await
            .unwrap();
        ledger
            .append(
                &fx.actor,
                AppendMovement::inbound("AG-2", fx.product, fx.location, q(5))
                    .at(now - Duration::days(10)),
            )
            .await
            .unwrap();
        ledger
            .append(
                &fx.actor,
                AppendMovement::outbound("AG-3", fx.product, fx.location, q(4))
                    .at(now - Duration::days(5)),
            )
            .await
            .unwrap();

        let aging = fx
            .engine
            .queries()
            .stock_aging(fx.product, fx.location, None, None)
            .await
            .unwrap();
        assert_eq!(aging.on_hand, q(11));
        let by_label: Vec<(&str, Quantity)> = aging
            .buckets
            .iter()
            .map(|b| (b.label.as_str(), b.quantity))
            .collect();
        assert_eq!(
            by_label,
            vec![
                ("0-30", q(5)),
                ("31-60", Quantity::ZERO),
                ("61-90", Quantity::ZERO),
                ("90+", q(6)),
            ]
        );
    }

    #[tokio::test]
    async fn missing_movement_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .engine
            .queries()
            .get_movement(MovementId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
