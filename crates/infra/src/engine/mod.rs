//! Inventory engine: the operations surrounding layers call.
//!
//! Each component is a thin service over a shared [`EngineContext`]. Services
//! check the caller's pre-resolved capability, validate references against
//! master data, build one [`UnitOfWork`](crate::store::UnitOfWork) per logical
//! operation and hand it to the [`LedgerStore`]. None of them mutate balances,
//! counters or adjustment headers directly.
//!
//! ```text
//! InventoryEngine
//!   ├── ledger()        append / append_or_get / transfer
//!   ├── projector()     get_balance / list_balances / audit_balance
//!   ├── reservations()  reserve / release
//!   ├── fulfillment()   register_line / apply_receipt / apply_delivery
//!   ├── adjustments()   create / add_line / ... / confirm
//!   └── queries()       list_movements / summarize / stock_aging
//! ```

pub mod adjustments;
pub mod fulfillment;
pub mod ledger;
pub mod projector;
pub mod queries;
pub mod reservations;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use stockpile_core::{Actor, Capability, Clock, Quantity, Resource, SystemClock};
use stockpile_inventory::{BalanceKey, LocationId, ProductId, StockMovement};

use crate::config::{LedgerConfig, open_store};
use crate::error::{LedgerError, LedgerResult};
use crate::master_data::{LocationInfo, MasterData, ProductInfo};
use crate::store::{CommitReceipt, LedgerStore, PageLimits};

pub use adjustments::{AdjustmentService, ConfirmedAdjustment};
pub use fulfillment::{
    FulfillmentOptions, FulfillmentOutcome, FulfillmentService, RegisterOrderLine,
};
pub use ledger::{AppendMovement, AppendOutcome, LedgerService, Transfer, TransferReceipt};
pub use projector::{BalanceAudit, BalanceListing, BalanceProjector};
pub use queries::{QueryService, StockAging};
pub use reservations::{ReleaseOutcome, ReservationService};

/// Collaborators shared by every engine component.
pub struct EngineContext<S: ?Sized> {
    store: Arc<S>,
    master_data: Arc<dyn MasterData>,
    clock: Arc<dyn Clock>,
    limits: PageLimits,
}

impl<S: ?Sized> Clone for EngineContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            master_data: Arc::clone(&self.master_data),
            clock: Arc::clone(&self.clock),
            limits: self.limits,
        }
    }
}

impl<S> EngineContext<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn product(&self, id: ProductId) -> LedgerResult<ProductInfo> {
        self.master_data
            .product(id)
            .ok_or(LedgerError::UnknownProduct(id))
    }

    fn location(&self, id: LocationId) -> LedgerResult<LocationInfo> {
        self.master_data
            .location(id)
            .ok_or(LedgerError::UnknownLocation(id))
    }

    fn ensure_pair(&self, key: BalanceKey) -> LedgerResult<()> {
        self.product(key.product_id)?;
        self.location(key.location_id)?;
        Ok(())
    }
}

fn authorize(actor: &Actor, resource: Resource, capability: Capability) -> LedgerResult<()> {
    actor.require(resource, capability).map_err(LedgerError::from)
}

fn ensure_positive(quantity: Quantity, what: &str) -> LedgerResult<()> {
    if quantity.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::validation(format!(
            "{what} quantity must be positive, got {quantity}"
        )))
    }
}

/// Warn about reservations an unchecked decrease cut back.
fn report_truncations(receipt: &CommitReceipt) {
    for (key, quantity) in &receipt.truncated_reservations {
        tracing::warn!(
            product_id = %key.product_id,
            location_id = %key.location_id,
            truncated = %quantity,
            "reservation truncated by unchecked decrease"
        );
    }
}

fn first_movement(receipt: &CommitReceipt) -> LedgerResult<StockMovement> {
    receipt
        .movements
        .first()
        .cloned()
        .ok_or_else(|| LedgerError::storage("commit receipt carries no movement"))
}

/// Entry point bundling the six engine components over one store.
pub struct InventoryEngine<S: ?Sized = dyn LedgerStore> {
    ctx: EngineContext<S>,
}

impl<S: ?Sized> Clone for InventoryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S> InventoryEngine<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(store: Arc<S>, master_data: Arc<dyn MasterData>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ctx: EngineContext {
                store,
                master_data,
                clock,
                limits: PageLimits::default(),
            },
        }
    }

    pub fn with_page_limits(mut self, limits: PageLimits) -> Self {
        self.ctx.limits = limits;
        self
    }

    pub fn context(&self) -> &EngineContext<S> {
        &self.ctx
    }

    pub fn ledger(&self) -> LedgerService<S> {
        LedgerService::new(self.ctx.clone())
    }

    pub fn projector(&self) -> BalanceProjector<S> {
        BalanceProjector::new(self.ctx.clone())
    }

    pub fn reservations(&self) -> ReservationService<S> {
        ReservationService::new(self.ctx.clone())
    }

    pub fn fulfillment(&self) -> FulfillmentService<S> {
        FulfillmentService::new(self.ctx.clone())
    }

    pub fn adjustments(&self) -> AdjustmentService<S> {
        AdjustmentService::new(self.ctx.clone())
    }

    pub fn queries(&self) -> QueryService<S> {
        QueryService::new(self.ctx.clone())
    }
}

impl InventoryEngine {
    /// Open the configured backend with the wall clock.
    pub async fn from_config(
        config: &LedgerConfig,
        master_data: Arc<dyn MasterData>,
    ) -> LedgerResult<Self> {
        let store = open_store(config).await?;
        Ok(Self::new(store, master_data, Arc::new(SystemClock)).with_page_limits(config.page_limits))
    }
}
