//! Shared fixture for engine unit tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use stockpile_core::{Actor, Clock, FixedClock, Quantity, UserId};
use stockpile_inventory::{LocationId, ProductId};

use super::InventoryEngine;
use crate::master_data::StaticMasterData;
use crate::store::InMemoryLedgerStore;

pub(crate) fn q(v: i64) -> Quantity {
    Quantity::from_i64(v)
}

pub(crate) struct Fixture {
    pub engine: InventoryEngine<InMemoryLedgerStore>,
    pub clock: Arc<FixedClock>,
    pub actor: Actor,
    /// "Widgets"
    pub product: ProductId,
    /// "Bolts"
    pub other_product: ProductId,
    /// "Main"
    pub location: LocationId,
    /// "Annex"
    pub other_location: LocationId,
}

impl Fixture {
    pub fn new() -> Self {
        let product = ProductId::generate();
        let other_product = ProductId::generate();
        let location = LocationId::generate();
        let other_location = LocationId::generate();
        let master_data = StaticMasterData::new()
            .with_product(product, "Widgets")
            .with_product(other_product, "Bolts")
            .with_location(location, "Main")
            .with_location(other_location, "Annex");

        let start: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let engine = InventoryEngine::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(master_data),
            clock.clone(),
        );

        Self {
            engine,
            clock,
            actor: Actor::system(UserId::new()),
            product,
            other_product,
            location,
            other_location,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
