//! Inventory identifiers (wrappers around [`AggregateId`]).

use serde::{Deserialize, Serialize};

use stockpile_core::AggregateId;

macro_rules! aggregate_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub AggregateId);

        impl $name {
            pub fn new(id: AggregateId) -> Self {
                Self(id)
            }

            /// Fresh time-ordered identifier.
            pub fn generate() -> Self {
                Self(AggregateId::new())
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                self.0.as_uuid()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(value: uuid::Uuid) -> Self {
                Self(AggregateId::from_uuid(value))
            }
        }
    };
}

aggregate_newtype!(
    /// Product reference (master data lives outside the ledger).
    ProductId
);
aggregate_newtype!(
    /// Stock location reference (warehouse, bin, store).
    LocationId
);
aggregate_newtype!(MovementId);
aggregate_newtype!(AdjustmentId);
aggregate_newtype!(AdjustmentLineId);
aggregate_newtype!(
    /// Purchase-order or sales-order line carrying a fulfillment counter.
    OrderLineId
);
