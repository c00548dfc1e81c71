//! Master-data collaborator: product and location existence and display names.
//!
//! The ledger never owns master data. It asks this trait whether a reference
//! exists before writing, and uses the names to order balance listings.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use stockpile_inventory::{LocationId, ProductId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: ProductId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: LocationId,
    pub name: String,
}

pub trait MasterData: Send + Sync {
    fn product(&self, id: ProductId) -> Option<ProductInfo>;

    fn location(&self, id: LocationId) -> Option<LocationInfo>;
}

/// In-memory master data (tests, single-process deployments, seeding).
#[derive(Debug, Default)]
pub struct StaticMasterData {
    products: RwLock<HashMap<ProductId, ProductInfo>>,
    locations: RwLock<HashMap<LocationId, LocationInfo>>,
}

impl StaticMasterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, id: ProductId, name: impl Into<String>) {
        if let Ok(mut products) = self.products.write() {
            products.insert(
                id,
                ProductInfo {
                    id,
                    name: name.into(),
                },
            );
        }
    }

    pub fn add_location(&self, id: LocationId, name: impl Into<String>) {
        if let Ok(mut locations) = self.locations.write() {
            locations.insert(
                id,
                LocationInfo {
                    id,
                    name: name.into(),
                },
            );
        }
    }

    /// Builder form of [`Self::add_product`].
    pub fn with_product(self, id: ProductId, name: impl Into<String>) -> Self {
        self.add_product(id, name);
        self
    }

    pub fn with_location(self, id: LocationId, name: impl Into<String>) -> Self {
        self.add_location(id, name);
        self
    }
}

impl MasterData for StaticMasterData {
    fn product(&self, id: ProductId) -> Option<ProductInfo> {
        self.products.read().ok()?.get(&id).cloned()
    }

    fn location(&self, id: LocationId) -> Option<LocationInfo> {
        self.locations.read().ok()?.get(&id).cloned()
    }
}
