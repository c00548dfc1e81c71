//! Infrastructure layer: ledger storage backends, the inventory engine and
//! configuration.

pub mod config;
pub mod engine;
pub mod error;
pub mod master_data;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{Backend, ConfigError, LedgerConfig, PostgresConfig, open_store};
pub use engine::{EngineContext, InventoryEngine};
pub use error::{LedgerError, LedgerResult};
pub use master_data::{LocationInfo, MasterData, ProductInfo, StaticMasterData};
pub use store::{
    CommitReceipt, InMemoryLedgerStore, LedgerStore, Page, PageLimits, Pagination,
    PostgresLedgerStore, UnitOfWork,
};
