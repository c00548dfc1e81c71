//! Ledger configuration loaded from environment variables.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::LedgerResult;
use crate::store::{InMemoryLedgerStore, LedgerStore, PageLimits, PostgresLedgerStore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set when STOCKPILE_BACKEND=postgres")]
    Missing { name: &'static str },

    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    /// Apply embedded migrations when the store is opened.
    pub run_migrations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub backend: Backend,
    /// Present iff `backend` is `Postgres`.
    pub postgres: Option<PostgresConfig>,
    pub page_limits: PageLimits,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            postgres: None,
            page_limits: PageLimits::default(),
        }
    }
}

impl LedgerConfig {
    /// Load from the process environment.
    ///
    /// - `STOCKPILE_BACKEND`: `memory` (default) or `postgres`
    /// - `DATABASE_URL`: required for `postgres`
    /// - `STOCKPILE_DB_MAX_CONNECTIONS`: default 10
    /// - `STOCKPILE_RUN_MIGRATIONS`: default `true`
    /// - `STOCKPILE_PAGE_SIZE_DEFAULT` / `STOCKPILE_PAGE_SIZE_MAX`: default 50 / 1000
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match lookup("STOCKPILE_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => Backend::Memory,
            Some("postgres") => Backend::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STOCKPILE_BACKEND",
                    value: other.to_string(),
                    reason: "expected 'memory' or 'postgres'".to_string(),
                });
            }
        };

        let defaults = PageLimits::default();
        let page_limits = PageLimits {
            default_limit: parse_or(&lookup, "STOCKPILE_PAGE_SIZE_DEFAULT", defaults.default_limit)?,
            max_limit: parse_or(&lookup, "STOCKPILE_PAGE_SIZE_MAX", defaults.max_limit)?,
        };
        if page_limits.default_limit == 0 || page_limits.default_limit > page_limits.max_limit {
            return Err(ConfigError::Invalid {
                name: "STOCKPILE_PAGE_SIZE_DEFAULT",
                value: page_limits.default_limit.to_string(),
                reason: format!("must be between 1 and {}", page_limits.max_limit),
            });
        }

        let postgres = match backend {
            Backend::Memory => None,
            Backend::Postgres => Some(PostgresConfig {
                url: lookup("DATABASE_URL")
                    .filter(|v| !v.trim().is_empty())
                    .ok_or(ConfigError::Missing {
                        name: "DATABASE_URL",
                    })?,
                max_connections: parse_or(&lookup, "STOCKPILE_DB_MAX_CONNECTIONS", 10)?,
                run_migrations: parse_bool_or(&lookup, "STOCKPILE_RUN_MIGRATIONS", true)?,
            }),
        };

        Ok(Self {
            backend,
            postgres,
            page_limits,
        })
    }
}

/// Build the configured backend.
pub async fn open_store(config: &LedgerConfig) -> LedgerResult<Arc<dyn LedgerStore>> {
    match (&config.backend, &config.postgres) {
        (Backend::Postgres, Some(pg)) => {
            let store = PostgresLedgerStore::connect(&pg.url, pg.max_connections).await?;
            if pg.run_migrations {
                store.migrate().await?;
            }
            info!(max_connections = pg.max_connections, "opened postgres ledger store");
            Ok(Arc::new(store))
        }
        _ => {
            info!("opened in-memory ledger store");
            Ok(Arc::new(InMemoryLedgerStore::new()))
        }
    }
}

fn parse_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
