//! Apply the embedded ledger migrations to `DATABASE_URL`.

use anyhow::{Context, bail};
use tracing::info;

use stockpile_infra::{Backend, LedgerConfig, PostgresLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockpile_observability::init();

    let config = LedgerConfig::from_env().context("loading ledger configuration")?;
    let pg = match (config.backend, config.postgres) {
        (Backend::Postgres, Some(pg)) => pg,
        _ => bail!("STOCKPILE_BACKEND must be 'postgres' to run migrations"),
    };

    let store = PostgresLedgerStore::connect(&pg.url, pg.max_connections)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;

    info!("ledger migrations applied");
    Ok(())
}
