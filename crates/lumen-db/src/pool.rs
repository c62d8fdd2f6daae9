//! Opening the result store.
//!
//! [`open`] is the one entry point: it connects, optionally provisions the
//! database on first use, and brings the schema up to date.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::queries::results;

/// Migrations embedded at compile time from `crates/lumen-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// What [`open`] does when the configured database does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    /// Fail with the server's connection error.
    Existing,
    /// Create it through the `postgres` maintenance database.
    CreateMissing,
}

/// Schema and row summary reported after opening the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    /// Latest applied migration, `None` on an unmigrated database.
    pub schema_version: Option<i64>,
    pub stored_results: i64,
}

/// Connect to the result store and apply pending migrations.
pub async fn open(config: &DbConfig, provision: Provision) -> Result<PgPool> {
    if provision == Provision::CreateMissing {
        create_missing_database(config).await?;
    }
    let pool = connect(&config.database_url, 5).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply result store migrations")?;
    debug!(db = config.database_name().unwrap_or("?"), "result store ready");
    Ok(pool)
}

/// Report the applied schema version and how many results are stored.
pub async fn status(pool: &PgPool) -> Result<StoreStatus> {
    let schema_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(pool)
            .await
            .context("failed to read migration history")?;
    let stored_results = results::count_results(pool).await?;
    Ok(StoreStatus {
        schema_version,
        stored_results,
    })
}

async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to database at {url}"))
}

async fn create_missing_database(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;
    let db_name = plain_identifier(db_name)?;

    let maintenance = connect(&config.maintenance_url(), 1).await?;
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maintenance)
            .await
            .context("failed to query pg_database")?;

    if !exists {
        // CREATE DATABASE takes no bind parameters.
        maintenance
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "result store database created");
    }
    maintenance.close().await;
    Ok(())
}

/// Accept only names that are safe to splice into DDL unquoted.
fn plain_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let leading_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if leading_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(name)
    } else {
        anyhow::bail!("database name {name:?} must be a lowercase unquoted identifier")
    }
}
