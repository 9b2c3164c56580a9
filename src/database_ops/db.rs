use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgExecutor, PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::database_ops::content::quote_ident;
use crate::util::env::{env_flag, is_transaction_pooler, redact_postgres_url};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database URL {}", redact_postgres_url(database_url)))?
            .application_name("thdb");

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        } else if is_transaction_pooler(database_url) {
            warn!("USE_PREPARED is on but the URL looks like a transaction pooler (:6543)");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(15))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .with_context(|| format!("connect to {}", redact_postgres_url(database_url)))?;
        info!(url = %redact_postgres_url(database_url), "connected to db");
        Ok(Self { pool })
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM information_schema.tables WHERE table_schema='public' AND table_name=$1",
        )
        .persistent(false)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(n > 0)
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM information_schema.columns WHERE table_schema='public' AND table_name=$1 AND column_name=$2",
        )
        .persistent(false)
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        Ok(n > 0)
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(table)?);
        let n: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count rows in {table}"))?;
        Ok(n)
    }

    /// Base tables in `public`, alphabetical.
    pub async fn list_public_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables WHERE table_schema='public' AND table_type='BASE TABLE' ORDER BY table_name",
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }
}

pub fn is_undefined_table_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

pub fn is_undefined_column_error(err: &sqlx::Error) -> bool {
    match err {
        // undefined_column
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42703"),
        _ => false,
    }
}

/// Missing-table / missing-column errors buried in an anyhow chain.
pub fn is_missing_schema(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<sqlx::Error>())
        .any(|e| is_undefined_table_error(e) || is_undefined_column_error(e))
}

/// PostGIS `geometry`/`geography` columns of a public table.
pub async fn spatial_columns<'e, E>(exec: E, table: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let cols: Vec<String> = sqlx::query_scalar(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema='public' AND table_name=$1 \
         AND data_type='USER-DEFINED' AND udt_name IN ('geometry', 'geography') \
         ORDER BY ordinal_position",
    )
    .persistent(false)
    .bind(table)
    .fetch_all(exec)
    .await
    .with_context(|| format!("list spatial columns of {table}"))?;
    Ok(cols)
}
