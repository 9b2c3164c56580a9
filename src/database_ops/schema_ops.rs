//! Schema operations: TMB table creation, and drops that ask before running.
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::database_ops::content::quote_ident;
use crate::database_ops::db::Db;
use crate::util::prompt;

/// TMB tables, link table first.
pub const DEFAULT_TMB_DROP: &[&str] = &["tmbaccommodations_stage_lnk", "tmbaccommodations", "tmb_stages"];

/// DDL for the TMB tables in creation order (parents before the link table).
/// `tmb_stages.document_id` is not unique: draft and published rows share it.
pub const TMB_TABLE_DDL: &[(&str, &str)] = &[
    (
        "tmb_stages",
        "CREATE TABLE IF NOT EXISTS tmb_stages (
            id SERIAL PRIMARY KEY,
            document_id VARCHAR(255),
            name VARCHAR(255),
            stage_number INTEGER,
            start_location VARCHAR(255),
            end_location VARCHAR(255),
            distance_km DECIMAL(10,2),
            elevation_gain DECIMAL(10,2),
            elevation_loss DECIMAL(10,2),
            difficulty VARCHAR(50),
            description JSONB,
            estimated_time VARCHAR(255),
            created_at TIMESTAMP DEFAULT NOW(),
            updated_at TIMESTAMP DEFAULT NOW(),
            published_at TIMESTAMP,
            created_by_id INTEGER,
            updated_by_id INTEGER,
            locale VARCHAR(10)
        )",
    ),
    (
        "tmbaccommodations",
        "CREATE TABLE IF NOT EXISTS tmbaccommodations (
            id SERIAL PRIMARY KEY,
            document_id VARCHAR(255),
            name VARCHAR(255),
            type VARCHAR(50),
            location_type VARCHAR(50),
            latitude DOUBLE PRECISION,
            longitude DOUBLE PRECISION,
            website VARCHAR(500),
            phone VARCHAR(50),
            email VARCHAR(255),
            price_range VARCHAR(100),
            capacity INTEGER,
            altitude INTEGER,
            notes TEXT,
            booking_method VARCHAR(100),
            description TEXT,
            booking_difficulty VARCHAR(50),
            created_at TIMESTAMP DEFAULT NOW(),
            updated_at TIMESTAMP DEFAULT NOW(),
            published_at TIMESTAMP,
            created_by_id INTEGER,
            updated_by_id INTEGER,
            locale VARCHAR(10)
        )",
    ),
    (
        "tmbaccommodations_stage_lnk",
        "CREATE TABLE IF NOT EXISTS tmbaccommodations_stage_lnk (
            id SERIAL PRIMARY KEY,
            tmbaccommodation_id INTEGER REFERENCES tmbaccommodations(id) ON DELETE CASCADE,
            tmb_stage_id INTEGER REFERENCES tmb_stages(id) ON DELETE CASCADE,
            tmbaccommodation_ord DOUBLE PRECISION,
            UNIQUE (tmbaccommodation_id, tmb_stage_id)
        )",
    ),
];

#[derive(Debug, Clone, Default)]
pub struct CreateReport {
    /// Tables that did not exist before the run.
    pub created: Vec<String>,
    pub already_present: Vec<String>,
}

/// Create the TMB tables that are missing, in one transaction. Existing
/// tables are left untouched.
pub async fn create_tmb_tables(db: &Db) -> Result<CreateReport> {
    let mut report = CreateReport::default();
    let mut tx = db.pool.begin().await?;
    for (table, ddl) in TMB_TABLE_DDL {
        let existed: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .persistent(false)
            .bind(format!("public.{table}"))
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(ddl)
            .persistent(false)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("create {table}"))?;
        if existed {
            report.already_present.push(table.to_string());
        } else {
            info!(%table, "created");
            report.created.push(table.to_string());
        }
    }
    tx.commit().await?;
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct DropReport {
    pub dropped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub applied: bool,
}

pub fn drop_statement(table: &str) -> Result<String> {
    Ok(format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(table)?))
}

/// Split `tables` into runnable drop statements and names that cannot be
/// quoted, keeping input order.
pub fn partition_drops(tables: &[String]) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let mut ok = Vec::new();
    let mut invalid = Vec::new();
    for table in tables {
        match drop_statement(table) {
            Ok(sql) => ok.push((table.clone(), sql)),
            Err(e) => invalid.push((table.clone(), e.to_string())),
        }
    }
    (ok, invalid)
}

async fn execute_drops(db: &Db, statements: Vec<(String, String)>, report: &mut DropReport) {
    for (table, sql) in statements {
        match sqlx::query(&sql).persistent(false).execute(&db.pool).await {
            Ok(_) => {
                info!(%table, "dropped");
                report.dropped.push(table);
            }
            Err(e) => {
                warn!(%table, error = %e, "drop failed");
                report.failed.push((table, e.to_string()));
            }
        }
    }
}

/// Drop `tables` in order. A failed drop is recorded and the rest continue.
/// Names that cannot be quoted are rejected before anything is asked.
pub async fn drop_tables(db: &Db, tables: &[String], assume_yes: bool) -> Result<DropReport> {
    let (statements, invalid) = partition_drops(tables);
    if let Some((table, err)) = invalid.first() {
        anyhow::bail!("cannot drop {table}: {err}");
    }

    let mut report = DropReport::default();
    println!("This will DROP {} tables (CASCADE):", tables.len());
    for t in tables {
        println!("  {t}");
    }
    if !prompt::confirm("Proceed?", assume_yes)? {
        println!("Cancelled. No tables dropped.");
        return Ok(report);
    }
    report.applied = true;
    execute_drops(db, statements, &mut report).await;
    Ok(report)
}

pub async fn current_database(db: &Db) -> Result<String> {
    let name: String = sqlx::query_scalar("SELECT current_database()::text")
        .persistent(false)
        .fetch_one(&db.pool)
        .await
        .context("read current database name")?;
    Ok(name)
}

/// Drop every base table in `public`. The operator must type the database
/// name to proceed. Tables whose names cannot be quoted land in `failed`.
pub async fn drop_all_public(db: &Db) -> Result<DropReport> {
    let tables = db.list_public_tables().await?;
    let mut report = DropReport::default();
    if tables.is_empty() {
        println!("No tables in public schema.");
        return Ok(report);
    }
    let dbname = current_database(db).await?;
    println!("Database {dbname} has {} tables in public:", tables.len());
    for t in &tables {
        println!("  {t}");
    }
    let question = format!("Type the database name ({dbname}) to drop ALL of them:");
    if !prompt::confirm_phrase(&question, &dbname)? {
        println!("Cancelled. No tables dropped.");
        return Ok(report);
    }
    report.applied = true;
    let (statements, invalid) = partition_drops(&tables);
    for (table, err) in invalid {
        warn!(%table, error = %err, "skipping table with unquotable name");
        report.failed.push((table, err));
    }
    execute_drops(db, statements, &mut report).await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_table_dropped_before_parents() {
        assert_eq!(DEFAULT_TMB_DROP.first(), Some(&"tmbaccommodations_stage_lnk"));
        assert_eq!(DEFAULT_TMB_DROP.last(), Some(&"tmb_stages"));
    }

    #[test]
    fn drop_statements_quote_and_validate() {
        assert_eq!(
            drop_statement("tmb_stages").unwrap(),
            "DROP TABLE IF EXISTS \"tmb_stages\" CASCADE"
        );
        assert!(drop_statement("tmb_stages; DROP TABLE hikes").is_err());
    }

    #[test]
    fn unquotable_names_are_set_aside_not_fatal() {
        let tables = vec![
            "hikes".to_string(),
            "Weird-Name".to_string(),
            "trails".to_string(),
        ];
        let (ok, invalid) = partition_drops(&tables);
        let names: Vec<&str> = ok.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(names, vec!["hikes", "trails"]);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].0, "Weird-Name");
    }

    #[test]
    fn tmb_ddl_creates_parents_before_links() {
        let order: Vec<&str> = TMB_TABLE_DDL.iter().map(|(t, _)| *t).collect();
        assert_eq!(order, vec!["tmb_stages", "tmbaccommodations", "tmbaccommodations_stage_lnk"]);
        // creation order is the reverse of the drop order
        let mut reversed = DEFAULT_TMB_DROP.to_vec();
        reversed.reverse();
        assert_eq!(order, reversed);
    }

    #[test]
    fn tmb_ddl_is_idempotent_and_cascades() {
        for (table, ddl) in TMB_TABLE_DDL {
            assert!(
                ddl.starts_with(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "{table}"
            );
            assert!(ddl.contains("id SERIAL PRIMARY KEY"));
            assert_eq!(ddl.matches('(').count(), ddl.matches(')').count(), "{table}");
        }
        let (_, lnk) = TMB_TABLE_DDL[2];
        assert_eq!(lnk.matches("ON DELETE CASCADE").count(), 2);
        assert!(lnk.contains("UNIQUE (tmbaccommodation_id, tmb_stage_id)"));
        let (_, stages) = TMB_TABLE_DDL[0];
        assert!(stages.contains("description JSONB"));
        assert!(!stages.contains("UNIQUE"));
    }
}
