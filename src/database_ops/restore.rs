//! Roll a content table back to a `TableBackup`.
use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::database_ops::content::{quote_ident, MORPH_TABLE};
use crate::database_ops::db::Db;
use crate::database_ops::snapshot::TableBackup;
use crate::database_ops::transfer::{insert_json_rows, reset_sequence};
use crate::util::prompt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub applied: bool,
    pub rows: i64,
    pub expected_rows: i64,
    pub link_rows: i64,
    pub expected_link_rows: i64,
    pub file_links: i64,
    pub expected_file_links: i64,
}

impl RestoreReport {
    pub fn counts_match(&self) -> bool {
        self.rows == self.expected_rows
            && self.link_rows == self.expected_link_rows
            && self.file_links == self.expected_file_links
    }
}

/// Older backups stored morph links without `related_type`.
pub fn with_related_type(rows: &[Value], uid: &str) -> Vec<Value> {
    rows.iter()
        .cloned()
        .map(|mut row| {
            if let Value::Object(map) = &mut row {
                let missing = map.get("related_type").map(Value::is_null).unwrap_or(true);
                if missing {
                    map.insert("related_type".into(), Value::String(uid.to_string()));
                }
            }
            row
        })
        .collect()
}

async fn count_morph_links(db: &Db, uid: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM {} WHERE related_type = $1",
        quote_ident(MORPH_TABLE)?
    ))
    .persistent(false)
    .bind(uid)
    .fetch_one(&db.pool)
    .await?;
    Ok(n)
}

/// Delete the table's current rows, links and morph links, then reload the
/// backup. Everything happens in one transaction.
pub async fn restore_backup(db: &Db, backup: &TableBackup, assume_yes: bool) -> Result<RestoreReport> {
    if backup.data.len() != backup.total_rows {
        bail!(
            "backup of {} is inconsistent: total_rows={} but {} rows present",
            backup.table,
            backup.total_rows,
            backup.data.len()
        );
    }
    let table = quote_ident(&backup.table)?;
    if !db.table_exists(&backup.table).await? {
        bail!("table {} does not exist on the target", backup.table);
    }
    let morph_exists = db.table_exists(MORPH_TABLE).await?;

    let current = db.count_rows(&backup.table).await?;
    println!("Backup date: {}", backup.backup_date.to_rfc3339());
    println!("Current database has {current} rows in {}", backup.table);
    println!("Backup has {} rows", backup.total_rows);
    for (link, rows) in &backup.links {
        println!("  {link}: {} link rows in backup", rows.len());
    }
    println!("  {MORPH_TABLE}: {} file links in backup", backup.file_links.len());
    println!("This will DELETE all current data in {} and restore from backup!", backup.table);

    let mut report = RestoreReport {
        expected_rows: backup.total_rows as i64,
        expected_link_rows: backup.link_row_count() as i64,
        expected_file_links: backup.file_links.len() as i64,
        ..Default::default()
    };
    if !prompt::confirm("Proceed with restore?", assume_yes)? {
        println!("Restore cancelled. No changes made.");
        return Ok(report);
    }

    let mut tx = db.pool.begin().await?;
    if morph_exists {
        let res = sqlx::query(&format!(
            "DELETE FROM {} WHERE related_type = $1",
            quote_ident(MORPH_TABLE)?
        ))
        .persistent(false)
        .bind(&backup.related_type)
        .execute(&mut *tx)
        .await?;
        info!(deleted = res.rows_affected(), "file links cleared");
    }
    for link in backup.links.keys() {
        let res = sqlx::query(&format!("DELETE FROM {}", quote_ident(link)?))
            .persistent(false)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clear {link}"))?;
        info!(link_table = %link, deleted = res.rows_affected(), "link rows cleared");
    }
    let res = sqlx::query(&format!("DELETE FROM {table}"))
        .persistent(false)
        .execute(&mut *tx)
        .await?;
    info!(deleted = res.rows_affected(), table = %backup.table, "rows cleared");

    let restored = insert_json_rows(&mut tx, &backup.table, &backup.data, false).await?;
    info!(restored, table = %backup.table, "rows restored");
    for (link, rows) in &backup.links {
        let n = insert_json_rows(&mut tx, link, rows, true).await?;
        info!(link_table = %link, restored = n, "link rows restored");
    }
    if morph_exists && !backup.file_links.is_empty() {
        let rows = with_related_type(&backup.file_links, &backup.related_type);
        let n = insert_json_rows(&mut tx, MORPH_TABLE, &rows, true).await?;
        info!(restored = n, "file links restored");
    }
    reset_sequence(&mut tx, &backup.table).await?;
    tx.commit().await?;
    report.applied = true;

    report.rows = db.count_rows(&backup.table).await?;
    for link in backup.links.keys() {
        report.link_rows += db.count_rows(link).await?;
    }
    if morph_exists {
        report.file_links = count_morph_links(db, &backup.related_type).await?;
    }
    println!("Rows: {} (expected: {})", report.rows, report.expected_rows);
    println!("Link rows: {} (expected: {})", report.link_rows, report.expected_link_rows);
    println!("File links: {} (expected: {})", report.file_links, report.expected_file_links);
    if report.counts_match() {
        println!("Restore completed successfully");
    } else {
        warn!(table = %backup.table, "count mismatch after restore");
        println!("WARNING: count mismatch after restore");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fills_missing_related_type_only() {
        let rows = vec![
            json!({"file_id": 3, "related_id": 10, "field": "photos", "order": 1}),
            json!({"file_id": 4, "related_id": 11, "related_type": null}),
            json!({"file_id": 5, "related_id": 12, "related_type": "api::hike.hike"}),
        ];
        let out = with_related_type(&rows, "api::tmbaccommodation.tmbaccommodation");
        assert_eq!(out[0]["related_type"], "api::tmbaccommodation.tmbaccommodation");
        assert_eq!(out[1]["related_type"], "api::tmbaccommodation.tmbaccommodation");
        assert_eq!(out[2]["related_type"], "api::hike.hike");
    }

    #[test]
    fn report_match() {
        let mut r = RestoreReport {
            applied: true,
            rows: 162,
            expected_rows: 162,
            link_rows: 80,
            expected_link_rows: 80,
            file_links: 0,
            expected_file_links: 0,
        };
        assert!(r.counts_match());
        r.link_rows = 79;
        assert!(!r.counts_match());
    }
}
