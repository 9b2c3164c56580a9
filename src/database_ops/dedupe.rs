//! Duplicate `(document_id, locale)` removal for CMS content tables.
//!
//! Each group keeps its most recently published row (ties broken by
//! `updated_at`, `created_at`, then highest id); every other row is deleted
//! together with its link rows and morph links in one transaction.
use std::cmp::{Ordering, Reverse};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{info, warn};

use crate::database_ops::content::{quote_ident, ContentType, Variant, MORPH_TABLE};
use crate::database_ops::db::Db;
use crate::database_ops::snapshot::{
    backup_content, deserialize_timestamp, legacy_table, output_path, read_json, timestamped_name,
    write_json,
};
use crate::util::prompt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub id: i64,
    pub document_id: Option<String>,
    pub locale: Option<String>,
    pub label: Option<String>,
    pub published_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub document_id: String,
    pub locale: Option<String>,
    pub keep: VersionRow,
    pub remove: Vec<VersionRow>,
}

impl DuplicateGroup {
    pub fn entries(&self) -> usize {
        self.remove.len() + 1
    }
}

/// Plans written before `table` and the counts were recorded are read as
/// `tmbaccommodations` plans without counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionPlan {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub deletion_date: DateTime<Utc>,
    #[serde(default = "legacy_table")]
    pub table: String,
    pub ids_to_delete: Vec<i64>,
    pub total_to_delete: usize,
    #[serde(default)]
    pub backup_file: Option<PathBuf>,
    #[serde(default)]
    pub rows_before: Option<i64>,
    #[serde(default)]
    pub expected_final_count: Option<i64>,
}

/// Row count the table should have once every planned id is gone.
pub fn expected_after_plan(current: i64, plan: &DeletionPlan) -> i64 {
    current - plan.total_to_delete as i64
}

#[derive(Debug, Clone, Default)]
pub struct DedupeOptions {
    pub dry_run: bool,
    pub assume_yes: bool,
    pub out_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub remaining_duplicate_groups: i64,
    pub final_count: i64,
    pub expected_final_count: i64,
}

impl Verification {
    pub fn is_clean(&self) -> bool {
        self.remaining_duplicate_groups == 0 && self.final_count == self.expected_final_count
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupeReport {
    pub groups: usize,
    pub planned: usize,
    pub deleted: u64,
    pub applied: bool,
    pub backup_file: Option<PathBuf>,
    pub plan_file: Option<PathBuf>,
    pub verification: Option<Verification>,
}

fn desc_nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// `published_at DESC NULLS LAST, updated_at DESC NULLS LAST,
/// created_at DESC NULLS LAST, id DESC`; the first row is kept.
pub fn keep_order(a: &VersionRow, b: &VersionRow) -> Ordering {
    desc_nulls_last(&a.published_at, &b.published_at)
        .then_with(|| desc_nulls_last(&a.updated_at, &b.updated_at))
        .then_with(|| desc_nulls_last(&a.created_at, &b.created_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// Group rows by `(document_id, locale)` and split each multi-row group into
/// the row to keep and the rows to remove. NULL locales group together;
/// rows without a document_id never participate.
pub fn plan_groups(rows: Vec<VersionRow>) -> Vec<DuplicateGroup> {
    let grouped = rows
        .into_iter()
        .filter_map(|r| {
            let doc = r.document_id.clone()?;
            Some(((doc, r.locale.clone()), r))
        })
        .into_group_map();

    let mut groups: Vec<DuplicateGroup> = grouped
        .into_iter()
        .filter(|(_, rows)| rows.len() > 1)
        .map(|((document_id, locale), mut rows)| {
            rows.sort_by(keep_order);
            let keep = rows.remove(0);
            DuplicateGroup {
                document_id,
                locale,
                keep,
                remove: rows,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        (Reverse(a.entries()), &a.document_id, &a.locale).cmp(&(
            Reverse(b.entries()),
            &b.document_id,
            &b.locale,
        ))
    });
    groups
}

pub fn ids_to_delete(groups: &[DuplicateGroup]) -> Vec<i64> {
    groups
        .iter()
        .flat_map(|g| g.remove.iter().map(|r| r.id))
        .collect()
}

pub fn render_groups(groups: &[DuplicateGroup]) -> String {
    let mut out = String::new();
    for g in groups {
        writeln!(
            out,
            "\n[DUPLICATE] document_id={}, locale={} ({} entries)",
            g.document_id,
            g.locale.as_deref().unwrap_or("NULL"),
            g.entries()
        )
        .ok();
        writeln!(
            out,
            "   KEEP:   ID {} [{}]: {}",
            g.keep.id,
            Variant::of(g.keep.published_at).label(),
            g.keep.label.as_deref().unwrap_or("")
        )
        .ok();
        for r in &g.remove {
            writeln!(
                out,
                "   DELETE: ID {} [{}]: {}",
                r.id,
                Variant::of(r.published_at).label(),
                r.label.as_deref().unwrap_or("")
            )
            .ok();
        }
    }
    out
}

async fn label_column(db: &Db, table: &str) -> Result<Option<&'static str>> {
    for candidate in ["name", "title"] {
        if db.column_exists(table, candidate).await? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

pub async fn load_versions(db: &Db, content: &ContentType) -> Result<Vec<VersionRow>> {
    let table = quote_ident(&content.table)?;
    let label = match label_column(db, &content.table).await? {
        Some(col) => format!("{}::text", quote_ident(col)?),
        None => "NULL::text".to_string(),
    };
    let sql = format!(
        "SELECT id::bigint AS id, document_id::text AS document_id, locale::text AS locale, \
         {label} AS label, published_at::timestamp AS published_at, \
         updated_at::timestamp AS updated_at, created_at::timestamp AS created_at \
         FROM {table} ORDER BY id"
    );
    let rows = sqlx::query(&sql)
        .persistent(false)
        .fetch_all(&db.pool)
        .await
        .with_context(|| format!("load versions from {}", content.table))?;

    Ok(rows
        .into_iter()
        .map(|r| VersionRow {
            id: r.get("id"),
            document_id: r.get("document_id"),
            locale: r.get("locale"),
            label: r.get("label"),
            published_at: r.get("published_at"),
            updated_at: r.get("updated_at"),
            created_at: r.get("created_at"),
        })
        .collect())
}

pub async fn find_duplicates(db: &Db, content: &ContentType) -> Result<Vec<DuplicateGroup>> {
    Ok(plan_groups(load_versions(db, content).await?))
}

pub async fn count_duplicate_groups(db: &Db, table: &str) -> Result<i64> {
    let sql = format!(
        "SELECT count(*) FROM (SELECT 1 FROM {} WHERE document_id IS NOT NULL \
         GROUP BY document_id, locale HAVING count(*) > 1) d",
        quote_ident(table)?
    );
    let n: i64 = sqlx::query_scalar(&sql)
        .persistent(false)
        .fetch_one(&db.pool)
        .await?;
    Ok(n)
}

/// Delete rows with their link rows and morph links in one transaction.
pub async fn execute_deletions(db: &Db, content: &ContentType, ids: &[i64]) -> Result<u64> {
    let table = quote_ident(&content.table)?;
    let mut link_deletes = Vec::new();
    for link in &content.links {
        if db.table_exists(link.table).await? {
            link_deletes.push(format!(
                "DELETE FROM {} WHERE {} = $1",
                quote_ident(link.table)?,
                quote_ident(link.owner_column)?
            ));
        }
    }
    let morph_delete = if db.table_exists(MORPH_TABLE).await? {
        Some(format!(
            "DELETE FROM {} WHERE related_id = $1 AND related_type = $2",
            quote_ident(MORPH_TABLE)?
        ))
    } else {
        None
    };
    let row_delete = format!("DELETE FROM {table} WHERE id = $1");

    let total = ids.len();
    let mut deleted = 0u64;
    let mut tx = db.pool.begin().await?;
    for (i, &id) in ids.iter().enumerate() {
        for sql in &link_deletes {
            sqlx::query(sql)
                .persistent(false)
                .bind(id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("delete link rows for {} id {id}", content.table))?;
        }
        if let Some(sql) = &morph_delete {
            sqlx::query(sql)
                .persistent(false)
                .bind(id)
                .bind(&content.uid)
                .execute(&mut *tx)
                .await?;
        }
        let res = sqlx::query(&row_delete)
            .persistent(false)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            warn!(id, table = %content.table, "row already gone");
        }
        deleted += res.rows_affected();

        if (i + 1) % 10 == 0 {
            info!(done = i + 1, total, "deleting duplicates");
        }
    }
    tx.commit().await?;
    info!(deleted, table = %content.table, "deletions committed");
    Ok(deleted)
}

pub async fn verify(db: &Db, table: &str, expected_final_count: i64) -> Result<Verification> {
    let v = Verification {
        remaining_duplicate_groups: count_duplicate_groups(db, table).await?,
        final_count: db.count_rows(table).await?,
        expected_final_count,
    };
    if v.remaining_duplicate_groups > 0 {
        warn!(remaining = v.remaining_duplicate_groups, %table, "duplicates remain");
    }
    if v.final_count != v.expected_final_count {
        warn!(
            expected = v.expected_final_count,
            actual = v.final_count,
            %table,
            "count mismatch after dedupe"
        );
    }
    Ok(v)
}

fn render_verification(v: &Verification) -> String {
    let mut out = String::new();
    if v.remaining_duplicate_groups > 0 {
        writeln!(out, "WARNING: {} duplicate groups remain", v.remaining_duplicate_groups).ok();
    } else {
        writeln!(out, "All duplicates resolved").ok();
    }
    writeln!(out, "Final count: {}", v.final_count).ok();
    writeln!(out, "Expected count: {}", v.expected_final_count).ok();
    if v.final_count == v.expected_final_count {
        writeln!(out, "Count matches expected").ok();
    } else {
        writeln!(
            out,
            "WARNING: count mismatch, expected {} got {}",
            v.expected_final_count, v.final_count
        )
        .ok();
    }
    out
}

/// Backup, analyse, write a deletion plan, confirm, delete, verify.
pub async fn run_dedupe(db: &Db, content: &ContentType, opts: &DedupeOptions) -> Result<DedupeReport> {
    let mut report = DedupeReport::default();
    let rows_before = db.count_rows(&content.table).await?;

    if !opts.dry_run {
        let backup = backup_content(db, content).await?;
        let path = output_path(
            opts.out_dir.as_deref(),
            &timestamped_name(&format!("{}_backup", content.table), "json"),
        );
        write_json(&path, &backup)?;
        println!(
            "Backup saved to {} ({} rows, {} link rows, {} file links)",
            path.display(),
            backup.total_rows,
            backup.link_row_count(),
            backup.file_links.len()
        );
        report.backup_file = Some(path);
    }

    let groups = find_duplicates(db, content).await?;
    report.groups = groups.len();
    if groups.is_empty() {
        println!("No duplicates found in {}; nothing to do.", content.table);
        return Ok(report);
    }

    let ids = ids_to_delete(&groups);
    report.planned = ids.len();
    let expected_final_count = rows_before - ids.len() as i64;
    println!(
        "Found {} duplicate document_id+locale combinations in {}:",
        groups.len(),
        content.table
    );
    print!("{}", render_groups(&groups));
    println!("\nSUMMARY:");
    println!("  Current total: {rows_before}");
    println!("  Duplicates to delete: {}", ids.len());
    println!("  Final total: {expected_final_count}");

    if opts.dry_run {
        info!(planned = ids.len(), "dry-run: no changes applied");
        return Ok(report);
    }

    let plan = DeletionPlan {
        deletion_date: Utc::now(),
        table: content.table.clone(),
        total_to_delete: ids.len(),
        ids_to_delete: ids,
        backup_file: report.backup_file.clone(),
        rows_before: Some(rows_before),
        expected_final_count: Some(expected_final_count),
    };
    let plan_path = output_path(opts.out_dir.as_deref(), &timestamped_name("deletion_plan", "json"));
    write_json(&plan_path, &plan)?;
    println!("Deletion plan saved to {}", plan_path.display());
    report.plan_file = Some(plan_path);

    let question = format!("Proceed with deleting {} duplicate entries?", plan.total_to_delete);
    if !prompt::confirm(&question, opts.assume_yes)? {
        println!("Deletion cancelled. No changes made.");
        return Ok(report);
    }

    report.deleted = execute_deletions(db, content, &plan.ids_to_delete).await?;
    report.applied = true;
    let v = verify(db, &content.table, expected_final_count).await?;
    print!("{}", render_verification(&v));
    report.verification = Some(v);
    print!("{}", render_rollback(report.backup_file.as_deref()));
    Ok(report)
}

fn render_rollback(backup: Option<&Path>) -> String {
    let mut out = String::new();
    match backup {
        Some(path) => {
            writeln!(out, "To roll back: thdb restore {}", path.display()).ok();
        }
        None => {
            writeln!(out, "No backup file recorded; roll back from your own backup.").ok();
        }
    }
    out
}

/// Execute a previously written deletion plan.
pub async fn run_plan(db: &Db, plan_path: &Path, assume_yes: bool) -> Result<DedupeReport> {
    let plan: DeletionPlan = read_json(plan_path)?;
    if plan.ids_to_delete.len() != plan.total_to_delete {
        bail!(
            "plan {} is inconsistent: {} ids listed, total_to_delete={}",
            plan_path.display(),
            plan.ids_to_delete.len(),
            plan.total_to_delete
        );
    }
    let content = ContentType::resolve(&plan.table)?;
    println!("Deletion plan: {}", plan_path.display());
    if let Some(b) = &plan.backup_file {
        println!("Backup file: {}", b.display());
    }
    println!("Total IDs to delete from {}: {}", plan.table, plan.total_to_delete);

    let mut report = DedupeReport {
        planned: plan.total_to_delete,
        plan_file: Some(plan_path.to_path_buf()),
        backup_file: plan.backup_file.clone(),
        ..Default::default()
    };
    if !prompt::confirm("Proceed with deletion?", assume_yes)? {
        println!("Cancelled. No changes made.");
        return Ok(report);
    }

    let current = db.count_rows(&plan.table).await?;
    if let Some(before) = plan.rows_before.filter(|b| *b != current) {
        warn!(planned_against = before, current, "table changed since the plan was written");
    }
    let expected = expected_after_plan(current, &plan);
    if let Some(planned) = plan.expected_final_count.filter(|p| *p != expected) {
        warn!(plan_expected = planned, expected, "final count will differ from the plan's expectation");
    }
    report.deleted = execute_deletions(db, &content, &plan.ids_to_delete).await?;
    report.applied = true;
    if report.deleted < plan.total_to_delete as u64 {
        warn!(
            deleted = report.deleted,
            planned = plan.total_to_delete,
            "fewer rows deleted than planned"
        );
    }
    let v = verify(db, &plan.table, expected).await?;
    print!("{}", render_verification(&v));
    report.verification = Some(v);
    print!("{}", render_rollback(plan.backup_file.as_deref()));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2025, 11, day).and_then(|d| d.and_hms_opt(12, 0, 0))
    }

    fn row(id: i64, doc: Option<&str>, locale: Option<&str>, published: Option<NaiveDateTime>) -> VersionRow {
        VersionRow {
            id,
            document_id: doc.map(str::to_string),
            locale: locale.map(str::to_string),
            label: Some(format!("row {id}")),
            published_at: published,
            updated_at: None,
            created_at: None,
        }
    }

    #[test]
    fn published_beats_draft_and_newer_beats_older() {
        let draft = row(9, Some("a"), Some("en"), None);
        let old = row(2, Some("a"), Some("en"), ts(1));
        let new = row(3, Some("a"), Some("en"), ts(5));
        let groups = plan_groups(vec![draft, old, new]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keep.id, 3);
        let removed: Vec<_> = groups[0].remove.iter().map(|r| r.id).collect();
        assert_eq!(removed, [2, 9]);
    }

    #[test]
    fn ties_fall_back_to_updated_then_highest_id() {
        let mut a = row(1, Some("d"), Some("en"), ts(4));
        let mut b = row(2, Some("d"), Some("en"), ts(4));
        a.updated_at = ts(6);
        b.updated_at = ts(5);
        assert_eq!(keep_order(&a, &b), Ordering::Less);

        let c = row(7, Some("d"), Some("en"), ts(4));
        let d = row(8, Some("d"), Some("en"), ts(4));
        assert_eq!(keep_order(&d, &c), Ordering::Less);
    }

    #[test]
    fn null_locale_groups_separately_and_together() {
        let rows = vec![
            row(1, Some("a"), None, None),
            row(2, Some("a"), None, None),
            row(3, Some("a"), Some("en"), ts(2)),
        ];
        let groups = plan_groups(rows);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].locale, None);
        assert_eq!(groups[0].keep.id, 2);
    }

    #[test]
    fn rows_without_document_id_are_ignored() {
        let rows = vec![row(1, None, Some("en"), None), row(2, None, Some("en"), None)];
        assert!(plan_groups(rows).is_empty());
    }

    #[test]
    fn larger_groups_come_first() {
        let rows = vec![
            row(1, Some("b"), Some("en"), None),
            row(2, Some("b"), Some("en"), None),
            row(3, Some("a"), Some("en"), None),
            row(4, Some("a"), Some("en"), None),
            row(5, Some("a"), Some("en"), None),
        ];
        let groups = plan_groups(rows);
        assert_eq!(groups[0].document_id, "a");
        assert_eq!(groups[0].entries(), 3);
        assert_eq!(ids_to_delete(&groups), [4, 3, 1]);
    }

    #[test]
    fn render_lists_keep_and_delete() {
        let groups = plan_groups(vec![
            row(1, Some("x"), Some("en"), ts(3)),
            row(2, Some("x"), Some("en"), None),
        ]);
        let text = render_groups(&groups);
        assert!(text.contains("document_id=x, locale=en (2 entries)"));
        assert!(text.contains("KEEP:   ID 1 [PUBLISHED]: row 1"));
        assert!(text.contains("DELETE: ID 2 [DRAFT]: row 2"));
    }

    #[test]
    fn verification_flags_mismatch() {
        let ok = Verification {
            remaining_duplicate_groups: 0,
            final_count: 82,
            expected_final_count: 82,
        };
        assert!(ok.is_clean());
        let off = Verification {
            final_count: 83,
            ..ok.clone()
        };
        assert!(!off.is_clean());
        assert!(render_verification(&off).contains("count mismatch"));
    }

    #[test]
    fn plan_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = DeletionPlan {
            deletion_date: Utc::now(),
            table: "tmbaccommodations".into(),
            ids_to_delete: vec![4, 9],
            total_to_delete: 2,
            backup_file: Some(PathBuf::from("tmbaccommodations_backup_20251106_222431.json")),
            rows_before: Some(84),
            expected_final_count: Some(82),
        };
        write_json(&path, &plan).unwrap();
        let loaded: DeletionPlan = read_json(&path).unwrap();
        assert_eq!(loaded.ids_to_delete, [4, 9]);
        assert_eq!(loaded.expected_final_count, Some(82));
    }

    #[test]
    fn legacy_plan_files_load() {
        let raw = r#"{
            "deletion_date": "2025-11-06T22:25:02.551203",
            "ids_to_delete": [101, 102, 107],
            "total_to_delete": 3,
            "backup_file": "tmbaccommodations_backup_20251106_222431.json"
        }"#;
        let plan: DeletionPlan = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.table, "tmbaccommodations");
        assert_eq!(plan.rows_before, None);
        assert_eq!(plan.expected_final_count, None);
        assert_eq!(plan.total_to_delete, 3);
    }

    #[test]
    fn short_delete_fails_verification() {
        let plan: DeletionPlan = serde_json::from_value(serde_json::json!({
            "deletion_date": "2025-11-06T22:25:02Z",
            "table": "tmbaccommodations",
            "ids_to_delete": [1, 2, 3],
            "total_to_delete": 3
        }))
        .unwrap();
        let current = 84;
        let expected = expected_after_plan(current, &plan);
        assert_eq!(expected, 81);
        // only two of the three rows were still there
        let v = Verification {
            remaining_duplicate_groups: 0,
            final_count: current - 2,
            expected_final_count: expected,
        };
        assert!(!v.is_clean());
        assert!(render_verification(&v).contains("expected 81 got 82"));
    }

    #[test]
    fn rollback_names_the_backup() {
        let text = render_rollback(Some(Path::new("tmbaccommodations_backup_20251106_222431.json")));
        assert_eq!(text, "To roll back: thdb restore tmbaccommodations_backup_20251106_222431.json\n");
        assert!(render_rollback(None).contains("No backup file"));
    }
}
