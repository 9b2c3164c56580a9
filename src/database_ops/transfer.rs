//! Environment-to-environment copies: snapshot import, TMB export load,
//! table copy and sequence repair.
use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use tracing::{info, warn};

use crate::database_ops::content::quote_ident;
use crate::database_ops::db::{spatial_columns, Db};
use crate::database_ops::snapshot::{export_tables, write_json, Snapshot, TmbExport};
use crate::util::prompt;

pub const TMB_TABLES: &[&str] = &[
    "tmb_stages",
    "tmbaccommodations",
    "tmbaccommodations_cmps",
    "tmbaccommodations_stage_lnk",
];

/// Parents before children; truncation runs in reverse.
pub const COMPONENT_MEDIA_TABLES: &[&str] = &[
    "components_hike_blogs",
    "components_hike_books",
    "components_hike_landmarks",
    "components_hike_videos",
    "accommodations",
    "accommodations_hikes_lnk",
    "upload_folders",
    "upload_folders_parent_lnk",
    "files",
    "files_folder_lnk",
    "files_related_mph",
];

const INSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub inserted: Vec<(String, u64)>,
    pub skipped_empty: Vec<String>,
    pub applied: bool,
}

impl ImportReport {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.iter().map(|(_, n)| n).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceFix {
    Set { table: String, next_id: i64 },
    Empty { table: String },
    NoSequence { table: String },
    Failed { table: String, error: String },
}

/// Column names in first-seen order across all rows.
pub fn json_columns(rows: &[Value]) -> Vec<String> {
    let mut cols: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !cols.iter().any(|c| c == key) {
                    cols.push(key.clone());
                }
            }
        }
    }
    cols
}

/// First spatial column holding a JSON object (GeoJSON) instead of EWKT text.
pub fn geojson_column<'a>(rows: &[Value], spatial: &'a [String]) -> Option<&'a str> {
    spatial
        .iter()
        .find(|col| rows.iter().any(|r| r.get(col.as_str()).is_some_and(Value::is_object)))
        .map(String::as_str)
}

/// Every table named in `order` must be a key of the snapshot. A table that
/// is present with no rows is fine; one that is absent would be truncated
/// and never refilled.
pub fn check_import_order(snapshot: &Snapshot, order: &[String]) -> Result<()> {
    let absent: Vec<&str> = order
        .iter()
        .filter(|t| !snapshot.tables.contains_key(t.as_str()))
        .map(String::as_str)
        .collect();
    if !absent.is_empty() {
        bail!("tables not in snapshot: {absent:?}");
    }
    Ok(())
}

/// Truncation order for an import: reverse of the insert order.
pub fn truncate_order(order: &[String]) -> Vec<String> {
    order.iter().rev().cloned().collect()
}

pub async fn table_columns(conn: &mut PgConnection, table: &str) -> Result<Vec<String>> {
    let cols: Vec<String> = sqlx::query_scalar(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema='public' AND table_name=$1 AND is_generated='NEVER' \
         ORDER BY ordinal_position",
    )
    .persistent(false)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    Ok(cols)
}

/// Insert JSON rows through `jsonb_populate_recordset`. Only keys that are
/// columns of the target table are written.
pub async fn insert_json_rows(
    conn: &mut PgConnection,
    table: &str,
    rows: &[Value],
    ignore_conflicts: bool,
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let target_cols = table_columns(conn, table).await?;
    if target_cols.is_empty() {
        bail!("table {table} does not exist on the target");
    }
    let mut cols = Vec::new();
    for c in json_columns(rows) {
        if target_cols.contains(&c) {
            cols.push(quote_ident(&c)?);
        } else {
            warn!(%table, column = %c, "column not present on target; dropped");
        }
    }
    if cols.is_empty() {
        bail!("no matching columns for {table}");
    }
    let spatial = spatial_columns(&mut *conn, table).await?;
    if let Some(col) = geojson_column(rows, &spatial) {
        bail!("{table}.{col} holds GeoJSON; re-export the source so spatial columns are EWKT");
    }
    let col_list = cols.join(", ");
    let qtable = quote_ident(table)?;
    let conflict = if ignore_conflicts { " ON CONFLICT DO NOTHING" } else { "" };
    let sql = format!(
        "INSERT INTO {qtable} ({col_list}) SELECT {col_list} FROM jsonb_populate_recordset(NULL::{qtable}, $1){conflict}"
    );

    let mut inserted = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(sqlx::types::Json(chunk))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("insert into {table}"))?;
        inserted += res.rows_affected();
    }
    Ok(inserted)
}

/// Point the id sequence at `MAX(id)`; no-op for tables without one.
pub async fn reset_sequence(conn: &mut PgConnection, table: &str) -> Result<Option<i64>> {
    let sql = format!(
        "SELECT setval(pg_get_serial_sequence($1, 'id')::regclass, coalesce(max(id), 1), max(id) IS NOT NULL) FROM {}",
        quote_ident(table)?
    );
    let value: Option<i64> = sqlx::query_scalar(&sql)
        .persistent(false)
        .bind(table)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("reset sequence for {table}"))?;
    Ok(value)
}

async fn has_id_column(conn: &mut PgConnection, table: &str) -> Result<bool> {
    Ok(table_columns(conn, table).await?.iter().any(|c| c == "id"))
}

/// Replace the target's tables with the snapshot contents in one transaction.
pub async fn import_snapshot(
    db: &Db,
    snapshot: &Snapshot,
    order: Option<&[String]>,
    assume_yes: bool,
) -> Result<ImportReport> {
    let order: Vec<String> = match order {
        Some(o) if !o.is_empty() => o.to_vec(),
        _ => snapshot.tables.keys().cloned().collect(),
    };
    if order.is_empty() {
        bail!("snapshot has no tables to import");
    }
    check_import_order(snapshot, &order)?;
    let mut missing = Vec::new();
    for table in &order {
        quote_ident(table)?;
        if !db.table_exists(table).await? {
            missing.push(table.clone());
        }
    }
    if !missing.is_empty() {
        bail!("tables missing on target: {missing:?}");
    }

    let mut report = ImportReport::default();
    println!("This will TRUNCATE and reload {} tables:", order.len());
    for table in &order {
        let rows = snapshot.tables.get(table).map(Vec::len).unwrap_or(0);
        println!("  {table}: {rows} rows from snapshot");
    }
    if !prompt::confirm("Proceed with import?", assume_yes)? {
        println!("Import cancelled. No changes made.");
        return Ok(report);
    }

    let truncate = truncate_order(&order)
        .iter()
        .map(|t| quote_ident(t))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let mut tx = db.pool.begin().await?;
    sqlx::query(&format!("TRUNCATE {truncate} RESTART IDENTITY CASCADE"))
        .persistent(false)
        .execute(&mut *tx)
        .await
        .context("truncate target tables")?;
    info!(tables = order.len(), "target tables truncated");

    for table in &order {
        let rows = snapshot.tables.get(table).map(Vec::as_slice).unwrap_or(&[]);
        if rows.is_empty() {
            info!(%table, "no rows in snapshot; skipped");
            report.skipped_empty.push(table.clone());
            continue;
        }
        let n = insert_json_rows(&mut tx, table, rows, false).await?;
        info!(%table, rows = n, "inserted");
        report.inserted.push((table.clone(), n));
    }
    for table in &order {
        if has_id_column(&mut tx, table).await? {
            reset_sequence(&mut tx, table).await?;
        }
    }
    tx.commit().await?;
    report.applied = true;
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct TmbLoadReport {
    pub stages: usize,
    pub accommodations: usize,
    pub links: u64,
    /// Accommodations whose `stage_id` is not a stage of the export.
    pub unmapped_links: usize,
    pub applied: bool,
}

fn row_id(row: &Value) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}

/// Link pairs in new ids for every exported accommodation with a stage. The
/// second value counts accommodations whose stage or own id did not map.
pub fn remap_export_links(
    accommodations: &[Value],
    stage_ids: &HashMap<i64, i64>,
    accommodation_ids: &HashMap<i64, i64>,
) -> (Vec<(i64, i64)>, usize) {
    let mut pairs = Vec::new();
    let mut unmapped = 0usize;
    for acc in accommodations {
        let Some(old_stage) = acc.get("stage_id").and_then(Value::as_i64) else {
            continue;
        };
        let new_acc = row_id(acc).and_then(|id| accommodation_ids.get(&id));
        match (new_acc, stage_ids.get(&old_stage)) {
            (Some(a), Some(s)) => pairs.push((*a, *s)),
            _ => unmapped += 1,
        }
    }
    (pairs, unmapped)
}

/// Insert rows one at a time with fresh ids. Returns old id -> new id.
async fn insert_with_new_ids(conn: &mut PgConnection, table: &str, rows: &[Value]) -> Result<HashMap<i64, i64>> {
    if rows.is_empty() {
        return Ok(HashMap::new());
    }
    let target_cols = table_columns(conn, table).await?;
    let mut cols = Vec::new();
    for c in json_columns(rows) {
        if c != "id" && target_cols.contains(&c) {
            cols.push(quote_ident(&c)?);
        }
    }
    if cols.is_empty() {
        bail!("no matching columns for {table}");
    }
    let col_list = cols.join(", ");
    let qtable = quote_ident(table)?;
    let sql = format!(
        "INSERT INTO {qtable} ({col_list}) SELECT {col_list} FROM jsonb_populate_record(NULL::{qtable}, $1) RETURNING id::bigint"
    );
    let mut ids = HashMap::with_capacity(rows.len());
    for row in rows {
        let new_id: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .bind(sqlx::types::Json(row))
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("insert into {table}"))?;
        if let Some(old) = row_id(row) {
            ids.insert(old, new_id);
        }
    }
    Ok(ids)
}

/// Load a published TMB export into the TMB tables in one transaction. Rows
/// get new ids; links are rebuilt from each accommodation's `stage_id`.
pub async fn load_tmb_export(db: &Db, export: &TmbExport, assume_yes: bool) -> Result<TmbLoadReport> {
    let mut report = TmbLoadReport::default();
    println!(
        "This will insert {} stages and {} accommodations.",
        export.tmb_stages.len(),
        export.tmb_accommodations.len()
    );
    if !prompt::confirm("Proceed with import?", assume_yes)? {
        println!("Import cancelled. No changes made.");
        return Ok(report);
    }

    let mut tx = db.pool.begin().await?;
    let stage_ids = insert_with_new_ids(&mut tx, "tmb_stages", &export.tmb_stages).await?;
    report.stages = export.tmb_stages.len();
    info!(rows = report.stages, "stages inserted");
    let accommodation_ids = insert_with_new_ids(&mut tx, "tmbaccommodations", &export.tmb_accommodations).await?;
    report.accommodations = export.tmb_accommodations.len();
    info!(rows = report.accommodations, "accommodations inserted");

    let (pairs, unmapped) = remap_export_links(&export.tmb_accommodations, &stage_ids, &accommodation_ids);
    report.unmapped_links = unmapped;
    if unmapped > 0 {
        warn!(unmapped, "accommodation stages not found in the export");
    }
    for (acc, stage) in &pairs {
        report.links += sqlx::query(
            "INSERT INTO tmbaccommodations_stage_lnk (tmbaccommodation_id, tmb_stage_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .persistent(false)
        .bind(acc)
        .bind(stage)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    report.applied = true;
    info!(links = report.links, "stage links created");
    Ok(report)
}

/// Export `tables` from `source` and load them into `target`.
pub async fn copy_tables(
    source: &Db,
    target: &Db,
    tables: &[String],
    source_label: Option<String>,
    save_to: Option<&std::path::Path>,
    assume_yes: bool,
) -> Result<ImportReport> {
    let snapshot = export_tables(source, tables, source_label).await?;
    info!(tables = snapshot.tables.len(), rows = snapshot.row_count(), "source exported");
    if let Some(path) = save_to {
        write_json(path, &snapshot)?;
        println!("Snapshot written to {}", path.display());
    }
    let order: Vec<String> = tables
        .iter()
        .filter(|t| snapshot.tables.contains_key(*t))
        .cloned()
        .collect();
    import_snapshot(target, &snapshot, Some(&order), assume_yes).await
}

/// Move each table's id sequence past `MAX(id)`. Failures are per table.
pub async fn fix_sequences(db: &Db, tables: &[String]) -> Result<Vec<SequenceFix>> {
    let mut out = Vec::with_capacity(tables.len());
    for table in tables {
        let fix = match fix_one_sequence(db, table).await {
            Ok(f) => f,
            Err(e) => {
                warn!(%table, error = %e, "could not fix sequence");
                SequenceFix::Failed {
                    table: table.clone(),
                    error: e.to_string(),
                }
            }
        };
        out.push(fix);
    }
    Ok(out)
}

async fn fix_one_sequence(db: &Db, table: &str) -> Result<SequenceFix> {
    let qtable = quote_ident(table)?;
    let row = sqlx::query(&format!(
        "SELECT pg_get_serial_sequence($1, 'id') AS seq, (SELECT max(id)::bigint FROM {qtable}) AS max_id"
    ))
    .persistent(false)
    .bind(table)
    .fetch_one(&db.pool)
    .await?;
    let seq: Option<String> = row.try_get("seq")?;
    let max_id: Option<i64> = row.try_get("max_id")?;

    let Some(seq) = seq else {
        return Ok(SequenceFix::NoSequence {
            table: table.to_string(),
        });
    };
    let Some(max_id) = max_id else {
        return Ok(SequenceFix::Empty {
            table: table.to_string(),
        });
    };
    let next_id = max_id + 1;
    sqlx::query("SELECT setval($1::regclass, $2, false)")
        .persistent(false)
        .bind(&seq)
        .bind(next_id)
        .execute(&db.pool)
        .await?;
    info!(%table, next_id, "sequence fixed");
    Ok(SequenceFix::Set {
        table: table.to_string(),
        next_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn columns_follow_first_seen_order() {
        let rows = vec![
            json!({"id": 1, "name": "Stage 1"}),
            json!({"id": 2, "name": "Stage 2", "locale": "en"}),
            json!("not an object"),
        ];
        assert_eq!(json_columns(&rows), ["id", "name", "locale"]);
        assert!(json_columns(&[]).is_empty());
    }

    #[test]
    fn truncation_runs_children_first() {
        let order: Vec<String> = TMB_TABLES.iter().map(|s| s.to_string()).collect();
        let rev = truncate_order(&order);
        assert_eq!(rev.first().map(String::as_str), Some("tmbaccommodations_stage_lnk"));
        assert_eq!(rev.last().map(String::as_str), Some("tmb_stages"));
    }

    #[test]
    fn table_groups_are_valid_identifiers() {
        for t in TMB_TABLES.iter().chain(COMPONENT_MEDIA_TABLES) {
            quote_ident(t).unwrap();
        }
    }

    fn snapshot_with(tables: &[(&str, Vec<Value>)]) -> Snapshot {
        Snapshot {
            tables: tables.iter().map(|(t, rows)| (t.to_string(), rows.clone())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn import_order_must_name_snapshot_tables() {
        let snapshot = snapshot_with(&[("tmb_stages", vec![json!({"id": 1})]), ("tmbaccommodations", vec![])]);
        let present: Vec<String> = vec!["tmb_stages".into(), "tmbaccommodations".into()];
        check_import_order(&snapshot, &present).unwrap();

        let with_absent: Vec<String> = vec!["tmb_stages".into(), "tmbaccommodations_stage_lnk".into()];
        let err = check_import_order(&snapshot, &with_absent).unwrap_err();
        assert!(err.to_string().contains("tmbaccommodations_stage_lnk"));
        assert!(!err.to_string().contains("\"tmb_stages\""));
    }

    #[test]
    fn geojson_in_spatial_column_is_detected() {
        let spatial = vec!["track".to_string()];
        let ewkt = vec![json!({"id": 1, "track": "SRID=4326;LINESTRING(6.8 45.9,6.9 45.8)"})];
        assert_eq!(geojson_column(&ewkt, &spatial), None);
        let geojson = vec![
            json!({"id": 1, "track": null}),
            json!({"id": 2, "track": {"type": "LineString", "coordinates": [[6.8, 45.9]]}}),
        ];
        assert_eq!(geojson_column(&geojson, &spatial), Some("track"));
        assert_eq!(geojson_column(&geojson, &[]), None);
    }

    #[test]
    fn export_links_follow_new_ids() {
        let accommodations = vec![
            json!({"id": 10, "name": "Refuge de la Balme", "stage_id": 1}),
            json!({"id": 11, "name": "Gite Le Moulin", "stage_id": null}),
            json!({"id": 12, "name": "Rifugio Bonatti", "stage_id": 99}),
            json!({"id": 13, "name": "Auberge du Truc", "stage_id": 2}),
        ];
        let stage_ids = HashMap::from([(1, 501), (2, 502)]);
        let accommodation_ids = HashMap::from([(10, 701), (11, 702), (12, 703), (13, 704)]);
        let (pairs, unmapped) = remap_export_links(&accommodations, &stage_ids, &accommodation_ids);
        assert_eq!(pairs, vec![(701, 501), (704, 502)]);
        assert_eq!(unmapped, 1);
    }

    #[test]
    fn report_totals() {
        let report = ImportReport {
            inserted: vec![("tmb_stages".into(), 11), ("tmbaccommodations".into(), 82)],
            skipped_empty: vec![],
            applied: true,
        };
        assert_eq!(report.total_inserted(), 93);
    }
}
