//! JSON backups of content tables and arbitrary table snapshots.
//!
//! Rows are serialised server-side (`to_jsonb`) so any column type round-trips
//! without a client-side type map; restores feed the same JSON back through
//! `jsonb_populate_recordset`.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::database_ops::content::{quote_ident, ContentType, MORPH_TABLE, STAGE_LINK};
use crate::database_ops::db::{spatial_columns, Db};

/// Table assumed by backup and plan files that predate the `table` field.
pub const LEGACY_TABLE: &str = "tmbaccommodations";
pub const LEGACY_RELATED_TYPE: &str = "api::tmbaccommodation.tmbaccommodation";

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("unrecognised timestamp {raw:?}"))?;
    Ok(naive.and_utc())
}

pub fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub(crate) fn legacy_table() -> String {
    LEGACY_TABLE.to_string()
}

fn legacy_related_type() -> String {
    LEGACY_RELATED_TYPE.to_string()
}

/// One content table plus everything that points at its rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredTableBackup")]
pub struct TableBackup {
    pub backup_date: DateTime<Utc>,
    pub table: String,
    pub related_type: String,
    pub total_rows: usize,
    pub data: Vec<Value>,
    /// Link table name -> rows.
    #[serde(default)]
    pub links: IndexMap<String, Vec<Value>>,
    #[serde(default)]
    pub file_links: Vec<Value>,
}

/// On-disk shape, including files written before link tables were keyed by
/// name (a bare `stage_links` array, no `table`/`related_type`).
#[derive(Deserialize)]
struct StoredTableBackup {
    #[serde(deserialize_with = "deserialize_timestamp")]
    backup_date: DateTime<Utc>,
    #[serde(default = "legacy_table")]
    table: String,
    #[serde(default = "legacy_related_type")]
    related_type: String,
    #[serde(default)]
    total_rows: Option<usize>,
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    links: IndexMap<String, Vec<Value>>,
    #[serde(default)]
    stage_links: Option<Vec<Value>>,
    #[serde(default)]
    file_links: Vec<Value>,
}

impl From<StoredTableBackup> for TableBackup {
    fn from(raw: StoredTableBackup) -> Self {
        let mut links = raw.links;
        if let Some(rows) = raw.stage_links {
            links.entry(STAGE_LINK.table.to_string()).or_insert(rows);
        }
        TableBackup {
            backup_date: raw.backup_date,
            table: raw.table,
            related_type: raw.related_type,
            total_rows: raw.total_rows.unwrap_or(raw.data.len()),
            data: raw.data,
            links,
            file_links: raw.file_links,
        }
    }
}

impl TableBackup {
    pub fn link_row_count(&self) -> usize {
        self.links.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub export_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<String>,
    pub tables: IndexMap<String, Vec<Value>>,
}

impl Snapshot {
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Published TMB content with each accommodation's linked stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmbExport {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub export_date: DateTime<Utc>,
    pub tmb_stages: Vec<Value>,
    pub tmb_accommodations: Vec<Value>,
}

/// JSON expression for one row of `alias`. Spatial columns are replaced by
/// their EWKT text so they load back through PostGIS's text input.
pub fn row_json_expr(alias: &str, spatial: &[String]) -> Result<String> {
    if spatial.is_empty() {
        return Ok(format!("to_jsonb({alias})"));
    }
    let mut pairs = Vec::with_capacity(spatial.len());
    for col in spatial {
        pairs.push(format!("'{col}', ST_AsEWKT({alias}.{})", quote_ident(col)?));
    }
    Ok(format!("to_jsonb({alias}) || jsonb_build_object({})", pairs.join(", ")))
}

/// `SELECT` a table as a JSON array, optionally filtered on one column.
pub async fn fetch_table_rows(
    db: &Db,
    table: &str,
    filter: Option<(&str, &str)>,
    order_by: &[&str],
) -> Result<Vec<Value>> {
    let mut order = Vec::with_capacity(order_by.len());
    for col in order_by {
        order.push(format!("t.{}", quote_ident(col)?));
    }
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    let spatial = spatial_columns(&db.pool, table).await?;
    let row_expr = row_json_expr("t", &spatial)?;
    let mut sql = format!(
        "SELECT coalesce(jsonb_agg({row_expr}{order_clause}), '[]'::jsonb) FROM {} t",
        quote_ident(table)?
    );
    if let Some((col, _)) = filter {
        sql.push_str(&format!(" WHERE t.{} = $1", quote_ident(col)?));
    }

    let mut query = sqlx::query_scalar::<_, Value>(&sql).persistent(false);
    if let Some((_, value)) = filter {
        query = query.bind(value);
    }
    let value = query
        .fetch_one(&db.pool)
        .await
        .with_context(|| format!("export rows from {table}"))?;
    Ok(into_rows(value))
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Back up a content table, its link tables and its morph links.
pub async fn backup_content(db: &Db, content: &ContentType) -> Result<TableBackup> {
    info!(table = %content.table, "backing up content table");
    let data = fetch_table_rows(db, &content.table, None, &["id"]).await?;

    let mut links = IndexMap::new();
    for link in &content.links {
        if !db.table_exists(link.table).await? {
            warn!(link_table = link.table, "link table missing; not backed up");
            continue;
        }
        let rows = fetch_table_rows(db, link.table, None, &[link.owner_column]).await?;
        info!(link_table = link.table, rows = rows.len(), "link rows backed up");
        links.insert(link.table.to_string(), rows);
    }

    let file_links = if db.table_exists(MORPH_TABLE).await? {
        fetch_table_rows(
            db,
            MORPH_TABLE,
            Some(("related_type", &content.uid)),
            &["related_id", "order"],
        )
        .await?
    } else {
        Vec::new()
    };

    Ok(TableBackup {
        backup_date: Utc::now(),
        table: content.table.clone(),
        related_type: content.uid.clone(),
        total_rows: data.len(),
        data,
        links,
        file_links,
    })
}

/// Export whole tables in the given order; missing tables are skipped.
pub async fn export_tables(db: &Db, tables: &[String], source: Option<String>) -> Result<Snapshot> {
    let mut snapshot = Snapshot {
        export_date: Some(Utc::now()),
        source,
        tables: IndexMap::new(),
    };
    for table in tables {
        if !db.table_exists(table).await? {
            warn!(%table, "table missing on source; skipped");
            continue;
        }
        let order: &[&str] = if db.column_exists(table, "id").await? {
            &["id"]
        } else {
            &[]
        };
        let rows = fetch_table_rows(db, table, None, order).await?;
        info!(%table, rows = rows.len(), "exported");
        snapshot.tables.insert(table.clone(), rows);
    }
    Ok(snapshot)
}

pub async fn export_published_tmb(db: &Db) -> Result<TmbExport> {
    let stages: Value = sqlx::query_scalar(
        "SELECT coalesce(jsonb_agg(to_jsonb(s) ORDER BY s.stage_number), '[]'::jsonb) \
         FROM tmb_stages s WHERE s.published_at IS NOT NULL",
    )
    .persistent(false)
    .fetch_one(&db.pool)
    .await
    .context("export published tmb_stages")?;

    let accommodations: Value = sqlx::query_scalar(
        "SELECT coalesce(jsonb_agg(to_jsonb(t) || jsonb_build_object('stage_id', l.tmb_stage_id) ORDER BY t.name), '[]'::jsonb) \
         FROM tmbaccommodations t \
         LEFT JOIN tmbaccommodations_stage_lnk l ON l.tmbaccommodation_id = t.id \
         WHERE t.published_at IS NOT NULL",
    )
    .persistent(false)
    .fetch_one(&db.pool)
    .await
    .context("export published tmbaccommodations")?;

    Ok(TmbExport {
        export_date: Utc::now(),
        tmb_stages: into_rows(stages),
        tmb_accommodations: into_rows(accommodations),
    })
}

/// Accommodations in an export that carry a stage.
pub fn with_stage_count(export: &TmbExport) -> usize {
    export
        .tmb_accommodations
        .iter()
        .filter(|a| a.get("stage_id").map(|v| !v.is_null()).unwrap_or(false))
        .count()
}

/// `<prefix>_YYYYmmdd_HHMMSS.<ext>` in local time.
pub fn timestamped_name(prefix: &str, ext: &str) -> String {
    timestamped_name_at(prefix, ext, Local::now())
}

pub fn timestamped_name_at<Tz: chrono::TimeZone>(prefix: &str, ext: &str, at: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{prefix}_{}.{ext}", at.format("%Y%m%d_%H%M%S"))
}

pub fn output_path(dir: Option<&Path>, name: &str) -> PathBuf {
    match dir {
        Some(d) => d.join(name),
        None => PathBuf::from(name),
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("backup file {} not readable", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn timestamped_names() {
        let at = Utc.with_ymd_and_hms(2025, 11, 6, 22, 24, 31).unwrap();
        assert_eq!(
            timestamped_name_at("deletion_plan", "json", at),
            "deletion_plan_20251106_222431.json"
        );
    }

    #[test]
    fn backup_file_round_trip_keeps_link_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("backup.json");
        let mut links = IndexMap::new();
        links.insert("tmbaccommodations_stage_lnk".to_string(), vec![json!({"tmbaccommodation_id": 1, "tmb_stage_id": 3})]);
        links.insert("tmbaccommodations_cmps".to_string(), Vec::new());
        let backup = TableBackup {
            backup_date: Utc::now(),
            table: "tmbaccommodations".into(),
            related_type: "api::tmbaccommodation.tmbaccommodation".into(),
            total_rows: 1,
            data: vec![json!({"id": 1, "name": "Refuge de la Balme", "locale": null})],
            links,
            file_links: vec![],
        };
        write_json(&path, &backup).unwrap();
        let loaded: TableBackup = read_json(&path).unwrap();
        assert_eq!(loaded.total_rows, 1);
        assert_eq!(loaded.link_row_count(), 1);
        let names: Vec<_> = loaded.links.keys().cloned().collect();
        assert_eq!(names, ["tmbaccommodations_stage_lnk", "tmbaccommodations_cmps"]);
    }

    #[test]
    fn legacy_backup_files_load() {
        // shape written by the earlier backup script
        let raw = r#"{
            "backup_date": "2025-11-06T22:24:31.123456",
            "total_rows": 2,
            "table": "tmbaccommodations",
            "data": [{"id": 1, "name": "Refuge de la Balme"}, {"id": 2, "name": "Gite Le Moulin"}],
            "stage_links": [{"tmbaccommodation_id": 1, "tmb_stage_id": 3}],
            "file_links": [{"file_id": 8, "related_id": 1, "field": "images", "order": 1}]
        }"#;
        let parsed: TableBackup = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.table, "tmbaccommodations");
        assert_eq!(parsed.related_type, LEGACY_RELATED_TYPE);
        assert_eq!(parsed.total_rows, 2);
        assert_eq!(parsed.backup_date.to_rfc3339(), "2025-11-06T22:24:31.123456+00:00");
        assert_eq!(parsed.links.len(), 1);
        assert_eq!(parsed.links[STAGE_LINK.table].len(), 1);
        assert_eq!(parsed.file_links.len(), 1);
    }

    #[test]
    fn named_links_win_over_bare_stage_links() {
        let raw = json!({
            "backup_date": "2025-11-06T22:24:31Z",
            "table": "tmbaccommodations",
            "related_type": LEGACY_RELATED_TYPE,
            "data": [],
            "links": {"tmbaccommodations_stage_lnk": []},
            "stage_links": [{"tmbaccommodation_id": 1, "tmb_stage_id": 3}]
        });
        let parsed: TableBackup = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.total_rows, 0);
        assert_eq!(parsed.link_row_count(), 0);
    }

    #[test]
    fn timestamps_accept_offsets_and_naive_forms() {
        let utc = parse_timestamp("2025-11-06T22:24:31+01:00").unwrap();
        assert_eq!(utc.to_rfc3339(), "2025-11-06T21:24:31+00:00");
        assert!(parse_timestamp("2025-11-06T22:24:31").is_ok());
        assert!(parse_timestamp("2025-11-06 22:24:31.5").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn spatial_columns_export_as_ewkt() {
        assert_eq!(row_json_expr("t", &[]).unwrap(), "to_jsonb(t)");
        assert_eq!(
            row_json_expr("t", &["track".to_string()]).unwrap(),
            "to_jsonb(t) || jsonb_build_object('track', ST_AsEWKT(t.\"track\"))"
        );
        assert!(row_json_expr("t", &["bad'name".to_string()]).is_err());
    }

    #[test]
    fn read_json_reports_missing_file() {
        let err = read_json::<Snapshot>(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("not readable"));
    }

    #[test]
    fn counts_accommodations_with_stage() {
        let export = TmbExport {
            export_date: Utc::now(),
            tmb_stages: vec![],
            tmb_accommodations: vec![
                json!({"id": 1, "stage_id": 4}),
                json!({"id": 2, "stage_id": null}),
                json!({"id": 3}),
            ],
        };
        assert_eq!(with_stage_count(&export), 1);
    }
}
