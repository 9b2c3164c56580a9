//! Read-only reports: table counts, column listings, draft/publish status and
//! the TMB stage/accommodation picture.
use std::fmt::Write as _;

use anyhow::{Context, Result};
use sqlx::Row;
use tracing::warn;

use crate::database_ops::content::{quote_ident, validate_ident};
use crate::database_ops::db::{is_missing_schema, Db};
use crate::database_ops::relink::{link_stats, published_pointing_at_drafts, LinkStats};

pub const TMB_SUMMARY_TABLES: &[&str] = &[
    "tmb_stages",
    "tmbaccommodations",
    "tmbaccommodations_stage_lnk",
    "tmbaccommodations_cmps",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    pub table: String,
    pub rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftStatus {
    pub table: String,
    pub total: i64,
    pub unique_documents: i64,
    pub null_document_id: i64,
    pub null_locale: i64,
    pub null_published: i64,
    pub published: i64,
    pub drafts: i64,
    /// `(document_id, locale, rows)` for groups with more than one row.
    pub duplicate_groups: Vec<(String, Option<String>, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageRow {
    pub id: i64,
    pub stage_number: Option<i32>,
    pub name: Option<String>,
    pub locale: String,
    pub published: bool,
    pub distance_km: Option<f64>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
    pub accommodations: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccommodationStages {
    pub id: i64,
    pub name: Option<String>,
    pub stage_numbers: Vec<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct TmbSummary {
    /// `None` when the table does not exist.
    pub totals: Vec<(String, Option<i64>)>,
    pub stages: Vec<StageRow>,
    pub sample_accommodations: Vec<AccommodationStages>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccommodationStage {
    pub id: i64,
    pub name: Option<String>,
    pub stage_id: Option<i64>,
    pub stage_number: Option<i32>,
    pub stage_published: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct StageCheck {
    pub published_accommodations: Vec<AccommodationStage>,
    pub links: LinkStats,
    pub sample_links: Vec<(i64, i64)>,
    pub published_to_draft: i64,
    pub stages: Vec<StageRow>,
}

#[derive(Debug, Clone, Default)]
pub struct TableCounts {
    pub counts: Vec<TableCount>,
    /// Tables whose names cannot be quoted; listed but not counted.
    pub skipped: Vec<String>,
}

/// Split catalogue names into countable ones and ones `quote_ident` rejects.
pub fn countable_tables(tables: Vec<String>) -> (Vec<String>, Vec<String>) {
    tables.into_iter().partition(|t| validate_ident(t).is_ok())
}

/// Row counts for every public table; empty tables only with `include_empty`.
pub async fn table_counts(db: &Db, include_empty: bool) -> Result<TableCounts> {
    let (tables, skipped) = countable_tables(db.list_public_tables().await?);
    for table in &skipped {
        warn!(%table, "table name cannot be quoted; not counted");
    }
    let mut counts = Vec::new();
    for table in tables {
        let rows = db.count_rows(&table).await?;
        if rows > 0 || include_empty {
            counts.push(TableCount { table, rows });
        }
    }
    Ok(TableCounts { counts, skipped })
}

pub fn render_table_counts(report: &TableCounts) -> String {
    let mut out = String::new();
    let counts = &report.counts;
    let width = counts.iter().map(|c| c.table.len()).max().unwrap_or(5).max(5);
    writeln!(out, "{:<width$}  {:>10}", "table", "rows").ok();
    for c in counts {
        writeln!(out, "{:<width$}  {:>10}", c.table, c.rows).ok();
    }
    let total: i64 = counts.iter().map(|c| c.rows).sum();
    writeln!(out, "{} tables, {} rows", counts.len(), total).ok();
    for table in &report.skipped {
        writeln!(out, "skipped (unsupported name): {table}").ok();
    }
    out
}

pub async fn describe_table(db: &Db, table: &str) -> Result<Vec<ColumnInfo>> {
    let rows = sqlx::query(
        "SELECT column_name::text AS name, data_type::text AS data_type, \
                (is_nullable = 'YES') AS nullable, column_default::text AS dflt \
         FROM information_schema.columns WHERE table_schema='public' AND table_name=$1 \
         ORDER BY ordinal_position",
    )
    .persistent(false)
    .bind(table)
    .fetch_all(&db.pool)
    .await
    .with_context(|| format!("describe {table}"))?;
    Ok(rows
        .into_iter()
        .map(|r| ColumnInfo {
            name: r.get("name"),
            data_type: r.get("data_type"),
            nullable: r.get("nullable"),
            default: r.get("dflt"),
        })
        .collect())
}

pub fn render_columns(table: &str, cols: &[ColumnInfo]) -> String {
    let mut out = String::new();
    if cols.is_empty() {
        writeln!(out, "{table}: table not found").ok();
        return out;
    }
    writeln!(out, "{table} ({} columns)", cols.len()).ok();
    for c in cols {
        let null = if c.nullable { "NULL" } else { "NOT NULL" };
        match &c.default {
            Some(d) => {
                writeln!(out, "  {:<32} {:<28} {:<8} default {d}", c.name, c.data_type, null).ok();
            }
            None => {
                writeln!(out, "  {:<32} {:<28} {}", c.name, c.data_type, null).ok();
            }
        }
    }
    out
}

pub async fn draft_status(db: &Db, table: &str) -> Result<DraftStatus> {
    let qtable = quote_ident(table)?;
    let row = sqlx::query(&format!(
        "SELECT count(*) AS total, \
                count(DISTINCT document_id) AS docs, \
                count(*) FILTER (WHERE document_id IS NULL) AS null_doc, \
                count(*) FILTER (WHERE locale IS NULL) AS null_locale, \
                count(*) FILTER (WHERE published_at IS NULL) AS null_pub, \
                count(*) FILTER (WHERE published_at IS NOT NULL) AS published \
         FROM {qtable}"
    ))
    .persistent(false)
    .fetch_one(&db.pool)
    .await
    .with_context(|| format!("draft status of {table}"))?;

    let groups = sqlx::query(&format!(
        "SELECT document_id::text AS document_id, locale::text AS locale, count(*) AS n FROM {qtable} \
         WHERE document_id IS NOT NULL \
         GROUP BY document_id, locale HAVING count(*) > 1 \
         ORDER BY count(*) DESC, document_id"
    ))
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;

    let null_published: i64 = row.get("null_pub");
    Ok(DraftStatus {
        table: table.to_string(),
        total: row.get("total"),
        unique_documents: row.get("docs"),
        null_document_id: row.get("null_doc"),
        null_locale: row.get("null_locale"),
        null_published,
        published: row.get("published"),
        drafts: null_published,
        duplicate_groups: groups
            .into_iter()
            .map(|r| (r.get("document_id"), r.get("locale"), r.get("n")))
            .collect(),
    })
}

pub fn render_draft_status(s: &DraftStatus) -> String {
    let mut out = String::new();
    writeln!(out, "{}", s.table).ok();
    writeln!(out, "  total rows:          {}", s.total).ok();
    writeln!(out, "  unique documents:    {}", s.unique_documents).ok();
    writeln!(out, "  published:           {}", s.published).ok();
    writeln!(out, "  drafts:              {}", s.drafts).ok();
    writeln!(out, "  NULL document_id:    {}", s.null_document_id).ok();
    writeln!(out, "  NULL locale:         {}", s.null_locale).ok();
    if s.duplicate_groups.is_empty() {
        writeln!(out, "  no duplicate (document_id, locale) groups").ok();
    } else {
        writeln!(out, "  {} duplicate (document_id, locale) groups:", s.duplicate_groups.len()).ok();
        for (doc, locale, n) in s.duplicate_groups.iter().take(20) {
            writeln!(out, "    {doc} / {}: {n} rows", locale.as_deref().unwrap_or("NULL")).ok();
        }
    }
    out
}

async fn stage_rows(db: &Db) -> Result<Vec<StageRow>> {
    let rows = sqlx::query(
        "SELECT s.id::bigint AS id, s.stage_number::int AS stage_number, s.name::text AS name, \
                coalesce(s.locale, 'en')::text AS locale, (s.published_at IS NOT NULL) AS published, \
                s.distance_km::float8 AS distance_km, s.elevation_gain::float8 AS elevation_gain, \
                s.elevation_loss::float8 AS elevation_loss, count(l.tmbaccommodation_id) AS accs \
         FROM tmb_stages s \
         LEFT JOIN tmbaccommodations_stage_lnk l ON l.tmb_stage_id = s.id \
         GROUP BY s.id \
         ORDER BY s.stage_number NULLS LAST, s.id",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await
    .context("load tmb_stages")?;
    Ok(rows
        .into_iter()
        .map(|r| StageRow {
            id: r.get("id"),
            stage_number: r.get("stage_number"),
            name: r.get("name"),
            locale: r.get("locale"),
            published: r.get("published"),
            distance_km: r.get("distance_km"),
            elevation_gain: r.get("elevation_gain"),
            elevation_loss: r.get("elevation_loss"),
            accommodations: r.get("accs"),
        })
        .collect())
}

pub async fn tmb_summary(db: &Db) -> Result<TmbSummary> {
    let mut summary = TmbSummary::default();
    for table in TMB_SUMMARY_TABLES {
        let n = match db.count_rows(table).await {
            Ok(n) => Some(n),
            Err(e) if is_missing_schema(&e) => None,
            Err(e) => return Err(e),
        };
        summary.totals.push((table.to_string(), n));
    }
    if summary.totals.iter().take(3).any(|(_, n)| n.is_none()) {
        return Ok(summary);
    }
    summary.stages = stage_rows(db).await?;

    let rows = sqlx::query(
        "SELECT a.id::bigint AS id, a.name::text AS name, \
                coalesce(array_agg(DISTINCT s.stage_number::int) FILTER (WHERE s.stage_number IS NOT NULL), '{}') AS stages \
         FROM tmbaccommodations a \
         LEFT JOIN tmbaccommodations_stage_lnk l ON l.tmbaccommodation_id = a.id \
         LEFT JOIN tmb_stages s ON s.id = l.tmb_stage_id \
         WHERE a.published_at IS NOT NULL \
         GROUP BY a.id, a.name \
         ORDER BY a.name \
         LIMIT 10",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;
    summary.sample_accommodations = rows
        .into_iter()
        .map(|r| AccommodationStages {
            id: r.get("id"),
            name: r.get("name"),
            stage_numbers: r.get("stages"),
        })
        .collect();
    Ok(summary)
}

fn fmt_opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_else(|| "-".into())
}

fn render_stages(out: &mut String, stages: &[StageRow]) {
    writeln!(out, "  {:>5} {:>6} {:<4} {:<10} {:>8} {:>7} {:>7} {:>5}  name", "id", "stage", "loc", "status", "km", "up", "down", "accs").ok();
    for s in stages {
        let status = if s.published { "published" } else { "draft" };
        writeln!(
            out,
            "  {:>5} {:>6} {:<4} {:<10} {:>8} {:>7} {:>7} {:>5}  {}",
            s.id,
            fmt_opt(&s.stage_number),
            s.locale,
            status,
            fmt_opt(&s.distance_km),
            fmt_opt(&s.elevation_gain),
            fmt_opt(&s.elevation_loss),
            s.accommodations,
            s.name.as_deref().unwrap_or("")
        )
        .ok();
    }
}

pub fn render_tmb_summary(s: &TmbSummary) -> String {
    let mut out = String::new();
    writeln!(out, "Totals:").ok();
    for (table, n) in &s.totals {
        match n {
            Some(n) => {
                writeln!(out, "  {table}: {n}").ok();
            }
            None => {
                writeln!(out, "  {table}: (missing)").ok();
            }
        }
    }
    if !s.stages.is_empty() {
        writeln!(out, "\nStages:").ok();
        render_stages(&mut out, &s.stages);
    }
    if !s.sample_accommodations.is_empty() {
        writeln!(out, "\nPublished accommodations (first 10):").ok();
        for a in &s.sample_accommodations {
            let stages = if a.stage_numbers.is_empty() {
                "no stage".to_string()
            } else {
                a.stage_numbers.iter().map(i32::to_string).collect::<Vec<_>>().join(", ")
            };
            writeln!(out, "  {:>5} {} [{stages}]", a.id, a.name.as_deref().unwrap_or("")).ok();
        }
    }
    out
}

pub async fn stage_relationship_check(db: &Db) -> Result<StageCheck> {
    let rows = sqlx::query(
        "SELECT a.id::bigint AS id, a.name::text AS name, a.stage_id::bigint AS stage_id, \
                s.stage_number::int AS stage_number, (s.published_at IS NOT NULL) AS stage_published \
         FROM tmbaccommodations a LEFT JOIN tmb_stages s ON a.stage_id = s.id \
         WHERE a.published_at IS NOT NULL ORDER BY a.id LIMIT 10",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await
    .context("load published accommodations")?;
    let published_accommodations = rows
        .into_iter()
        .map(|r| {
            let stage_id: Option<i64> = r.get("stage_id");
            let stage_published: Option<bool> = r.get("stage_published");
            AccommodationStage {
                id: r.get("id"),
                name: r.get("name"),
                stage_id,
                stage_number: r.get("stage_number"),
                stage_published: stage_id.and(stage_published),
            }
        })
        .collect();

    let sample_links = sqlx::query(
        "SELECT tmbaccommodation_id::bigint AS a, tmb_stage_id::bigint AS s \
         FROM tmbaccommodations_stage_lnk ORDER BY tmbaccommodation_id, tmb_stage_id LIMIT 10",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?
    .into_iter()
    .map(|r| (r.get("a"), r.get("s")))
    .collect();

    Ok(StageCheck {
        published_accommodations,
        links: link_stats(db, false).await?,
        sample_links,
        published_to_draft: published_pointing_at_drafts(db).await?,
        stages: stage_rows(db).await?,
    })
}

pub fn render_stage_check(c: &StageCheck) -> String {
    let mut out = String::new();
    writeln!(out, "Published accommodations and their stage:").ok();
    for a in &c.published_accommodations {
        let stage = match (a.stage_id, a.stage_published) {
            (Some(id), Some(true)) => format!("stage {} (id {id}, published)", fmt_opt(&a.stage_number)),
            (Some(id), _) => format!("stage {} (id {id}, DRAFT)", fmt_opt(&a.stage_number)),
            (None, _) => "no stage".to_string(),
        };
        writeln!(out, "  {:>5} {} -> {stage}", a.id, a.name.as_deref().unwrap_or("")).ok();
    }
    writeln!(
        out,
        "\nLink table: {} links, {} accommodations, {} stages",
        c.links.total_links, c.links.unique_accommodations, c.links.unique_stages
    )
    .ok();
    for (a, s) in &c.sample_links {
        writeln!(out, "  accommodation {a} -> stage {s}").ok();
    }
    if c.published_to_draft > 0 {
        writeln!(out, "\nWARNING: {} published accommodations point at draft stages", c.published_to_draft).ok();
    } else {
        writeln!(out, "\nNo published accommodations point at draft stages").ok();
    }
    writeln!(out, "\nStages:").ok();
    render_stages(&mut out, &c.stages);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_counts_render_with_total() {
        let report = TableCounts {
            counts: vec![
                TableCount { table: "hikes".into(), rows: 12 },
                TableCount { table: "tmbaccommodations".into(), rows: 82 },
            ],
            skipped: vec![],
        };
        let out = render_table_counts(&report);
        assert!(out.contains("tmbaccommodations          82"));
        assert!(out.ends_with("2 tables, 94 rows\n"));
    }

    #[test]
    fn odd_table_names_are_listed_not_fatal() {
        let (ok, skipped) = countable_tables(vec![
            "hikes".into(),
            "Import Log".into(),
            "trails".into(),
        ]);
        assert_eq!(ok, vec!["hikes".to_string(), "trails".to_string()]);
        assert_eq!(skipped, vec!["Import Log".to_string()]);
        let out = render_table_counts(&TableCounts { counts: vec![], skipped });
        assert!(out.contains("skipped (unsupported name): Import Log"));
    }

    #[test]
    fn missing_table_renders_as_not_found() {
        assert_eq!(render_columns("nope", &[]), "nope: table not found\n");
        let cols = vec![ColumnInfo {
            name: "id".into(),
            data_type: "integer".into(),
            nullable: false,
            default: Some("nextval('hikes_id_seq'::regclass)".into()),
        }];
        let out = render_columns("hikes", &cols);
        assert!(out.starts_with("hikes (1 columns)\n"));
        assert!(out.contains("NOT NULL"));
        assert!(out.contains("default nextval"));
    }

    #[test]
    fn draft_status_lists_null_locale_groups() {
        let s = DraftStatus {
            table: "tmbaccommodations".into(),
            total: 3,
            unique_documents: 1,
            null_locale: 2,
            null_published: 2,
            published: 1,
            drafts: 2,
            duplicate_groups: vec![("abc123".into(), None, 2)],
            ..Default::default()
        };
        let out = render_draft_status(&s);
        assert!(out.contains("1 duplicate (document_id, locale) groups"));
        assert!(out.contains("abc123 / NULL: 2 rows"));
    }

    #[test]
    fn summary_marks_missing_tables() {
        let s = TmbSummary {
            totals: vec![("tmb_stages".into(), Some(22)), ("tmbaccommodations_cmps".into(), None)],
            ..Default::default()
        };
        let out = render_tmb_summary(&s);
        assert!(out.contains("tmb_stages: 22"));
        assert!(out.contains("tmbaccommodations_cmps: (missing)"));
        assert!(!out.contains("Stages:"));
    }

    #[test]
    fn stage_check_flags_draft_targets() {
        let c = StageCheck {
            published_accommodations: vec![
                AccommodationStage {
                    id: 5,
                    name: Some("Refuge Bonatti".into()),
                    stage_id: Some(9),
                    stage_number: Some(7),
                    stage_published: Some(false),
                },
                AccommodationStage {
                    id: 6,
                    name: Some("Gîte Le Pontet".into()),
                    stage_id: None,
                    stage_number: None,
                    stage_published: None,
                },
            ],
            published_to_draft: 1,
            ..Default::default()
        };
        let out = render_stage_check(&c);
        assert!(out.contains("Refuge Bonatti -> stage 7 (id 9, DRAFT)"));
        assert!(out.contains("Gîte Le Pontet -> no stage"));
        assert!(out.contains("WARNING: 1 published accommodations point at draft stages"));
    }
}
