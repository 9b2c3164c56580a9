//! Link-table repair for the draft/published row pairs of TMB content.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{info, warn};

use crate::database_ops::content::{quote_ident, ContentType, STAGE_LINK};
use crate::database_ops::db::Db;
use crate::database_ops::inspect::{draft_status, DraftStatus};
use crate::database_ops::snapshot::{backup_content, output_path, timestamped_name, write_json};
use crate::util::prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMapping {
    pub draft_id: i64,
    pub published_id: i64,
    pub stage_number: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub total_links: i64,
    pub unique_accommodations: i64,
    pub unique_stages: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RelinkReport {
    pub mappings: usize,
    pub repointed: u64,
    pub links_deleted: u64,
    pub links_created: u64,
    pub draft_pointers_left: i64,
    pub published_links: LinkStats,
    pub backup_file: Option<PathBuf>,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPair {
    pub document_id: String,
    pub draft_id: i64,
    pub published_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub candidates: Vec<(i64, i64)>,
    pub synced: u64,
    pub remaining: usize,
    pub applied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub before: DraftStatus,
    pub after: Option<DraftStatus>,
    pub drafts_set: u64,
    pub planned: usize,
}

impl NormalizeReport {
    /// One draft (`locale` and `published_at` NULL) per document.
    pub fn matches_draft_publish_pattern(&self) -> bool {
        self.after
            .as_ref()
            .map(|s| s.null_locale == s.unique_documents && s.null_published == s.unique_documents)
            .unwrap_or(false)
    }
}

/// For documents with exactly two rows the lower id is the draft.
pub fn pair_variants(rows: &[(String, i64)]) -> Vec<VariantPair> {
    let mut by_doc: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for (doc, id) in rows {
        by_doc.entry(doc.as_str()).or_default().push(*id);
    }
    by_doc
        .into_iter()
        .filter(|(_, ids)| ids.len() == 2)
        .map(|(doc, mut ids)| {
            ids.sort_unstable();
            VariantPair {
                document_id: doc.to_string(),
                draft_id: ids[0],
                published_id: ids[1],
            }
        })
        .collect()
}

/// `(draft_id, stage_id)` links to add: drafts with no link copy every link
/// of their published sibling.
pub fn plan_draft_links(pairs: &[VariantPair], links: &HashMap<i64, Vec<i64>>) -> Vec<(i64, i64)> {
    let mut out = Vec::new();
    for pair in pairs {
        let draft_has = links.get(&pair.draft_id).map(|v| !v.is_empty()).unwrap_or(false);
        if draft_has {
            continue;
        }
        if let Some(stages) = links.get(&pair.published_id) {
            out.extend(stages.iter().map(|s| (pair.draft_id, *s)));
        }
    }
    out
}

/// Lowest id of every document with more than one row.
pub fn drafts_to_normalize(rows: &[(String, i64)]) -> Vec<i64> {
    let mut by_doc: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for (doc, id) in rows {
        by_doc.entry(doc.as_str()).or_default().push(*id);
    }
    by_doc
        .into_values()
        .filter(|ids| ids.len() > 1)
        .filter_map(|ids| ids.into_iter().min())
        .collect()
}

pub async fn stage_draft_to_published(db: &Db) -> Result<Vec<StageMapping>> {
    let rows = sqlx::query(
        "SELECT DISTINCT ON (d.id) d.id::bigint AS draft_id, p.id::bigint AS published_id, \
                p.stage_number::int AS stage_number \
         FROM tmb_stages d \
         JOIN tmb_stages p ON d.stage_number = p.stage_number \
         WHERE d.published_at IS NULL AND p.published_at IS NOT NULL \
         ORDER BY d.id, p.published_at DESC, p.id DESC",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await
    .context("map draft stages to published stages")?;
    Ok(rows
        .into_iter()
        .map(|r| StageMapping {
            draft_id: r.get("draft_id"),
            published_id: r.get("published_id"),
            stage_number: r.get("stage_number"),
        })
        .collect())
}

pub async fn published_pointing_at_drafts(db: &Db) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM tmbaccommodations a JOIN tmb_stages s ON a.stage_id = s.id \
         WHERE a.published_at IS NOT NULL AND s.published_at IS NULL",
    )
    .persistent(false)
    .fetch_one(&db.pool)
    .await?;
    Ok(n)
}

/// Link stats; `published_only` restricts to published-to-published links.
pub async fn link_stats(db: &Db, published_only: bool) -> Result<LinkStats> {
    let sql = if published_only {
        "SELECT count(*) AS total, count(DISTINCT l.tmbaccommodation_id) AS accs, count(DISTINCT l.tmb_stage_id) AS stages \
         FROM tmbaccommodations_stage_lnk l \
         JOIN tmbaccommodations a ON l.tmbaccommodation_id = a.id \
         JOIN tmb_stages s ON l.tmb_stage_id = s.id \
         WHERE a.published_at IS NOT NULL AND s.published_at IS NOT NULL"
    } else {
        "SELECT count(*) AS total, count(DISTINCT tmbaccommodation_id) AS accs, count(DISTINCT tmb_stage_id) AS stages \
         FROM tmbaccommodations_stage_lnk"
    };
    let row = sqlx::query(sql).persistent(false).fetch_one(&db.pool).await?;
    Ok(LinkStats {
        total_links: row.get("total"),
        unique_accommodations: row.get("accs"),
        unique_stages: row.get("stages"),
    })
}

/// Repoint accommodations from draft stages to published stages and rebuild
/// the stage link table from published rows. `tmbaccommodations` and its
/// links are written to a backup file before anything changes.
pub async fn fix_stage_links(
    db: &Db,
    dry_run: bool,
    assume_yes: bool,
    out_dir: Option<&Path>,
) -> Result<RelinkReport> {
    let mappings = stage_draft_to_published(db).await?;
    let mut report = RelinkReport {
        mappings: mappings.len(),
        ..Default::default()
    };
    info!(mappings = mappings.len(), "draft->published stage mappings");

    if dry_run {
        for m in &mappings {
            let n: i64 = sqlx::query_scalar("SELECT count(*) FROM tmbaccommodations WHERE stage_id = $1")
                .persistent(false)
                .bind(m.draft_id)
                .fetch_one(&db.pool)
                .await?;
            if n > 0 {
                info!(
                    stage = ?m.stage_number,
                    draft_id = m.draft_id,
                    published_id = m.published_id,
                    rows = n,
                    "dry-run: would repoint accommodations"
                );
            }
            report.repointed += n as u64;
        }
        report.draft_pointers_left = published_pointing_at_drafts(db).await?;
        report.published_links = link_stats(db, true).await?;
        return Ok(report);
    }

    let question = format!(
        "Repoint accommodations for {} draft stages and rebuild {}?",
        mappings.len(),
        STAGE_LINK.table
    );
    if !prompt::confirm(&question, assume_yes)? {
        println!("Cancelled. No changes made.");
        return Ok(report);
    }
    let content = ContentType::resolve("tmbaccommodations")?;
    let backup = backup_content(db, &content).await?;
    let path = output_path(out_dir, &timestamped_name("tmbaccommodations_backup", "json"));
    write_json(&path, &backup)?;
    info!(path = %path.display(), rows = backup.total_rows, "backup written");
    report.backup_file = Some(path);

    let mut tx = db.pool.begin().await?;
    for m in &mappings {
        let res = sqlx::query("UPDATE tmbaccommodations SET stage_id = $1 WHERE stage_id = $2")
            .persistent(false)
            .bind(m.published_id)
            .bind(m.draft_id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() > 0 {
            info!(
                stage = ?m.stage_number,
                draft_id = m.draft_id,
                published_id = m.published_id,
                rows = res.rows_affected(),
                "repointed accommodations"
            );
        }
        report.repointed += res.rows_affected();
    }

    let link_table = quote_ident(STAGE_LINK.table)?;
    report.links_deleted = sqlx::query(&format!("DELETE FROM {link_table}"))
        .persistent(false)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    report.links_created = sqlx::query(&format!(
        "INSERT INTO {link_table} (tmbaccommodation_id, tmb_stage_id) \
         SELECT a.id, a.stage_id FROM tmbaccommodations a JOIN tmb_stages s ON a.stage_id = s.id \
         WHERE a.published_at IS NOT NULL AND a.stage_id IS NOT NULL AND s.published_at IS NOT NULL \
         ON CONFLICT DO NOTHING"
    ))
    .persistent(false)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    report.applied = true;
    info!(
        repointed = report.repointed,
        deleted = report.links_deleted,
        created = report.links_created,
        "stage links rebuilt"
    );

    report.draft_pointers_left = published_pointing_at_drafts(db).await?;
    if report.draft_pointers_left > 0 {
        warn!(left = report.draft_pointers_left, "published accommodations still point at draft stages");
    }
    report.published_links = link_stats(db, true).await?;
    Ok(report)
}

async fn document_ids(db: &Db, table: &str) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(&format!(
        "SELECT document_id::text AS document_id, id::bigint AS id FROM {} WHERE document_id IS NOT NULL ORDER BY id",
        quote_ident(table)?
    ))
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("document_id"), r.get("id")))
        .collect())
}

async fn stage_links_by_owner(db: &Db) -> Result<HashMap<i64, Vec<i64>>> {
    let rows = sqlx::query(
        "SELECT tmbaccommodation_id::bigint AS owner, tmb_stage_id::bigint AS stage \
         FROM tmbaccommodations_stage_lnk WHERE tmbaccommodation_id IS NOT NULL AND tmb_stage_id IS NOT NULL",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;
    let mut map: HashMap<i64, Vec<i64>> = HashMap::new();
    for r in rows {
        map.entry(r.get("owner")).or_default().push(r.get("stage"));
    }
    Ok(map)
}

/// Give each draft accommodation the stage links of its published sibling.
pub async fn sync_draft_links(db: &Db, dry_run: bool) -> Result<SyncReport> {
    let pairs = pair_variants(&document_ids(db, "tmbaccommodations").await?);
    let links = stage_links_by_owner(db).await?;
    let candidates = plan_draft_links(&pairs, &links);
    info!(pairs = pairs.len(), candidates = candidates.len(), "draft link sync planned");

    let mut report = SyncReport {
        candidates,
        ..Default::default()
    };
    if dry_run || report.candidates.is_empty() {
        report.remaining = report.candidates.len();
        return Ok(report);
    }

    let mut tx = db.pool.begin().await?;
    for (draft_id, stage_id) in &report.candidates {
        let res = sqlx::query(
            "INSERT INTO tmbaccommodations_stage_lnk (tmbaccommodation_id, tmb_stage_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .persistent(false)
        .bind(draft_id)
        .bind(stage_id)
        .execute(&mut *tx)
        .await?;
        report.synced += res.rows_affected();
    }
    tx.commit().await?;
    report.applied = true;

    let links = stage_links_by_owner(db).await?;
    report.remaining = plan_draft_links(&pairs, &links).len();
    info!(synced = report.synced, remaining = report.remaining, "draft links synced");
    Ok(report)
}

/// Make the lowest id of each multi-row document the draft variant.
pub async fn normalize_drafts(
    db: &Db,
    content: &ContentType,
    dry_run: bool,
    assume_yes: bool,
) -> Result<NormalizeReport> {
    let before = draft_status(db, &content.table).await?;
    let drafts = drafts_to_normalize(&document_ids(db, &content.table).await?);
    let mut report = NormalizeReport {
        before,
        planned: drafts.len(),
        ..Default::default()
    };
    if dry_run || drafts.is_empty() {
        return Ok(report);
    }
    let question = format!(
        "Set locale=NULL and published_at=NULL on {} rows of {}?",
        drafts.len(),
        content.table
    );
    if !prompt::confirm(&question, assume_yes)? {
        println!("Cancelled. No changes made.");
        return Ok(report);
    }

    let sql = format!(
        "UPDATE {} SET locale = NULL, published_at = NULL WHERE id = $1",
        quote_ident(&content.table)?
    );
    let mut tx = db.pool.begin().await?;
    for (i, id) in drafts.iter().enumerate() {
        report.drafts_set += sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if (i + 1) % 10 == 0 {
            info!(done = i + 1, total = drafts.len(), "fixing draft versions");
        }
    }
    tx.commit().await?;
    report.after = Some(draft_status(db, &content.table).await?);
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageVersion {
    pub id: i64,
    pub document_id: Option<String>,
    pub stage_number: Option<i32>,
    pub published: bool,
}

/// One `tmb_stages` document after pairing: every id gets `document_id` and a
/// NULL locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDocumentFix {
    pub stage_number: i32,
    pub ids: Vec<i64>,
    pub document_id: String,
    pub generated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StageDocumentReport {
    pub fixes: Vec<StageDocumentFix>,
    /// Stage numbers with more than two rows; left for `dedupe`.
    pub skipped: Vec<(i32, usize)>,
    pub rows_updated: u64,
    pub after: Option<DraftStatus>,
    pub applied: bool,
}

/// Stable 24-hex-char document id for a stage that never had one.
pub fn stage_document_id(stage_number: i32) -> String {
    let digest = Sha256::digest(format!("tmb_stage_{stage_number}").as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(24);
    hex
}

/// Pair stage rows by `stage_number`. A pair takes the published row's
/// document id; a stage with no id anywhere gets `stage_document_id`.
/// Rows without a stage number are ignored.
pub fn plan_stage_documents(rows: &[StageVersion]) -> (Vec<StageDocumentFix>, Vec<(i32, usize)>) {
    let mut by_stage: BTreeMap<i32, Vec<&StageVersion>> = BTreeMap::new();
    for row in rows {
        if let Some(n) = row.stage_number {
            by_stage.entry(n).or_default().push(row);
        }
    }
    let mut fixes = Vec::new();
    let mut skipped = Vec::new();
    for (stage_number, mut group) in by_stage {
        if group.len() > 2 {
            skipped.push((stage_number, group.len()));
            continue;
        }
        group.sort_by_key(|r| r.id);
        let existing = group
            .iter()
            .filter(|r| r.published)
            .chain(group.iter().filter(|r| !r.published))
            .find_map(|r| r.document_id.clone());
        let (document_id, generated) = match existing {
            Some(id) => (id, false),
            None => (stage_document_id(stage_number), true),
        };
        fixes.push(StageDocumentFix {
            stage_number,
            ids: group.iter().map(|r| r.id).collect(),
            document_id,
            generated,
        });
    }
    (fixes, skipped)
}

async fn stage_versions(db: &Db) -> Result<Vec<StageVersion>> {
    let rows = sqlx::query(
        "SELECT id::bigint AS id, document_id::text AS document_id, stage_number::int AS stage_number, \
                (published_at IS NOT NULL) AS published \
         FROM tmb_stages ORDER BY stage_number, id",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await
    .context("load tmb_stages")?;
    Ok(rows
        .into_iter()
        .map(|r| StageVersion {
            id: r.get("id"),
            document_id: r.get("document_id"),
            stage_number: r.get("stage_number"),
            published: r.get("published"),
        })
        .collect())
}

/// Give each stage's draft and published rows one shared document id and a
/// NULL locale.
pub async fn fix_stage_documents(db: &Db, dry_run: bool, assume_yes: bool) -> Result<StageDocumentReport> {
    let (fixes, skipped) = plan_stage_documents(&stage_versions(db).await?);
    for (stage, rows) in &skipped {
        warn!(stage, rows, "more than two rows for stage; run dedupe first");
    }
    info!(
        stages = fixes.len(),
        generated = fixes.iter().filter(|f| f.generated).count(),
        "stage documents planned"
    );
    let mut report = StageDocumentReport {
        fixes,
        skipped,
        ..Default::default()
    };
    if dry_run || report.fixes.is_empty() {
        return Ok(report);
    }
    let question = format!("Update document_id and locale on {} stages?", report.fixes.len());
    if !prompt::confirm(&question, assume_yes)? {
        println!("Cancelled. No changes made.");
        return Ok(report);
    }

    let mut tx = db.pool.begin().await?;
    for fix in &report.fixes {
        let res = sqlx::query("UPDATE tmb_stages SET document_id = $1, locale = NULL WHERE id = ANY($2)")
            .persistent(false)
            .bind(&fix.document_id)
            .bind(&fix.ids)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update stage {}", fix.stage_number))?;
        report.rows_updated += res.rows_affected();
    }
    tx.commit().await?;
    report.applied = true;
    report.after = Some(draft_status(db, "tmb_stages").await?);
    info!(rows = report.rows_updated, "stage documents fixed");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(rows: &[(&str, i64)]) -> Vec<(String, i64)> {
        rows.iter().map(|(d, i)| (d.to_string(), *i)).collect()
    }

    #[test]
    fn pairs_only_two_row_documents() {
        let rows = docs(&[("a", 12), ("a", 3), ("b", 5), ("c", 7), ("c", 8), ("c", 9)]);
        let pairs = pair_variants(&rows);
        assert_eq!(
            pairs,
            vec![VariantPair {
                document_id: "a".into(),
                draft_id: 3,
                published_id: 12
            }]
        );
    }

    #[test]
    fn drafts_without_links_copy_published_links() {
        let pairs = vec![
            VariantPair { document_id: "a".into(), draft_id: 1, published_id: 2 },
            VariantPair { document_id: "b".into(), draft_id: 3, published_id: 4 },
            VariantPair { document_id: "c".into(), draft_id: 5, published_id: 6 },
        ];
        let mut links = HashMap::new();
        links.insert(2, vec![20]);
        links.insert(3, vec![30]);
        links.insert(4, vec![31]);
        links.insert(6, vec![40, 41]);
        let planned = plan_draft_links(&pairs, &links);
        assert_eq!(planned, vec![(1, 20), (5, 40), (5, 41)]);
    }

    #[test]
    fn normalizes_lowest_id_per_document() {
        let rows = docs(&[("a", 4), ("a", 2), ("b", 9), ("c", 11), ("c", 10), ("c", 12)]);
        assert_eq!(drafts_to_normalize(&rows), vec![2, 10]);
    }

    fn stage(id: i64, doc: Option<&str>, n: Option<i32>, published: bool) -> StageVersion {
        StageVersion {
            id,
            document_id: doc.map(str::to_string),
            stage_number: n,
            published,
        }
    }

    #[test]
    fn generated_stage_ids_are_stable() {
        let a = stage_document_id(3);
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, stage_document_id(3));
        assert_ne!(a, stage_document_id(4));
    }

    #[test]
    fn stage_pairs_share_the_published_document_id() {
        let rows = vec![
            stage(1, Some("draftdoc"), Some(1), false),
            stage(2, Some("pubdoc"), Some(1), true),
            stage(3, None, Some(2), false),
            stage(4, None, Some(2), true),
            stage(5, Some("solo"), Some(3), true),
            stage(6, None, None, false),
            stage(7, None, Some(4), false),
            stage(8, None, Some(4), false),
            stage(9, None, Some(4), true),
        ];
        let (fixes, skipped) = plan_stage_documents(&rows);
        assert_eq!(skipped, vec![(4, 3)]);
        assert_eq!(fixes.len(), 3);

        assert_eq!(fixes[0].ids, vec![1, 2]);
        assert_eq!(fixes[0].document_id, "pubdoc");
        assert!(!fixes[0].generated);

        assert_eq!(fixes[1].ids, vec![3, 4]);
        assert_eq!(fixes[1].document_id, stage_document_id(2));
        assert!(fixes[1].generated);

        assert_eq!(fixes[2].ids, vec![5]);
        assert_eq!(fixes[2].document_id, "solo");
    }

    #[test]
    fn draft_document_id_used_when_published_has_none() {
        let rows = vec![stage(10, None, Some(7), true), stage(11, Some("d7"), Some(7), false)];
        let (fixes, _) = plan_stage_documents(&rows);
        assert_eq!(fixes[0].document_id, "d7");
        assert_eq!(fixes[0].ids, vec![10, 11]);
    }

    #[test]
    fn pattern_check_needs_after_state() {
        let mut report = NormalizeReport::default();
        assert!(!report.matches_draft_publish_pattern());
        report.after = Some(DraftStatus {
            table: "tmbaccommodations".into(),
            total: 164,
            unique_documents: 82,
            null_locale: 82,
            null_published: 82,
            ..Default::default()
        });
        assert!(report.matches_draft_publish_pattern());
    }
}
