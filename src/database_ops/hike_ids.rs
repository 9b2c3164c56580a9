//! Point `hikes.hike_id` at the trail whose name slug matches the hike title.
use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;
use sqlx::Row;
use tracing::{debug, info};

use crate::database_ops::db::Db;
use crate::util::prompt;

/// Title/name slugger; compile once and reuse across rows.
pub struct Slugger {
    strip: Regex,
    whitespace: Regex,
    dashes: Regex,
}

impl Slugger {
    pub fn new() -> Result<Self> {
        Ok(Self {
            strip: Regex::new(r"[^a-z0-9\s-]")?,
            whitespace: Regex::new(r"\s+")?,
            dashes: Regex::new(r"-+")?,
        })
    }

    /// Lowercase, drop punctuation, collapse whitespace and dashes to one `-`.
    pub fn slugify(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        let s = self.strip.replace_all(&lower, "");
        let s = self.whitespace.replace_all(&s, "-");
        let s = self.dashes.replace_all(&s, "-");
        s.trim_matches('-').to_string()
    }

    /// Slug -> trail id. On slug collisions the last trail wins; callers feed
    /// trails in id order so that is the highest id.
    pub fn trail_map<I>(&self, trails: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = HashMap::new();
        for (id, name) in trails {
            let slug = self.slugify(&name);
            if slug.is_empty() {
                continue;
            }
            map.insert(slug, id);
        }
        map
    }

    /// `(hike row id, trail id)` for every hike whose title slug has a trail.
    pub fn match_hikes(&self, hikes: &[(i64, String)], trails: &HashMap<String, String>) -> Vec<(i64, String)> {
        hikes
            .iter()
            .filter_map(|(id, title)| trails.get(&self.slugify(title)).map(|t| (*id, t.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemapReport {
    pub hikes: usize,
    pub trails: usize,
    pub matched: Vec<(i64, String)>,
    pub updated: u64,
    pub applied: bool,
}

pub async fn remap_hike_ids(db: &Db, dry_run: bool, assume_yes: bool) -> Result<RemapReport> {
    let trail_rows = sqlx::query("SELECT id::text AS id, name FROM trails WHERE name IS NOT NULL ORDER BY id")
        .persistent(false)
        .fetch_all(&db.pool)
        .await
        .context("load trails")?;
    let slugger = Slugger::new()?;
    let trails = slugger.trail_map(trail_rows.into_iter().map(|r| (r.get("id"), r.get("name"))));

    let hikes: Vec<(i64, String)> = sqlx::query("SELECT id::bigint AS id, title FROM hikes WHERE title IS NOT NULL ORDER BY id")
        .persistent(false)
        .fetch_all(&db.pool)
        .await
        .context("load hikes")?
        .into_iter()
        .map(|r| (r.get("id"), r.get("title")))
        .collect();

    let matched = slugger.match_hikes(&hikes, &trails);
    info!(hikes = hikes.len(), trails = trails.len(), matched = matched.len(), "hike titles matched");
    let mut report = RemapReport {
        hikes: hikes.len(),
        trails: trails.len(),
        matched,
        ..Default::default()
    };
    if dry_run || report.matched.is_empty() {
        return Ok(report);
    }
    let question = format!("Set hike_id on {} of {} hikes?", report.matched.len(), report.hikes);
    if !prompt::confirm(&question, assume_yes)? {
        println!("Cancelled. No changes made.");
        return Ok(report);
    }

    // Assign from the trails row so hike_id keeps the trail id's native type.
    let mut tx = db.pool.begin().await?;
    for (hike, trail) in &report.matched {
        let res = sqlx::query("UPDATE hikes h SET hike_id = t.id FROM trails t WHERE h.id = $1 AND t.id::text = $2")
            .persistent(false)
            .bind(hike)
            .bind(trail)
            .execute(&mut *tx)
            .await?;
        debug!(hike, trail = %trail, rows = res.rows_affected(), "hike_id set");
        report.updated += res.rows_affected();
    }
    tx.commit().await?;
    report.applied = true;
    info!(updated = report.updated, "hike ids remapped");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_titles() {
        let s = Slugger::new().unwrap();
        assert_eq!(s.slugify("Tour du Mont Blanc"), "tour-du-mont-blanc");
        assert_eq!(s.slugify("  GR20 -- North (Calenzana)  "), "gr20-north-calenzana");
        assert_eq!(s.slugify("Haute Route: Chamonix–Zermatt"), "haute-route-chamonixzermatt");
        assert_eq!(s.slugify("---"), "");
    }

    #[test]
    fn last_trail_wins_on_collision() {
        let map = Slugger::new().unwrap().trail_map(vec![
            ("7".to_string(), "Walker's Haute Route".to_string()),
            ("9".to_string(), "Walkers Haute Route".to_string()),
            ("11".to_string(), "!!!".to_string()),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map["walkers-haute-route"], "9");
    }

    #[test]
    fn unmatched_hikes_are_left_alone() {
        let s = Slugger::new().unwrap();
        let map = s.trail_map(vec![("3".to_string(), "Tour du Mont Blanc".to_string())]);
        let hikes = vec![(1, "Tour du Mont-Blanc".to_string()), (2, "West Highland Way".to_string())];
        assert_eq!(s.match_hikes(&hikes, &map), vec![(1, "3".to_string())]);
    }
}
