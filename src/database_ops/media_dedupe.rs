//! Remove byte-identical image uploads, keeping the shortest file name.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::util::prompt;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSet {
    pub digest: String,
    pub keep: PathBuf,
    pub remove: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaDedupeReport {
    pub scanned: usize,
    pub duplicate_sets: Vec<DuplicateSet>,
    pub removed: usize,
    pub errors: usize,
}

impl MediaDedupeReport {
    pub fn planned_removals(&self) -> usize {
        self.duplicate_sets.iter().map(|s| s.remove.len()).sum()
    }
}

pub fn uploads_dir(root: &Path) -> PathBuf {
    root.join("public").join("uploads")
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

pub fn file_digest(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest -> image paths under `dir`. Unreadable entries are counted in the
/// second value and skipped.
pub fn scan(dir: &Path) -> (BTreeMap<String, Vec<PathBuf>>, usize, usize) {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut scanned = 0usize;
    let mut errors = 0usize;
    for entry in WalkDir::new(dir).follow_links(false).min_depth(1).max_depth(MAX_DEPTH) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "walk failed");
                errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        match file_digest(entry.path()) {
            Ok(digest) => {
                scanned += 1;
                groups.entry(digest).or_default().push(entry.into_path());
            }
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "hash failed");
                errors += 1;
            }
        }
    }
    (groups, scanned, errors)
}

fn name_len(p: &Path) -> usize {
    p.file_name().map(|n| n.len()).unwrap_or(usize::MAX)
}

/// For every digest seen more than once: keep the shortest file name, ties
/// broken by full path.
pub fn plan(groups: BTreeMap<String, Vec<PathBuf>>) -> Vec<DuplicateSet> {
    groups
        .into_iter()
        .filter(|(_, files)| files.len() > 1)
        .map(|(digest, mut files)| {
            files.sort_by(|a, b| name_len(a).cmp(&name_len(b)).then_with(|| a.cmp(b)));
            let keep = files.remove(0);
            DuplicateSet { digest, keep, remove: files }
        })
        .collect()
}

/// Scan and remove duplicates. Nothing is removed until the operator agrees
/// (or `assume_yes` is set).
pub fn run(root: &Path, dry_run: bool, assume_yes: bool) -> Result<MediaDedupeReport> {
    run_with(root, dry_run, |n| {
        prompt::confirm(&format!("Remove {n} duplicate files?"), assume_yes)
    })
}

/// `run` with the confirmation step supplied by the caller. `confirm` gets the
/// number of files about to be removed.
pub fn run_with<F>(root: &Path, dry_run: bool, confirm: F) -> Result<MediaDedupeReport>
where
    F: FnOnce(usize) -> Result<bool>,
{
    let dir = uploads_dir(root);
    if !dir.is_dir() {
        bail!("directory {} does not exist", dir.display());
    }
    info!(dir = %dir.display(), "scanning for image files");
    let (groups, scanned, errors) = scan(&dir);
    let mut report = MediaDedupeReport {
        scanned,
        duplicate_sets: plan(groups),
        errors,
        ..Default::default()
    };

    for (i, set) in report.duplicate_sets.iter().enumerate() {
        println!("Duplicate set {} (hash: {}...):", i + 1, &set.digest[..8]);
        println!("  Keeping: {}", set.keep.display());
        for path in &set.remove {
            println!("  Duplicate: {}", path.display());
        }
    }
    let planned = report.planned_removals();
    if dry_run || planned == 0 {
        if dry_run {
            println!("Dry run: {planned} files would be removed.");
        }
        return Ok(report);
    }
    if !confirm(planned)? {
        println!("Cancelled. No files removed.");
        return Ok(report);
    }

    for path in report.duplicate_sets.iter().flat_map(|s| s.remove.iter()) {
        match std::fs::remove_file(path).with_context(|| format!("remove {}", path.display())) {
            Ok(()) => {
                println!("Removed: {}", path.display());
                report.removed += 1;
            }
            Err(err) => {
                warn!(error = %err, "remove failed");
                report.errors += 1;
            }
        }
    }
    info!(
        scanned = report.scanned,
        sets = report.duplicate_sets.len(),
        removed = report.removed,
        errors = report.errors,
        "media dedupe finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn uploads() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let dir = uploads_dir(root.path());
        fs::create_dir_all(dir.join("2024")).unwrap();
        (root, dir)
    }

    #[test]
    fn image_extensions_any_case() {
        assert!(is_image(Path::new("a/b/photo.JPG")));
        assert!(is_image(Path::new("photo.Jpeg")));
        assert!(is_image(Path::new("photo.png")));
        assert!(!is_image(Path::new("photo.webp")));
        assert!(!is_image(Path::new("README")));
    }

    #[test]
    fn plan_keeps_shortest_then_lexicographic() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "aa".to_string(),
            vec![
                PathBuf::from("u/refuge_1234.jpg"),
                PathBuf::from("u/b.jpg"),
                PathBuf::from("u/a.jpg"),
            ],
        );
        groups.insert("bb".to_string(), vec![PathBuf::from("u/only.png")]);
        let sets = plan(groups);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].keep, PathBuf::from("u/a.jpg"));
        assert_eq!(
            sets[0].remove,
            vec![PathBuf::from("u/b.jpg"), PathBuf::from("u/refuge_1234.jpg")]
        );
    }

    #[test]
    fn dry_run_leaves_files() {
        let (root, dir) = uploads();
        fs::write(dir.join("hut.jpg"), b"same bytes").unwrap();
        fs::write(dir.join("2024").join("hut_large.JPG"), b"same bytes").unwrap();
        fs::write(dir.join("other.png"), b"different").unwrap();
        fs::write(dir.join("notes.txt"), b"same bytes").unwrap();

        let report = run(root.path(), true, false).unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.duplicate_sets.len(), 1);
        assert_eq!(report.planned_removals(), 1);
        assert_eq!(report.removed, 0);
        assert!(dir.join("2024").join("hut_large.JPG").exists());
    }

    #[test]
    fn removes_longer_names() {
        let (root, dir) = uploads();
        fs::write(dir.join("hut.jpg"), b"same bytes").unwrap();
        fs::write(dir.join("2024").join("hut_large.jpg"), b"same bytes").unwrap();

        let report = run(root.path(), false, true).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.errors, 0);
        assert!(dir.join("hut.jpg").exists());
        assert!(!dir.join("2024").join("hut_large.jpg").exists());
    }

    #[test]
    fn declining_removes_nothing() {
        let (root, dir) = uploads();
        fs::write(dir.join("hut.jpg"), b"same bytes").unwrap();
        fs::write(dir.join("hut_copy.jpg"), b"same bytes").unwrap();

        let mut asked = None;
        let report = run_with(root.path(), false, |n| {
            asked = Some(n);
            Ok(false)
        })
        .unwrap();
        assert_eq!(asked, Some(1));
        assert_eq!(report.planned_removals(), 1);
        assert_eq!(report.removed, 0);
        assert!(dir.join("hut_copy.jpg").exists());
    }

    #[test]
    fn nothing_to_remove_skips_the_question() {
        let (root, dir) = uploads();
        fs::write(dir.join("a.png"), b"one").unwrap();
        fs::write(dir.join("b.png"), b"two").unwrap();
        let report = run_with(root.path(), false, |_| panic!("should not ask")).unwrap();
        assert_eq!(report.scanned, 2);
        assert!(report.duplicate_sets.is_empty());
    }

    #[test]
    fn missing_uploads_dir_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = run(root.path(), true, false).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
