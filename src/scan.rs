//! Export directory scanning.
//!
//! Walks an export tree, drops NAS/thumbnail/system clutter and classifies the
//! rest. Filesystem timestamps are captured here, in the same pass that
//! discovers a file, before any later stage can copy or touch it.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{CapturedFile, MediaKind};

/// Names skipped by exact or prefix match.
pub const BANNED_PATTERNS: &[&str] = &[
    "@eaDir",
    "@__thumb",
    "SYNOFILE_THUMB_",
    "Lightroom Catalog",
    "thumbnails",
    ".DS_Store",
    "._",
    ".photostructure",
];

static OVERLAY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[_\-]overlay(?:~|[_\-.]|$)").unwrap());

static THUMBNAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[_\-]thumb(?:nail)?(?:~|[_\-.]|$)").unwrap());

#[derive(Debug, Clone)]
pub struct BannedFilter {
    patterns: Vec<String>,
}

impl Default for BannedFilter {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl BannedFilter {
    pub fn new(extra: &[String]) -> Self {
        let mut patterns: Vec<String> = BANNED_PATTERNS.iter().map(|p| p.to_string()).collect();
        for p in extra {
            if !p.is_empty() && !patterns.contains(p) {
                patterns.push(p.clone());
            }
        }
        Self { patterns }
    }

    pub fn is_banned_name(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| name == p || name.starts_with(p.as_str()))
    }

    pub fn is_banned(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.is_banned_name(n))
            .unwrap_or(false)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Media(MediaKind),
    Overlay,
    Thumbnail,
    Unsupported,
}

pub fn classify(path: &Path) -> FileRole {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return FileRole::Unsupported;
    };
    if name.starts_with('.') || name.starts_with("__") {
        return FileRole::Unsupported;
    }
    let Some(kind) = MediaKind::from_path(path) else {
        return FileRole::Unsupported;
    };
    if THUMBNAIL_PATTERN.is_match(name) {
        FileRole::Thumbnail
    } else if OVERLAY_PATTERN.is_match(name) {
        FileRole::Overlay
    } else {
        FileRole::Media(kind)
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub media: Vec<CapturedFile>,
    pub overlays: Vec<CapturedFile>,
    /// Files that were found but whose metadata could not be read
    pub unreadable: Vec<(PathBuf, String)>,
    pub skipped_banned: usize,
    pub skipped_thumbnails: usize,
    pub skipped_unsupported: usize,
}

impl ScanResult {
    pub fn total_media_items(&self) -> usize {
        self.media.len() + self.overlays.len() + self.unreadable.len()
    }
}

/// Walk `root` in file-name order and capture every media file and overlay.
/// `exclude` subtrees (e.g. the output directory) are never entered.
pub fn scan_export(root: &Path, filter: &BannedFilter, exclude: &[&Path]) -> Result<ScanResult> {
    if !root.is_dir() {
        anyhow::bail!("Export directory does not exist: {}", root.display());
    }

    let mut result = ScanResult::default();
    let banned = Cell::new(0usize);

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            if exclude.iter().any(|x| e.path() == *x) {
                return false;
            }
            if filter.is_banned(e.path()) {
                banned.set(banned.get() + 1);
                return false;
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // An unreadable subtree or a file gone mid-walk costs one item, not the export
                let path = e.path().unwrap_or(root).to_path_buf();
                result.unreadable.push((path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        match classify(path) {
            FileRole::Unsupported => result.skipped_unsupported += 1,
            FileRole::Thumbnail => result.skipped_thumbnails += 1,
            role => match CapturedFile::capture(path) {
                Ok(captured) if role == FileRole::Overlay => result.overlays.push(captured),
                Ok(captured) => result.media.push(captured),
                Err(e) => result.unreadable.push((path.to_path_buf(), e.to_string())),
            },
        }
    }

    result.skipped_banned = banned.get();
    Ok(result)
}
