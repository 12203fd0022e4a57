//! Failure and orphan ledger.
//!
//! Append-only record of everything reconciliation could not resolve: media
//! without a message, messages whose media never showed up, ambiguity groups,
//! rich-text decode failures and processing failures. Nothing recorded here is
//! ever resolved automatically; the report is the hand-off to a human.

use anyhow::{Context, Result};
use any_ascii::any_ascii;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::models::{CapturedTimestamp, RunId};
use crate::typedstream::DecodeError;

pub const ISSUES_DIR: &str = "issues";
pub const REPORT_FILE: &str = "failure-report.json";
pub const NEEDS_MATCHING_DIR: &str = "needs-matching";

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    /// Media file with no message or record pointing at it
    UnmatchedMedia,
    /// Overlay with no media in its bucket
    UnmatchedOverlay,
    /// Message expects media that is not in the export
    MissingMedia,
    /// Message expects media but no file shares its timestamp
    UnmatchedMessage,
    /// File could not be read or hashed
    Unreadable,
    /// Digest already taken by content of a different length
    HashCollision,
}

impl OrphanKind {
    /// True when the orphan is a physical input file.
    pub fn is_media_item(self) -> bool {
        matches!(
            self,
            OrphanKind::UnmatchedMedia
                | OrphanKind::UnmatchedOverlay
                | OrphanKind::Unreadable
                | OrphanKind::HashCollision
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrphanKind::UnmatchedMedia => "unmatched_media",
            OrphanKind::UnmatchedOverlay => "unmatched_overlay",
            OrphanKind::MissingMedia => "missing_media",
            OrphanKind::UnmatchedMessage => "unmatched_message",
            OrphanKind::Unreadable => "unreadable",
            OrphanKind::HashCollision => "hash_collision",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanEntry {
    pub run: RunId,
    pub kind: OrphanKind,
    pub reason: String,
    pub path: Option<PathBuf>,
    /// Best known timestamp, formatted UTC
    pub timestamp: Option<String>,
    pub conversation: Option<String>,
    pub sender: Option<String>,
    pub message_id: Option<String>,
    pub size: Option<u64>,
}

impl OrphanEntry {
    pub fn new(run: &str, kind: OrphanKind, reason: impl Into<String>) -> Self {
        Self {
            run: run.to_string(),
            kind,
            reason: reason.into(),
            path: None,
            timestamp: None,
            conversation: None,
            sender: None,
            message_id: None,
            size: None,
        }
    }

    pub fn with_path(mut self, path: &Path, size: Option<u64>) -> Self {
        self.path = Some(path.to_path_buf());
        self.size = size;
        self
    }

    pub fn with_timestamp(mut self, ts: Option<CapturedTimestamp>) -> Self {
        self.timestamp = ts.map(|t| t.format_utc());
        self
    }

    pub fn with_message(mut self, message_id: &str, conversation: &str, sender: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self.conversation = Some(conversation.to_string());
        self.sender = Some(sender.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityKind {
    MessageMedia,
    MediaOverlay,
}

impl AmbiguityKind {
    /// Review directory names for the two sides.
    pub fn side_names(self) -> (&'static str, &'static str) {
        match self {
            AmbiguityKind::MessageMedia => ("messages", "media"),
            AmbiguityKind::MediaOverlay => ("media", "overlays"),
        }
    }
}

/// One competing item as a reviewer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
    pub label: String,
    pub path: Option<PathBuf>,
    pub size: Option<u64>,
    /// Message that claimed this file before it landed in the group
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguityGroupEntry {
    pub run: RunId,
    pub kind: AmbiguityKind,
    pub bucket: i64,
    pub timestamp: String,
    pub a_items: Vec<ReviewItem>,
    pub b_items: Vec<ReviewItem>,
}

impl AmbiguityGroupEntry {
    pub fn len(&self) -> usize {
        self.a_items.len() + self.b_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a_items.is_empty() && self.b_items.is_empty()
    }

    pub fn hint(&self) -> String {
        let (a, b) = self.kind.side_names();
        format!(
            "{} {} and {} {} share the second {}; pair them by hand",
            self.a_items.len(),
            a,
            self.b_items.len(),
            b,
            self.timestamp
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeFailureEntry {
    pub run: RunId,
    pub message_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingFailure {
    pub run: RunId,
    pub stage: String,
    pub path: Option<PathBuf>,
    pub reason: String,
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub total_failures: usize,
    pub orphaned_media: usize,
    pub orphaned_messages: usize,
    pub ambiguity_groups: usize,
    pub ambiguous_items: usize,
    pub decode_failures: usize,
    pub processing_failures: usize,
    pub by_kind: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunFailures {
    pub source: Option<PathBuf>,
    pub orphans: Vec<OrphanEntry>,
    pub ambiguity_groups: Vec<AmbiguityGroupEntry>,
    pub decode_failures: Vec<DecodeFailureEntry>,
    pub processing_failures: Vec<ProcessingFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub processor: &'static str,
    pub generated_at: String,
    pub summary: FailureSummary,
    pub runs: BTreeMap<RunId, RunFailures>,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Default)]
pub struct Ledger {
    sources: BTreeMap<RunId, PathBuf>,
    orphans: Vec<OrphanEntry>,
    ambiguity_groups: Vec<AmbiguityGroupEntry>,
    decode_failures: Vec<DecodeFailureEntry>,
    processing_failures: Vec<ProcessingFailure>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&mut self, run: &str, source: &Path) {
        self.sources.insert(run.to_string(), source.to_path_buf());
    }

    pub fn record_orphan(&mut self, entry: OrphanEntry) {
        self.orphans.push(entry);
    }

    pub fn record_ambiguity(&mut self, entry: AmbiguityGroupEntry) {
        self.ambiguity_groups.push(entry);
    }

    pub fn record_decode_failure(&mut self, run: &str, message_id: &str, error: &DecodeError) {
        self.decode_failures.push(DecodeFailureEntry {
            run: run.to_string(),
            message_id: message_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn record_processing_failure(&mut self, run: &str, stage: &str, path: Option<&Path>, reason: impl Into<String>) {
        self.processing_failures.push(ProcessingFailure {
            run: run.to_string(),
            stage: stage.to_string(),
            path: path.map(Path::to_path_buf),
            reason: reason.into(),
        });
    }

    pub fn orphans(&self) -> &[OrphanEntry] {
        &self.orphans
    }

    pub fn ambiguity_groups(&self) -> &[AmbiguityGroupEntry] {
        &self.ambiguity_groups
    }

    pub fn decode_failures(&self) -> &[DecodeFailureEntry] {
        &self.decode_failures
    }

    pub fn processing_failures(&self) -> &[ProcessingFailure] {
        &self.processing_failures
    }

    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
            && self.ambiguity_groups.is_empty()
            && self.decode_failures.is_empty()
            && self.processing_failures.is_empty()
    }

    pub fn summary(&self) -> FailureSummary {
        let mut by_kind = BTreeMap::new();
        for o in &self.orphans {
            *by_kind.entry(o.kind.as_str()).or_insert(0) += 1;
        }
        let orphaned_media = self.orphans.iter().filter(|o| o.kind.is_media_item()).count();
        let ambiguous_items = self.ambiguity_groups.iter().map(|g| g.len()).sum();
        FailureSummary {
            total_failures: self.orphans.len()
                + self.ambiguity_groups.len()
                + self.decode_failures.len()
                + self.processing_failures.len(),
            orphaned_media,
            orphaned_messages: self.orphans.len() - orphaned_media,
            ambiguity_groups: self.ambiguity_groups.len(),
            ambiguous_items,
            decode_failures: self.decode_failures.len(),
            processing_failures: self.processing_failures.len(),
            by_kind,
        }
    }

    /// Aggregate counts plus the full unresolved listing, grouped by run.
    pub fn report(&self) -> FailureReport {
        let mut runs: BTreeMap<RunId, RunFailures> = BTreeMap::new();
        for (run, source) in &self.sources {
            runs.entry(run.clone()).or_default().source = Some(source.clone());
        }
        for o in &self.orphans {
            runs.entry(o.run.clone()).or_default().orphans.push(o.clone());
        }
        for g in &self.ambiguity_groups {
            runs.entry(g.run.clone()).or_default().ambiguity_groups.push(g.clone());
        }
        for d in &self.decode_failures {
            runs.entry(d.run.clone()).or_default().decode_failures.push(d.clone());
        }
        for p in &self.processing_failures {
            runs.entry(p.run.clone())
                .or_default()
                .processing_failures
                .push(p.clone());
        }

        FailureReport {
            processor: env!("CARGO_PKG_NAME"),
            generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            summary: self.summary(),
            runs,
        }
    }

    /// Write `issues/failure-report.json` under `output_dir`.
    pub fn write_report(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(ISSUES_DIR).join(REPORT_FILE);
        write_json_atomic(&path, &self.report())?;
        Ok(path)
    }

    /// Copy every competing file of every ambiguity group into its own review
    /// directory with a `match_info.json` describing the group.
    /// Returns the number of directories written.
    pub fn materialize_ambiguity_groups(&self, output_dir: &Path) -> Result<usize> {
        let root = output_dir.join(NEEDS_MATCHING_DIR);
        let mut seen: BTreeMap<PathBuf, usize> = BTreeMap::new();

        for group in &self.ambiguity_groups {
            let time_slug = CapturedTimestamp::from_epoch_secs(group.bucket)
                .to_utc()
                .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
                .unwrap_or_else(|| group.bucket.to_string());
            let base = root.join(sanitize_component(&group.run)).join(&time_slug);
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            let dir = root
                .join(sanitize_component(&group.run))
                .join(format!("{}_{}", time_slug, n));

            let (a_name, b_name) = group.kind.side_names();
            for (side, items) in [(a_name, &group.a_items), (b_name, &group.b_items)] {
                let side_dir = dir.join(side);
                fs::create_dir_all(&side_dir)
                    .with_context(|| format!("Create {}", side_dir.display()))?;
                for item in items {
                    if let Some(src) = &item.path {
                        copy_unique(src, &side_dir)?;
                    }
                }
            }

            let info = serde_json::json!({
                "run": group.run,
                "timestamp": group.timestamp,
                "bucket": group.bucket,
                "kind": group.kind,
                a_name: group.a_items,
                b_name: group.b_items,
                "analysis": group.hint(),
            });
            write_json_atomic(&dir.join("match_info.json"), &info)?;
        }

        Ok(self.ambiguity_groups.len())
    }

    /// Copy orphaned media into `issues/failed-matching/media/` and write the
    /// message-side orphans per run to `issues/failed-matching/metadata/`.
    /// Returns the number of files copied.
    pub fn copy_orphaned_media(&self, output_dir: &Path) -> Result<usize> {
        let base = output_dir.join(ISSUES_DIR).join("failed-matching");
        let media_dir = base.join("media");
        let metadata_dir = base.join("metadata");

        let mut copied = 0;
        for orphan in self.orphans.iter().filter(|o| o.kind.is_media_item()) {
            let Some(src) = &orphan.path else { continue };
            if !src.is_file() {
                continue;
            }
            fs::create_dir_all(&media_dir).with_context(|| format!("Create {}", media_dir.display()))?;
            copy_unique(src, &media_dir)?;
            copied += 1;
        }

        let mut by_run: BTreeMap<&str, Vec<&OrphanEntry>> = BTreeMap::new();
        for orphan in self.orphans.iter().filter(|o| !o.kind.is_media_item()) {
            by_run.entry(orphan.run.as_str()).or_default().push(orphan);
        }
        for (run, entries) in by_run {
            let path = metadata_dir.join(format!("{}.json", sanitize_component(run)));
            write_json_atomic(&path, &entries)?;
        }

        Ok(copied)
    }
}

// ============================================================================
// File helpers
// ============================================================================

/// ASCII-only, filesystem-safe single path component.
pub fn sanitize_component(s: &str) -> String {
    let ascii = any_ascii(s);
    let cleaned: String = ascii
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `dir/name`, or `dir/stem_N.ext` for the first free N.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let name = Path::new(file_name);
    let stem = name.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
    let ext = name.extension().and_then(|e| e.to_str());
    let mut n = 1;
    loop {
        let next = match ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        };
        if !next.exists() {
            return next;
        }
        n += 1;
    }
}

fn copy_unique(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let dest = unique_destination(dir, &name);
    fs::copy(src, &dest).with_context(|| format!("Copy {} -> {}", src.display(), dest.display()))?;
    Ok(dest)
}

/// Serialize to `<path>.tmp`, then rename over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let f = fs::File::create(&tmp).with_context(|| format!("Create {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, value)?;
        w.write_all(b"\n")?;
        w.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("Rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(label: &str, path: Option<PathBuf>) -> ReviewItem {
        ReviewItem {
            label: label.to_string(),
            path,
            size: None,
            message_id: None,
            sender: None,
            text: None,
        }
    }

    #[test]
    fn test_report_counts_and_runs() {
        let mut ledger = Ledger::new();
        ledger.begin_run("run-a", Path::new("/exports/a"));
        ledger.record_orphan(OrphanEntry::new("run-a", OrphanKind::UnmatchedMedia, "no message in bucket"));
        ledger.record_orphan(OrphanEntry::new("run-b", OrphanKind::MissingMedia, "attachment not exported"));
        ledger.record_decode_failure("run-a", "42", &DecodeError::InvalidHeader);
        ledger.record_processing_failure("run-b", "copy", None, "disk full");
        ledger.record_ambiguity(AmbiguityGroupEntry {
            run: "run-a".into(),
            kind: AmbiguityKind::MediaOverlay,
            bucket: 100,
            timestamp: "1970-01-01 00:01:40 UTC".into(),
            a_items: vec![item("m1", None), item("m2", None)],
            b_items: vec![item("o1", None)],
        });

        let report = ledger.report();
        assert_eq!(report.summary.total_failures, 5);
        assert_eq!(report.summary.orphaned_media, 1);
        assert_eq!(report.summary.orphaned_messages, 1);
        assert_eq!(report.summary.ambiguous_items, 3);
        assert_eq!(report.summary.by_kind["missing_media"], 1);
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs["run-a"].source.as_deref(), Some(Path::new("/exports/a")));
        assert_eq!(report.runs["run-b"].processing_failures[0].stage, "copy");
        assert!(!ledger.is_clean());
    }

    #[test]
    fn test_report_field_names_are_stable() {
        let mut ledger = Ledger::new();
        ledger.record_orphan(
            OrphanEntry::new("r", OrphanKind::UnmatchedOverlay, "alone")
                .with_path(Path::new("/x/overlay.png"), Some(10)),
        );
        let json = serde_json::to_value(ledger.report()).unwrap();
        for key in ["processor", "generated_at", "summary", "runs"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        let orphan = &json["runs"]["r"]["orphans"][0];
        assert_eq!(orphan["kind"], "unmatched_overlay");
        assert_eq!(orphan["size"], 10);
        assert_eq!(json["summary"]["total_failures"], 1);
    }

    #[test]
    fn test_write_report_is_atomic_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new();
        let path = ledger.write_report(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("issues").join("failure-report.json"));
        assert!(path.is_file());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_materialize_groups() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        for name in ["m1.mp4", "m2.mp4", "o1.png"] {
            fs::write(src.join(name), name).unwrap();
        }
        let mut ledger = Ledger::new();
        for _ in 0..2 {
            ledger.record_ambiguity(AmbiguityGroupEntry {
                run: "Snap Export".into(),
                kind: AmbiguityKind::MediaOverlay,
                bucket: 1_700_000_000,
                timestamp: "2023-11-14 22:13:20 UTC".into(),
                a_items: vec![item("m1", Some(src.join("m1.mp4"))), item("m2", Some(src.join("m2.mp4")))],
                b_items: vec![item("o1", Some(src.join("o1.png")))],
            });
        }
        let out = dir.path().join("out");
        assert_eq!(ledger.materialize_ambiguity_groups(&out).unwrap(), 2);

        let first = out.join("needs-matching").join("Snap_Export").join("20231114_221320_1");
        let second = out.join("needs-matching").join("Snap_Export").join("20231114_221320_2");
        assert!(first.join("media").join("m1.mp4").is_file());
        assert!(first.join("media").join("m2.mp4").is_file());
        assert!(first.join("overlays").join("o1.png").is_file());
        assert!(second.join("match_info.json").is_file());

        let info: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(first.join("match_info.json")).unwrap()).unwrap();
        assert_eq!(info["media"].as_array().unwrap().len(), 2);
        assert_eq!(info["overlays"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_copy_orphaned_media_with_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("IMG.jpg"), b"one").unwrap();
        fs::write(b.join("IMG.jpg"), b"two").unwrap();

        let mut ledger = Ledger::new();
        for p in [a.join("IMG.jpg"), b.join("IMG.jpg")] {
            ledger.record_orphan(OrphanEntry::new("r", OrphanKind::UnmatchedMedia, "alone").with_path(&p, Some(3)));
        }
        ledger.record_orphan(
            OrphanEntry::new("r", OrphanKind::UnmatchedMessage, "no media").with_message("7", "chat", "bob"),
        );

        let out = dir.path().join("out");
        assert_eq!(ledger.copy_orphaned_media(&out).unwrap(), 2);
        let media = out.join("issues").join("failed-matching").join("media");
        assert_eq!(fs::read(media.join("IMG.jpg")).unwrap(), b"one");
        assert_eq!(fs::read(media.join("IMG_1.jpg")).unwrap(), b"two");
        assert!(out.join("issues/failed-matching/metadata/r.json").is_file());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Café Chat/2024"), "Cafe_Chat_2024");
        assert_eq!(sanitize_component("..."), "_");
        assert_eq!(sanitize_component("ok-name_1"), "ok-name_1");
    }
}
