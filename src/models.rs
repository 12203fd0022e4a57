//! Core data models for media reconciliation.
//!
//! This module contains the records that flow between the decoder, the dedup
//! store, the timestamp matcher, the ledger and the coordinator.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::hashing::{hash_file, ContentHash, HashAlgorithm};

/// Identifier of one export run (usually the export directory name).
pub type RunId = String;

// ============================================================================
// Timestamps
// ============================================================================

/// A point in time recorded for a file or message before anything touched it.
///
/// There is no `Default` and no way to build one from a path other than
/// [`CapturedFile::capture`], so a timestamp read after a copy cannot sneak
/// into matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CapturedTimestamp {
    epoch_secs: i64,
    nanos: u32,
}

impl CapturedTimestamp {
    fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                epoch_secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                // Before 1970: floor towards negative infinity
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nanos = 0;
                if d.subsec_nanos() > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - d.subsec_nanos();
                }
                Self { epoch_secs: secs, nanos }
            }
        }
    }

    /// Timestamp recorded by the export itself (a message date, a metadata field).
    pub fn from_recorded(dt: DateTime<Utc>) -> Self {
        Self {
            epoch_secs: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }

    pub fn from_epoch_secs(secs: i64) -> Self {
        Self {
            epoch_secs: secs,
            nanos: 0,
        }
    }

    pub fn epoch_secs(&self) -> i64 {
        self.epoch_secs
    }

    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Whole-second bucket used by the timestamp matcher.
    pub fn bucket(&self) -> i64 {
        self.epoch_secs
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.epoch_secs >= 0 {
            UNIX_EPOCH + Duration::new(self.epoch_secs as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.epoch_secs.unsigned_abs()) + Duration::from_nanos(self.nanos as u64)
        }
    }

    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.epoch_secs, self.nanos).single()
    }

    /// `YYYY-MM-DD HH:MM:SS UTC`, the format every export platform agrees on.
    pub fn format_utc(&self) -> String {
        match self.to_utc() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => format!("@{}", self.epoch_secs),
        }
    }
}

// ============================================================================
// Files
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tiff", "tif", "dng", "avif",
];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "webm", "mkv", "m4v"];

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

/// `(path, length, original timestamp)` read from the filesystem before any
/// copy or rewrite. Passed by value through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    path: PathBuf,
    len: u64,
    captured: CapturedTimestamp,
}

impl CapturedFile {
    /// Read size and modification time. Must run before the file is copied.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta.modified()?;
        Ok(Self {
            path: path.to_path_buf(),
            len: meta.len(),
            captured: CapturedTimestamp::from_system_time(modified),
        })
    }

    /// For files whose original moment comes from the export's own records
    /// rather than from filesystem metadata.
    pub fn from_recorded(path: PathBuf, len: u64, captured: CapturedTimestamp) -> Self {
        Self { path, len, captured }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn captured(&self) -> CapturedTimestamp {
        self.captured
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_path(&self.path)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A physical file discovered on disk, with its content hash computed on demand.
#[derive(Debug)]
pub struct MediaAsset {
    file: CapturedFile,
    hash: OnceLock<ContentHash>,
}

impl MediaAsset {
    pub fn new(file: CapturedFile) -> Self {
        Self {
            file,
            hash: OnceLock::new(),
        }
    }

    pub fn file(&self) -> &CapturedFile {
        &self.file
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    /// Memoized content hash. The first algorithm used wins the memo slot; a
    /// request for a different algorithm is computed but not cached.
    pub fn content_hash(&self, algorithm: HashAlgorithm) -> io::Result<ContentHash> {
        if let Some(existing) = self.hash.get() {
            if existing.algorithm() == algorithm {
                return Ok(existing.clone());
            }
            return hash_file(self.path(), algorithm).map(|(h, _)| h);
        }
        let (hash, _) = hash_file(self.path(), algorithm)?;
        Ok(self.hash.get_or_init(|| hash).clone())
    }

    pub fn cached_hash(&self) -> Option<&ContentHash> {
        self.hash.get()
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRef {
    pub id: String,
    pub title: Option<String>,
    pub kind: ConversationKind,
}

/// Text as the message store keeps it: a plain column, a serialized
/// rich-text blob, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageText {
    pub plain: Option<String>,
    pub blob: Option<Vec<u8>>,
}

/// Explicit pointer from a message to a media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRef {
    /// Identifier as stored by the platform (attachment filename, media id)
    pub id: String,
    /// Resolved location inside the export, when the file exists
    pub path: Option<PathBuf>,
}

/// One record from a message store.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: String,
    pub sender: String,
    pub is_from_me: bool,
    pub conversation: ConversationRef,
    pub timestamp: Option<CapturedTimestamp>,
    pub text: MessageText,
    /// Empty when the store has no explicit references
    pub media_refs: Vec<MediaRef>,
    /// The store says media belongs to this message even without references
    pub expects_media: bool,
}

impl RawMessage {
    pub fn has_explicit_media(&self) -> bool {
        !self.media_refs.is_empty()
    }

    pub fn needs_fuzzy_match(&self) -> bool {
        self.media_refs.is_empty() && self.expects_media
    }
}

/// Message side of an association record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageContext {
    pub run: RunId,
    pub message_id: String,
    pub conversation_id: String,
    pub conversation_title: Option<String>,
    pub conversation_kind: ConversationKind,
    pub sender: String,
    pub is_from_me: bool,
    pub timestamp: Option<String>,
    pub text: Option<String>,
}

// ============================================================================
// Dedup occurrences
// ============================================================================

/// Where an occurrence came from, supplied by the caller at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccurrenceContext {
    pub run: RunId,
    pub conversation: Option<String>,
    pub sender: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<CapturedTimestamp>,
}

impl OccurrenceContext {
    pub fn for_run(run: &str) -> Self {
        Self {
            run: run.to_string(),
            ..Self::default()
        }
    }
}

/// One sighting of a canonical asset's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub run: RunId,
    pub path: PathBuf,
    pub conversation: Option<String>,
    pub sender: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<String>,
}

impl Occurrence {
    pub fn new(path: &Path, ctx: OccurrenceContext) -> Self {
        Self {
            run: ctx.run,
            path: path.to_path_buf(),
            conversation: ctx.conversation,
            sender: ctx.sender,
            message_id: ctx.message_id,
            timestamp: ctx.timestamp.map(|t| t.format_utc()),
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// Final association between one unique piece of media and one context.
/// Consumed by the tag-writing stage.
#[derive(Debug, Clone, Serialize)]
pub struct AssociationRecord {
    pub canonical_media_hash: ContentHash,
    /// Where the single physical copy lives (source path when nothing was copied)
    pub canonical_path: PathBuf,
    /// The input file this record accounts for
    pub media_path: PathBuf,
    pub media_kind: Option<MediaKind>,
    pub message_context: Option<MessageContext>,
    pub overlay_path: Option<PathBuf>,
    pub is_duplicate: bool,
    pub occurrence_list: Vec<Occurrence>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters accumulated across all runs.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileStats {
    pub runs: usize,
    pub messages: usize,
    pub messages_with_explicit_media: usize,
    pub messages_fuzzy_matched: usize,
    pub decode_failures: usize,

    pub media_inputs: usize,
    pub overlay_inputs: usize,
    pub unreadable_inputs: usize,

    pub explicit_associations: usize,
    pub fuzzy_associations: usize,
    pub context_free_records: usize,
    pub overlays_paired: usize,
    /// Files referenced by more than one message; only the first keeps the file
    pub shared_references: usize,

    pub unique_contents: usize,
    pub duplicate_registrations: usize,
    pub registration_failures: usize,

    pub files_copied: usize,
    pub bytes_copied: u64,
    pub copy_failures: usize,

    pub ambiguity_groups: usize,
    pub orphans: usize,
}

impl ReconcileStats {
    /// Share of media inputs that ended up in an association record.
    pub fn association_rate(&self) -> f64 {
        let inputs = self.media_inputs + self.unreadable_inputs;
        if inputs == 0 {
            0.0
        } else {
            let associated = self.explicit_associations + self.fuzzy_associations + self.context_free_records;
            100.0 * associated as f64 / inputs as f64
        }
    }

    /// Log stats to stderr in JSON format
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS:{}]\n{}", phase, json);
        }
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ignores_subsecond() {
        let a = CapturedTimestamp::from_system_time(UNIX_EPOCH + Duration::from_millis(1_000_100));
        let b = CapturedTimestamp::from_system_time(UNIX_EPOCH + Duration::from_millis(1_000_900));
        assert_eq!(a.bucket(), 1000);
        assert_eq!(a.bucket(), b.bucket());
        assert_ne!(a, b);
    }

    #[test]
    fn test_pre_epoch_floors() {
        let t = CapturedTimestamp::from_system_time(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!(t.epoch_secs(), -2);
        assert_eq!(t.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn test_system_time_round_trip() {
        let t = CapturedTimestamp::from_system_time(UNIX_EPOCH + Duration::new(1_600_000_000, 42));
        assert_eq!(CapturedTimestamp::from_system_time(t.to_system_time()), t);
        let before = CapturedTimestamp::from_system_time(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!(CapturedTimestamp::from_system_time(before.to_system_time()), before);
    }

    #[test]
    fn test_format_utc() {
        let t = CapturedTimestamp::from_epoch_secs(1_700_000_000);
        assert_eq!(t.format_utc(), "2023-11-14 22:13:20 UTC");
    }

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_1.HEIC")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("clip.MOV")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("notes.pdf")), None);
        assert_eq!(MediaKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_capture_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        fs::write(&path, b"jpegbytes").unwrap();
        let captured = CapturedFile::capture(&path).unwrap();
        assert_eq!(captured.len(), 9);
        assert_eq!(captured.file_name(), "photo.jpg");
        assert_eq!(captured.kind(), Some(MediaKind::Image));
    }

    #[test]
    fn test_media_asset_memoizes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"first").unwrap();
        let asset = MediaAsset::new(CapturedFile::capture(&path).unwrap());
        let h1 = asset.content_hash(HashAlgorithm::Fx).unwrap();
        // Changing the file afterwards does not change the memoized value
        fs::write(&path, b"second").unwrap();
        let h2 = asset.content_hash(HashAlgorithm::Fx).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(asset.cached_hash(), Some(&h1));
    }

    #[test]
    fn test_message_needs_fuzzy_match() {
        let mut msg = RawMessage {
            id: "1".into(),
            sender: "alice".into(),
            is_from_me: false,
            conversation: ConversationRef {
                id: "c".into(),
                title: None,
                kind: ConversationKind::Dm,
            },
            timestamp: None,
            text: MessageText::default(),
            media_refs: Vec::new(),
            expects_media: true,
        };
        assert!(msg.needs_fuzzy_match());
        msg.media_refs.push(MediaRef {
            id: "x.jpg".into(),
            path: None,
        });
        assert!(!msg.needs_fuzzy_match());
        assert!(msg.has_explicit_media());
    }
}
