//! Output side of reconciliation: the tag-writer seam and the JSONL manifest.
//!
//! Writing metadata into media containers is out of scope for this crate; a
//! [`TagWriter`] gets a fixed set of fields per canonical file and reports
//! success or failure. [`SidecarTagWriter`] is the bundled implementation and
//! writes the fields as a JSON file next to the canonical copy.

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ledger::Ledger;
use crate::models::AssociationRecord;

pub const MANIFEST_FILE: &str = "associations.jsonl";

/// Everything a tag writer is given. Fixed; writers may ignore fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagFields {
    pub captured: Option<String>,
    pub description: Option<String>,
    pub sender: Option<String>,
    pub conversation: Option<String>,
    pub source_run: Option<String>,
    pub content_hash: String,
}

impl TagFields {
    pub fn from_record(record: &AssociationRecord) -> Self {
        let ctx = record.message_context.as_ref();
        Self {
            captured: ctx.and_then(|c| c.timestamp.clone()),
            description: ctx.and_then(|c| c.text.clone()),
            sender: ctx.map(|c| c.sender.clone()),
            conversation: ctx.map(|c| c.conversation_title.clone().unwrap_or_else(|| c.conversation_id.clone())),
            source_run: ctx.map(|c| c.run.clone()),
            content_hash: record.canonical_media_hash.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_none()
            && self.description.is_none()
            && self.sender.is_none()
            && self.conversation.is_none()
    }
}

#[derive(Debug, Error)]
pub enum TagWriteError {
    #[error("target missing: {0}")]
    MissingTarget(PathBuf),
    #[error("write failed for {path}: {message}")]
    Write { path: PathBuf, message: String },
}

pub trait TagWriter {
    fn write_tags(&mut self, target: &Path, fields: &TagFields) -> Result<(), TagWriteError>;
}

/// Writes `<file>.json` beside each target.
#[derive(Debug, Default)]
pub struct SidecarTagWriter {
    written: usize,
}

impl SidecarTagWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn sidecar_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_os_string();
        name.push(".json");
        PathBuf::from(name)
    }
}

impl TagWriter for SidecarTagWriter {
    fn write_tags(&mut self, target: &Path, fields: &TagFields) -> Result<(), TagWriteError> {
        if !target.is_file() {
            return Err(TagWriteError::MissingTarget(target.to_path_buf()));
        }
        let path = Self::sidecar_path(target);
        crate::ledger::write_json_atomic(&path, fields).map_err(|e| TagWriteError::Write {
            path: path.clone(),
            message: format!("{:#}", e),
        })?;
        self.written += 1;
        Ok(())
    }
}

/// Tag every canonical file once. Records sharing a canonical path are
/// written for the first one only. Failures go to the ledger.
pub fn write_associations<W: TagWriter>(
    records: &[AssociationRecord],
    writer: &mut W,
    ledger: &mut Ledger,
) -> usize {
    let mut seen: FxHashSet<&Path> = FxHashSet::default();
    let mut written = 0;
    for record in records {
        if !seen.insert(record.canonical_path.as_path()) {
            continue;
        }
        let fields = TagFields::from_record(record);
        if fields.is_empty() {
            continue;
        }
        let run = fields.source_run.clone().unwrap_or_default();
        match writer.write_tags(&record.canonical_path, &fields) {
            Ok(()) => written += 1,
            Err(e) => {
                eprintln!("[WARN] tag write failed: {}", e);
                ledger.record_processing_failure(&run, "tags", Some(record.canonical_path.as_path()), e.to_string());
            }
        }
    }
    written
}

/// One JSON object per line.
pub struct ManifestWriter {
    path: PathBuf,
    tmp: PathBuf,
    out: BufWriter<File>,
    count: usize,
}

impl ManifestWriter {
    /// Lines go to `<path>.tmp` until [`ManifestWriter::finish`] renames it.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Create {}", parent.display()))?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        let file = File::create(&tmp).with_context(|| format!("Create {}", tmp.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp,
            out: BufWriter::new(file),
            count: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.out.flush()?;
        drop(self.out);
        fs::rename(&self.tmp, &self.path)
            .with_context(|| format!("Rename {} -> {}", self.tmp.display(), self.path.display()))?;
        Ok((self.path, self.count))
    }
}

/// Write every record to `<output>/associations.jsonl`.
pub fn write_manifest(output_dir: &Path, records: &[AssociationRecord]) -> Result<PathBuf> {
    let mut writer = ManifestWriter::create(&output_dir.join(MANIFEST_FILE))?;
    for record in records {
        writer.write(record)?;
    }
    let (path, _) = writer.finish()?;
    Ok(path)
}
