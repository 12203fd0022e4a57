//! Reconciliation coordinator.
//!
//! Drives one export run at a time through the pipeline:
//!
//! 1. resolve message text (plain column, then rich-text blob)
//! 2. claim media through explicit references
//! 3. pair the remaining messages and media by captured timestamp
//! 4. pair media with overlays by captured timestamp
//! 5. hash in parallel, register serially in input order
//! 6. copy each new content exactly once through a bounded worker pool
//! 7. hand everything left over to the ledger
//!
//! The dedup store and the ledger outlive the runs, so duplicates are found
//! across exports and the final report covers all of them.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ReconcileConfig;
use crate::dedup::{DedupStore, DuplicateSummary, RegisterFailure, RegisterOutcome};
use crate::hashing::ContentHash;
use crate::ledger::{
    AmbiguityGroupEntry, AmbiguityKind, Ledger, OrphanEntry, OrphanKind, ReviewItem,
};
use crate::matcher::{match_by_timestamp, Timestamped};
use crate::models::{
    AssociationRecord, CapturedFile, CapturedTimestamp, MediaAsset, MessageContext, OccurrenceContext,
    RawMessage, ReconcileStats, RunId,
};
use crate::progress::{create_progress_bar, log_progress};
use crate::scan::{scan_export, BannedFilter};
use crate::store::{chat_history_path, detect_export, load_chat_history, nfc_key, ExportKind, ImessageStore};
use crate::typedstream::resolve_text;

/// Subdirectory of the output root holding one file per unique content.
pub const MEDIA_DIR: &str = "media";

// ============================================================================
// Inputs
// ============================================================================

/// Everything one export contributes.
#[derive(Debug, Default)]
pub struct ExportRun {
    pub run_id: RunId,
    pub source: PathBuf,
    pub messages: Vec<RawMessage>,
    pub media: Vec<CapturedFile>,
    pub overlays: Vec<CapturedFile>,
    /// Files found during scanning whose metadata could not be read
    pub unreadable: Vec<(PathBuf, String)>,
}

impl ExportRun {
    pub fn new(run_id: &str, source: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            source: source.to_path_buf(),
            ..Self::default()
        }
    }

    /// Scan an export directory and read its message store, if any.
    /// Timestamps are captured by the scan, before any other stage runs.
    pub fn load(root: &Path, filter: &BannedFilter, exclude: &[&Path]) -> Result<Self> {
        let run_id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        let scan = scan_export(root, filter, exclude)?;
        let mut run = ExportRun::new(&run_id, root);

        match detect_export(root) {
            ExportKind::MacMessages | ExportKind::IphoneBackup => {
                let store = ImessageStore::open(root)?;
                let (messages, stats) = store.read_messages(filter)?;
                if stats.missing_files > 0 {
                    eprintln!(
                        "[WARN] {}: {} attachments referenced by the database are missing",
                        run_id, stats.missing_files
                    );
                }
                run.messages = messages;
            }
            ExportKind::ChatHistory => {
                run.messages = load_chat_history(&chat_history_path(root), &scan.media)?;
            }
            ExportKind::MediaOnly => {}
        }

        run.media = scan.media;
        run.overlays = scan.overlays;
        run.unreadable = scan.unreadable;
        Ok(run)
    }
}

// ============================================================================
// Per-run accounting
// ============================================================================

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub run: RunId,
    pub messages: usize,
    pub decode_failures: usize,
    /// Distinct media files, overlays and unreadable files seen in the run
    pub input_media_items: usize,
    pub records: usize,
    pub overlays_paired: usize,
    pub orphaned_media: usize,
    pub ambiguous_media: usize,
    pub orphaned_messages: usize,
    pub new_copies: usize,
    pub duplicates: usize,
}

impl RunSummary {
    /// Every input media item ended up in exactly one place.
    pub fn is_balanced(&self) -> bool {
        self.records + self.overlays_paired + self.orphaned_media + self.ambiguous_media
            == self.input_media_items
    }
}

/// What became of one media file before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Claimed by a message (explicitly or by timestamp)
    Claimed { message: usize, fuzzy: bool },
    /// No message store in this run; recorded without context
    ContextFree,
    /// Run has messages but none points here
    Unclaimed,
    /// Part of an ambiguity group
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlayState {
    Pending,
    PairedWith(usize),
    Ambiguous,
}

/// Index plus timestamp, for handing slices to the matcher.
#[derive(Debug, Clone, Copy)]
struct Slot {
    idx: usize,
    ts: Option<CapturedTimestamp>,
}

impl Timestamped for Slot {
    fn timestamp(&self) -> Option<CapturedTimestamp> {
        self.ts
    }
}

// ============================================================================
// Copy worker pool
// ============================================================================

#[derive(Debug, Clone)]
struct CopyJob {
    source: PathBuf,
    dest: PathBuf,
    captured: CapturedTimestamp,
}

#[derive(Debug)]
struct CopyOutcome {
    job: CopyJob,
    bytes: u64,
    error: Option<String>,
}

/// Copy to `<dest>.tmp`, stamp the original modification time, rename.
fn copy_preserving_time(job: &CopyJob) -> Result<u64> {
    if let Some(parent) = job.dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Create {}", parent.display()))?;
    }
    let mut tmp_name = job.dest.clone().into_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let bytes = fs::copy(&job.source, &tmp)
        .with_context(|| format!("Copy {} -> {}", job.source.display(), tmp.display()))?;
    {
        let f = fs::File::options()
            .write(true)
            .open(&tmp)
            .with_context(|| format!("Open {}", tmp.display()))?;
        f.set_modified(job.captured.to_system_time())
            .with_context(|| format!("Set mtime on {}", tmp.display()))?;
    }
    fs::rename(&tmp, &job.dest)
        .with_context(|| format!("Rename {} -> {}", tmp.display(), job.dest.display()))?;
    Ok(bytes)
}

fn copy_worker(rx: Receiver<CopyJob>, tx: Sender<CopyOutcome>) {
    while let Ok(job) = rx.recv() {
        let outcome = match copy_preserving_time(&job) {
            Ok(bytes) => CopyOutcome { job, bytes, error: None },
            Err(e) => CopyOutcome {
                error: Some(format!("{:#}", e)),
                job,
                bytes: 0,
            },
        };
        if tx.send(outcome).is_err() {
            break;
        }
    }
}

/// Run `jobs` through `workers` threads over bounded channels. Outcomes are
/// returned in job order.
fn run_copy_pool(jobs: Vec<CopyJob>, workers: usize, queue: usize) -> Result<Vec<CopyOutcome>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let total = jobs.len();
    let (job_tx, job_rx) = bounded::<CopyJob>(queue);
    let (out_tx, out_rx) = bounded::<CopyOutcome>(queue);

    let collector = std::thread::spawn(move || {
        let pb = create_progress_bar(total as u64, "Copying unique media");
        let mut outcomes = Vec::with_capacity(total);
        for outcome in out_rx.iter() {
            outcomes.push(outcome);
            pb.inc(1);
            log_progress("COPY", outcomes.len() as u64, total as u64, 1000);
        }
        pb.finish_with_message(format!("Copied {} unique files", outcomes.len()));
        outcomes
    });

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        let rx = job_rx.clone();
        let tx = out_tx.clone();
        handles.push(std::thread::spawn(move || copy_worker(rx, tx)));
    }
    drop(out_tx);
    drop(job_rx);

    let order: FxHashMap<PathBuf, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.dest.clone(), i))
        .collect();
    for job in jobs {
        if job_tx.send(job).is_err() {
            break;
        }
    }
    drop(job_tx);

    for h in handles {
        if h.join().is_err() {
            bail!("Copy worker panicked");
        }
    }
    let mut outcomes = collector
        .join()
        .map_err(|_| anyhow!("Copy collector panicked"))?;
    outcomes.sort_by_key(|o| order.get(&o.job.dest).copied().unwrap_or(usize::MAX));
    Ok(outcomes)
}

// ============================================================================
// Reconciler
// ============================================================================

/// Result of a complete reconciliation.
#[derive(Debug)]
pub struct ReconcileOutput {
    pub records: Vec<AssociationRecord>,
    pub ledger: Ledger,
    pub duplicates: DuplicateSummary,
    pub stats: ReconcileStats,
    pub summaries: Vec<RunSummary>,
}

pub struct Reconciler {
    config: ReconcileConfig,
    /// Canonical copies go under `<output>/media`; `None` records source paths
    output_dir: Option<PathBuf>,
    store: DedupStore,
    ledger: Ledger,
    records: Vec<AssociationRecord>,
    /// Where each content's single copy ended up
    canonical_outputs: FxHashMap<ContentHash, PathBuf>,
    summaries: Vec<RunSummary>,
    stats: ReconcileStats,
    cancel: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig, output_dir: Option<PathBuf>) -> Self {
        let store = DedupStore::new(config.hash_algorithm);
        Self {
            config,
            output_dir,
            store,
            ledger: Ledger::new(),
            records: Vec::new(),
            canonical_outputs: FxHashMap::default(),
            summaries: Vec::new(),
            stats: ReconcileStats::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the current run between items. Everything
    /// registered so far stays consistent.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn records(&self) -> &[AssociationRecord] {
        &self.records
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    fn destination_for(&self, hash: &ContentHash, source: &Path) -> Option<PathBuf> {
        if self.config.dry_run {
            return None;
        }
        let root = self.output_dir.as_ref()?;
        let name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", hash.digest(), ext.to_ascii_lowercase()),
            None => hash.digest().to_string(),
        };
        Some(root.join(MEDIA_DIR).join(name))
    }

    pub fn process_run(&mut self, run: ExportRun) -> Result<RunSummary> {
        if self.is_cancelled() {
            bail!("Reconciliation cancelled before run {}", run.run_id);
        }
        let ExportRun {
            run_id,
            source,
            messages,
            media,
            overlays,
            unreadable,
        } = run;

        self.ledger.begin_run(&run_id, &source);
        self.stats.runs += 1;
        self.stats.messages += messages.len();

        let mut summary = RunSummary {
            run: run_id.clone(),
            messages: messages.len(),
            ..RunSummary::default()
        };

        for (path, reason) in &unreadable {
            self.ledger.record_orphan(
                OrphanEntry::new(&run_id, OrphanKind::Unreadable, reason.clone()).with_path(path, None),
            );
            summary.orphaned_media += 1;
        }
        summary.input_media_items += unreadable.len();
        self.stats.unreadable_inputs += unreadable.len();

        // Phase 1: message text
        let texts: Vec<_> = messages
            .par_iter()
            .map(|m| resolve_text(m.text.plain.as_deref(), m.text.blob.as_deref()))
            .collect();
        for (message, resolution) in messages.iter().zip(&texts) {
            if let Some(err) = &resolution.decode_error {
                self.ledger.record_decode_failure(&run_id, &message.id, err);
                summary.decode_failures += 1;
            }
        }
        self.stats.decode_failures += summary.decode_failures;

        // Phase 2: explicit references
        let mut assets: Vec<MediaAsset> = Vec::with_capacity(media.len());
        let mut by_key: FxHashMap<String, usize> = FxHashMap::default();
        for file in media {
            let key = nfc_key(file.path());
            if by_key.contains_key(&key) {
                continue;
            }
            by_key.insert(key, assets.len());
            assets.push(MediaAsset::new(file));
        }
        // Unreadable paths are orphaned once, however many messages point at them
        let mut failed_keys: FxHashSet<String> = unreadable.iter().map(|(p, _)| nfc_key(p)).collect();

        let has_messages = !messages.is_empty();
        let mut disposition = vec![
            if has_messages {
                Disposition::Unclaimed
            } else {
                Disposition::ContextFree
            };
            assets.len()
        ];

        for (mi, message) in messages.iter().enumerate() {
            if !message.has_explicit_media() {
                continue;
            }
            self.stats.messages_with_explicit_media += 1;
            for media_ref in &message.media_refs {
                let Some(path) = &media_ref.path else {
                    self.ledger.record_orphan(
                        OrphanEntry::new(&run_id, OrphanKind::MissingMedia, format!("{} not in export", media_ref.id))
                            .with_timestamp(message.timestamp)
                            .with_message(&message.id, &message.conversation.id, &message.sender),
                    );
                    summary.orphaned_messages += 1;
                    continue;
                };

                let key = nfc_key(path);
                if failed_keys.contains(&key) {
                    self.stats.shared_references += 1;
                    continue;
                }
                let idx = match by_key.get(&key) {
                    Some(&idx) => idx,
                    None => match CapturedFile::capture(path) {
                        Ok(file) => {
                            by_key.insert(key, assets.len());
                            assets.push(MediaAsset::new(file));
                            disposition.push(Disposition::Unclaimed);
                            assets.len() - 1
                        }
                        Err(e) => {
                            failed_keys.insert(key);
                            self.ledger.record_orphan(
                                OrphanEntry::new(&run_id, OrphanKind::Unreadable, e.to_string())
                                    .with_path(path, None)
                                    .with_timestamp(message.timestamp)
                                    .with_message(&message.id, &message.conversation.id, &message.sender),
                            );
                            summary.orphaned_media += 1;
                            summary.input_media_items += 1;
                            self.stats.unreadable_inputs += 1;
                            continue;
                        }
                    },
                };

                match disposition[idx] {
                    Disposition::Claimed { .. } => self.stats.shared_references += 1,
                    _ => disposition[idx] = Disposition::Claimed { message: mi, fuzzy: false },
                }
            }
        }

        // Phase 3: messages without references against unclaimed media
        let fuzzy_messages: Vec<Slot> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.needs_fuzzy_match())
            .map(|(idx, m)| Slot { idx, ts: m.timestamp })
            .collect();
        if !fuzzy_messages.is_empty() {
            let unclaimed: Vec<Slot> = disposition
                .iter()
                .enumerate()
                .filter(|(_, d)| **d == Disposition::Unclaimed)
                .map(|(idx, _)| Slot {
                    idx,
                    ts: Some(assets[idx].file().captured()),
                })
                .collect();

            let outcome = match_by_timestamp(fuzzy_messages, unclaimed);
            for pair in outcome.matched {
                disposition[pair.b.idx] = Disposition::Claimed {
                    message: pair.a.idx,
                    fuzzy: true,
                };
                self.stats.messages_fuzzy_matched += 1;
            }
            for group in outcome.ambiguous {
                for slot in &group.b {
                    disposition[slot.idx] = Disposition::Ambiguous;
                }
                let entry = AmbiguityGroupEntry {
                    run: run_id.clone(),
                    kind: AmbiguityKind::MessageMedia,
                    bucket: group.bucket,
                    timestamp: CapturedTimestamp::from_epoch_secs(group.bucket).format_utc(),
                    a_items: group
                        .a
                        .iter()
                        .map(|s| message_review_item(&messages[s.idx], texts[s.idx].text.as_deref()))
                        .collect(),
                    b_items: group.b.iter().map(|s| file_review_item(assets[s.idx].file())).collect(),
                };
                self.ledger.record_ambiguity(entry);
                self.stats.ambiguity_groups += 1;
                summary.ambiguous_media += group.b.len();
            }
            for slot in outcome.orphans_a {
                let m = &messages[slot.idx];
                self.ledger.record_orphan(
                    OrphanEntry::new(&run_id, OrphanKind::UnmatchedMessage, "no media shares its timestamp")
                        .with_timestamp(m.timestamp)
                        .with_message(&m.id, &m.conversation.id, &m.sender),
                );
                summary.orphaned_messages += 1;
            }
            // Media left over stays Unclaimed and is orphaned below
        }

        // Phase 4: media against overlays
        let mut overlay_state = vec![OverlayState::Pending; overlays.len()];
        if !overlays.is_empty() {
            let live_media: Vec<Slot> = disposition
                .iter()
                .enumerate()
                .filter(|(_, d)| **d != Disposition::Ambiguous)
                .map(|(idx, _)| Slot {
                    idx,
                    ts: Some(assets[idx].file().captured()),
                })
                .collect();
            let overlay_slots: Vec<Slot> = overlays
                .iter()
                .enumerate()
                .map(|(idx, o)| Slot {
                    idx,
                    ts: Some(o.captured()),
                })
                .collect();

            let outcome = match_by_timestamp(live_media, overlay_slots);
            for pair in outcome.matched {
                overlay_state[pair.b.idx] = OverlayState::PairedWith(pair.a.idx);
            }
            for group in outcome.ambiguous {
                let a_items = group
                    .a
                    .iter()
                    .map(|s| {
                        let claim = match disposition[s.idx] {
                            Disposition::Claimed { message, .. } => Some(message),
                            _ => None,
                        };
                        if let Some(mi) = claim {
                            let m = &messages[mi];
                            self.ledger.record_orphan(
                                OrphanEntry::new(
                                    &run_id,
                                    OrphanKind::UnmatchedMessage,
                                    "its media is in a media/overlay ambiguity group",
                                )
                                .with_path(assets[s.idx].file().path(), Some(assets[s.idx].file().len()))
                                .with_timestamp(m.timestamp)
                                .with_message(&m.id, &m.conversation.id, &m.sender),
                            );
                            summary.orphaned_messages += 1;
                        }
                        claimed_file_review_item(
                            assets[s.idx].file(),
                            claim.map(|mi| (&messages[mi], texts[mi].text.as_deref())),
                        )
                    })
                    .collect();
                for slot in &group.a {
                    disposition[slot.idx] = Disposition::Ambiguous;
                }
                for slot in &group.b {
                    overlay_state[slot.idx] = OverlayState::Ambiguous;
                }
                let entry = AmbiguityGroupEntry {
                    run: run_id.clone(),
                    kind: AmbiguityKind::MediaOverlay,
                    bucket: group.bucket,
                    timestamp: CapturedTimestamp::from_epoch_secs(group.bucket).format_utc(),
                    a_items,
                    b_items: group.b.iter().map(|s| file_review_item(&overlays[s.idx])).collect(),
                };
                self.ledger.record_ambiguity(entry);
                self.stats.ambiguity_groups += 1;
                summary.ambiguous_media += group.len();
            }
            for slot in outcome.orphans_b {
                let o = &overlays[slot.idx];
                self.ledger.record_orphan(
                    OrphanEntry::new(&run_id, OrphanKind::UnmatchedOverlay, "no media shares its timestamp")
                        .with_path(o.path(), Some(o.len()))
                        .with_timestamp(Some(o.captured())),
                );
                summary.orphaned_media += 1;
            }
        }

        summary.input_media_items += assets.len() + overlays.len();
        self.stats.media_inputs += assets.len();
        self.stats.overlay_inputs += overlays.len();

        // Unclaimed media in a run with a message store
        for (idx, d) in disposition.iter().enumerate() {
            if *d == Disposition::Unclaimed {
                let f = assets[idx].file();
                self.ledger.record_orphan(
                    OrphanEntry::new(&run_id, OrphanKind::UnmatchedMedia, "no message refers to this file")
                        .with_path(f.path(), Some(f.len()))
                        .with_timestamp(Some(f.captured())),
                );
                summary.orphaned_media += 1;
            }
        }

        // Phase 5: hash in parallel, register serially in input order
        let recordable: Vec<usize> = disposition
            .iter()
            .enumerate()
            .filter(|(_, d)| matches!(d, Disposition::Claimed { .. } | Disposition::ContextFree))
            .map(|(idx, _)| idx)
            .collect();
        let paired_overlays: Vec<usize> = overlay_state
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, OverlayState::PairedWith(_)))
            .map(|(idx, _)| idx)
            .collect();
        let overlay_assets: Vec<MediaAsset> = overlays.into_iter().map(MediaAsset::new).collect();

        let pb = create_progress_bar(
            (recordable.len() + paired_overlays.len()) as u64,
            &format!("Hashing {}", run_id),
        );
        let store = &self.store;
        let hashed_media: Vec<_> = recordable
            .par_iter()
            .map(|&idx| {
                let h = store.hash_asset(&assets[idx]);
                pb.inc(1);
                h
            })
            .collect();
        let hashed_overlays: Vec<_> = paired_overlays
            .par_iter()
            .map(|&idx| {
                let h = store.hash_asset(&overlay_assets[idx]);
                pb.inc(1);
                h
            })
            .collect();
        pb.finish_with_message(format!("Hashed {} files", hashed_media.len() + hashed_overlays.len()));

        let mut jobs: Vec<CopyJob> = Vec::new();
        let mut run_records: Vec<AssociationRecord> = Vec::new();
        // media index -> position in run_records
        let mut record_of: FxHashMap<usize, usize> = FxHashMap::default();

        for (&idx, hashed) in recordable.iter().zip(hashed_media) {
            if self.is_cancelled() {
                bail!("Reconciliation cancelled during run {}", run_id);
            }
            let file = assets[idx].file();
            let ctx = self.occurrence_context(&run_id, &messages, disposition[idx], file);
            let outcome = match hashed {
                Ok(h) => self.store.register_hashed(h, ctx),
                Err(f) => RegisterOutcome::Failed(f),
            };
            let hash = outcome.canonical().map(|c| c.hash.clone());
            let (Some(canonical_path), Some(hash)) =
                (self.settle_registration(&run_id, outcome, file, &mut jobs, &mut summary), hash)
            else {
                summary.orphaned_media += 1;
                continue;
            };

            let message_context = match disposition[idx] {
                Disposition::Claimed { message, fuzzy } => {
                    if fuzzy {
                        self.stats.fuzzy_associations += 1;
                    } else {
                        self.stats.explicit_associations += 1;
                    }
                    Some(context_for(&run_id, &messages[message], texts[message].text.clone()))
                }
                _ => {
                    self.stats.context_free_records += 1;
                    None
                }
            };

            record_of.insert(idx, run_records.len());
            run_records.push(AssociationRecord {
                canonical_media_hash: hash,
                canonical_path,
                media_path: file.path().to_path_buf(),
                media_kind: file.kind(),
                message_context,
                overlay_path: None,
                is_duplicate: false,
                occurrence_list: Vec::new(),
            });
            summary.records += 1;
        }

        // Overlays only attach to media that made it into a record
        for (&oidx, hashed) in paired_overlays.iter().zip(hashed_overlays) {
            if self.is_cancelled() {
                bail!("Reconciliation cancelled during run {}", run_id);
            }
            let OverlayState::PairedWith(media_idx) = overlay_state[oidx] else {
                continue;
            };
            let overlay = overlay_assets[oidx].file();
            let Some(&pos) = record_of.get(&media_idx) else {
                self.ledger.record_orphan(
                    OrphanEntry::new(&run_id, OrphanKind::UnmatchedOverlay, "paired media could not be registered")
                        .with_path(overlay.path(), Some(overlay.len()))
                        .with_timestamp(Some(overlay.captured())),
                );
                summary.orphaned_media += 1;
                continue;
            };

            let ctx = self.occurrence_context(&run_id, &messages, disposition[media_idx], overlay);
            let outcome = match hashed {
                Ok(h) => self.store.register_hashed(h, ctx),
                Err(f) => RegisterOutcome::Failed(f),
            };
            match self.settle_registration(&run_id, outcome, overlay, &mut jobs, &mut summary) {
                Some(out) => {
                    run_records[pos].overlay_path = Some(out);
                    summary.overlays_paired += 1;
                    self.stats.overlays_paired += 1;
                }
                None => summary.orphaned_media += 1,
            }
        }

        // Phase 6: copy
        let outcomes = run_copy_pool(jobs, self.config.copy_workers, self.config.copy_queue)?;
        for outcome in outcomes {
            match outcome.error {
                None => {
                    self.stats.files_copied += 1;
                    self.stats.bytes_copied += outcome.bytes;
                }
                Some(reason) => {
                    self.stats.copy_failures += 1;
                    eprintln!("[WARN] copy failed: {}", reason);
                    self.ledger
                        .record_processing_failure(&run_id, "copy", Some(outcome.job.source.as_path()), reason);
                }
            }
        }

        self.records.extend(run_records);
        self.stats.orphans = self.ledger.orphans().len();
        self.stats.unique_contents = self.store.len();
        self.summaries.push(summary.clone());

        if !summary.is_balanced() {
            eprintln!(
                "[WARN] {}: accounting mismatch: {} records + {} overlays + {} orphans + {} ambiguous != {} inputs",
                summary.run,
                summary.records,
                summary.overlays_paired,
                summary.orphaned_media,
                summary.ambiguous_media,
                summary.input_media_items
            );
        }
        Ok(summary)
    }

    fn occurrence_context(
        &self,
        run: &str,
        messages: &[RawMessage],
        disposition: Disposition,
        file: &CapturedFile,
    ) -> OccurrenceContext {
        match disposition {
            Disposition::Claimed { message, .. } => {
                let m = &messages[message];
                OccurrenceContext {
                    run: run.to_string(),
                    conversation: Some(m.conversation.id.clone()),
                    sender: Some(m.sender.clone()),
                    message_id: Some(m.id.clone()),
                    timestamp: m.timestamp.or(Some(file.captured())),
                }
            }
            _ => OccurrenceContext {
                timestamp: Some(file.captured()),
                ..OccurrenceContext::for_run(run)
            },
        }
    }

    /// Turn a registration outcome into the path the record should point at,
    /// queueing a copy for new content. Failures go to the ledger.
    fn settle_registration(
        &mut self,
        run: &str,
        outcome: RegisterOutcome,
        file: &CapturedFile,
        jobs: &mut Vec<CopyJob>,
        summary: &mut RunSummary,
    ) -> Option<PathBuf> {
        match outcome {
            RegisterOutcome::New(canonical) => {
                summary.new_copies += 1;
                let out = match self.destination_for(&canonical.hash, &canonical.path) {
                    Some(dest) => {
                        jobs.push(CopyJob {
                            source: canonical.path.clone(),
                            dest: dest.clone(),
                            captured: canonical.captured,
                        });
                        dest
                    }
                    None => canonical.path.clone(),
                };
                self.canonical_outputs.insert(canonical.hash.clone(), out.clone());
                Some(out)
            }
            RegisterOutcome::Duplicate(canonical) => {
                summary.duplicates += 1;
                self.stats.duplicate_registrations += 1;
                Some(
                    self.canonical_outputs
                        .get(&canonical.hash)
                        .cloned()
                        .unwrap_or_else(|| canonical.path.clone()),
                )
            }
            RegisterOutcome::Failed(failure) => {
                self.stats.registration_failures += 1;
                let kind = match &failure {
                    RegisterFailure::Unreadable { .. } => OrphanKind::Unreadable,
                    RegisterFailure::HashCollision { .. } => {
                        eprintln!("[WARN] {}", failure);
                        OrphanKind::HashCollision
                    }
                };
                self.ledger.record_orphan(
                    OrphanEntry::new(run, kind, failure.to_string())
                        .with_path(file.path(), Some(file.len()))
                        .with_timestamp(Some(file.captured())),
                );
                None
            }
        }
    }

    /// Fill occurrence lists from the final index and hand everything back.
    pub fn finish(self) -> ReconcileOutput {
        let Reconciler {
            store,
            ledger,
            mut records,
            summaries,
            mut stats,
            ..
        } = self;

        for record in &mut records {
            let occurrences = store.occurrences(&record.canonical_media_hash);
            record.is_duplicate = occurrences.len() > 1;
            record.occurrence_list = occurrences;
        }
        stats.unique_contents = store.len();
        stats.orphans = ledger.orphans().len();
        stats.ambiguity_groups = ledger.ambiguity_groups().len();

        ReconcileOutput {
            records,
            duplicates: store.duplicate_summary(),
            ledger,
            stats,
            summaries,
        }
    }
}

fn context_for(run: &str, m: &RawMessage, text: Option<String>) -> MessageContext {
    MessageContext {
        run: run.to_string(),
        message_id: m.id.clone(),
        conversation_id: m.conversation.id.clone(),
        conversation_title: m.conversation.title.clone(),
        conversation_kind: m.conversation.kind,
        sender: m.sender.clone(),
        is_from_me: m.is_from_me,
        timestamp: m.timestamp.map(|t| t.format_utc()),
        text,
    }
}

fn message_review_item(m: &RawMessage, text: Option<&str>) -> ReviewItem {
    ReviewItem {
        label: m.id.clone(),
        path: None,
        size: None,
        message_id: Some(m.id.clone()),
        sender: Some(m.sender.clone()),
        text: text.map(str::to_string),
    }
}

fn file_review_item(f: &CapturedFile) -> ReviewItem {
    ReviewItem {
        label: f.file_name(),
        path: Some(f.path().to_path_buf()),
        size: Some(f.len()),
        message_id: None,
        sender: None,
        text: None,
    }
}

/// A file that had a claim when it was pulled into a group keeps the
/// claiming message's context, so the message stays visible to a reviewer.
fn claimed_file_review_item(f: &CapturedFile, claim: Option<(&RawMessage, Option<&str>)>) -> ReviewItem {
    let mut item = file_review_item(f);
    if let Some((m, text)) = claim {
        item.message_id = Some(m.id.clone());
        item.sender = Some(m.sender.clone());
        item.text = text.map(str::to_string);
    }
    item
}
