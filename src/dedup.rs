//! Content-addressable dedup store.
//!
//! One store instance lives for the whole reconciliation and is shared by every
//! export run. The first registration of a content hash becomes the canonical
//! asset; every later registration with the same bytes only appends an
//! occurrence. Callers copy bytes only on [`RegisterOutcome::New`].

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use rustc_hash::FxHashMap;

use crate::hashing::{hash_file, ContentHash, HashAlgorithm};
use crate::models::{CapturedFile, CapturedTimestamp, MediaAsset, Occurrence, OccurrenceContext, RunId};

/// The single physical copy chosen for a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalAsset {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub len: u64,
    pub captured: CapturedTimestamp,
    pub run: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterFailure {
    #[error("unreadable: {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("hash collision on {hash}: {path} is {len} bytes, canonical {canonical_path} is {canonical_len} bytes")]
    HashCollision {
        hash: ContentHash,
        path: PathBuf,
        len: u64,
        canonical_path: PathBuf,
        canonical_len: u64,
    },
}

impl RegisterFailure {
    pub fn path(&self) -> &Path {
        match self {
            RegisterFailure::Unreadable { path, .. } => path,
            RegisterFailure::HashCollision { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// First sighting of these bytes; the caller copies them exactly once
    New(Arc<CanonicalAsset>),
    /// Bytes already known; the caller must not copy
    Duplicate(Arc<CanonicalAsset>),
    Failed(RegisterFailure),
}

impl RegisterOutcome {
    pub fn is_new_copy(&self) -> bool {
        matches!(self, RegisterOutcome::New(_))
    }

    pub fn canonical(&self) -> Option<&Arc<CanonicalAsset>> {
        match self {
            RegisterOutcome::New(c) | RegisterOutcome::Duplicate(c) => Some(c),
            RegisterOutcome::Failed(_) => None,
        }
    }
}

/// A file whose hash has been computed but which is not registered yet.
/// Produced in parallel, consumed serially.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub file: CapturedFile,
    pub hash: ContentHash,
    /// Bytes actually read while hashing
    pub len: u64,
}

struct IndexEntry {
    canonical: Arc<CanonicalAsset>,
    occurrences: Vec<Occurrence>,
}

#[derive(Default)]
struct DedupIndex {
    entries: FxHashMap<ContentHash, IndexEntry>,
    /// Registration order, for deterministic iteration
    order: Vec<ContentHash>,
}

pub struct DedupStore {
    algorithm: HashAlgorithm,
    index: Mutex<DedupIndex>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub hash: ContentHash,
    pub canonical_path: PathBuf,
    pub size_bytes: u64,
    pub count: usize,
    pub occurrences: Vec<Occurrence>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateSummary {
    pub total_unique_files: usize,
    pub total_files_with_duplicates: usize,
    pub total_duplicate_instances: usize,
    pub wasted_space_bytes: u64,
    /// Sorted by occurrence count, most duplicated first
    pub duplicates: Vec<DuplicateGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSnapshotEntry {
    pub canonical: CanonicalAsset,
    pub occurrences: Vec<Occurrence>,
}

impl DedupStore {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            index: Mutex::new(DedupIndex::default()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    fn lock(&self) -> MutexGuard<'_, DedupIndex> {
        // A panic in another registering thread cannot leave the map half-written
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hash a file without touching the index. Safe to call from many threads.
    pub fn hash(&self, file: &CapturedFile) -> Result<HashedFile, RegisterFailure> {
        match hash_file(file.path(), self.algorithm) {
            Ok((hash, len)) => Ok(HashedFile {
                file: file.clone(),
                hash,
                len,
            }),
            Err(e) => Err(RegisterFailure::Unreadable {
                path: file.path().to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Like [`DedupStore::hash`], but reuses the asset's memoized hash. The
    /// length comes from the captured metadata.
    pub fn hash_asset(&self, asset: &MediaAsset) -> Result<HashedFile, RegisterFailure> {
        match asset.content_hash(self.algorithm) {
            Ok(hash) => Ok(HashedFile {
                file: asset.file().clone(),
                hash,
                len: asset.len(),
            }),
            Err(e) => Err(RegisterFailure::Unreadable {
                path: asset.path().to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Hash and register in one call.
    pub fn register(&self, file: &CapturedFile, ctx: OccurrenceContext) -> RegisterOutcome {
        match self.hash(file) {
            Ok(hashed) => self.register_hashed(hashed, ctx),
            Err(failure) => RegisterOutcome::Failed(failure),
        }
    }

    /// Check-and-insert under one lock acquisition.
    pub fn register_hashed(&self, hashed: HashedFile, ctx: OccurrenceContext) -> RegisterOutcome {
        let mut index = self.lock();

        if let Some(entry) = index.entries.get_mut(&hashed.hash) {
            if entry.canonical.len != hashed.len {
                return RegisterOutcome::Failed(RegisterFailure::HashCollision {
                    hash: hashed.hash,
                    path: hashed.file.path().to_path_buf(),
                    len: hashed.len,
                    canonical_path: entry.canonical.path.clone(),
                    canonical_len: entry.canonical.len,
                });
            }
            entry.occurrences.push(Occurrence::new(hashed.file.path(), ctx));
            return RegisterOutcome::Duplicate(Arc::clone(&entry.canonical));
        }

        let canonical = Arc::new(CanonicalAsset {
            hash: hashed.hash.clone(),
            path: hashed.file.path().to_path_buf(),
            len: hashed.len,
            captured: hashed.file.captured(),
            run: ctx.run.clone(),
        });
        let occurrence = Occurrence::new(hashed.file.path(), ctx);
        index.order.push(hashed.hash.clone());
        index.entries.insert(
            hashed.hash,
            IndexEntry {
                canonical: Arc::clone(&canonical),
                occurrences: vec![occurrence],
            },
        );
        RegisterOutcome::New(canonical)
    }

    /// Every occurrence of `hash`, in registration order.
    pub fn occurrences(&self, hash: &ContentHash) -> Vec<Occurrence> {
        self.lock()
            .entries
            .get(hash)
            .map(|e| e.occurrences.clone())
            .unwrap_or_default()
    }

    pub fn canonical(&self, hash: &ContentHash) -> Option<Arc<CanonicalAsset>> {
        self.lock().entries.get(hash).map(|e| Arc::clone(&e.canonical))
    }

    /// Number of distinct contents.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicate_summary(&self) -> DuplicateSummary {
        let index = self.lock();
        let mut duplicates: Vec<DuplicateGroup> = index
            .order
            .iter()
            .filter_map(|hash| index.entries.get(hash))
            .filter(|e| e.occurrences.len() > 1)
            .map(|e| DuplicateGroup {
                hash: e.canonical.hash.clone(),
                canonical_path: e.canonical.path.clone(),
                size_bytes: e.canonical.len,
                count: e.occurrences.len(),
                occurrences: e.occurrences.clone(),
            })
            .collect();
        // Stable sort keeps registration order among equal counts
        duplicates.sort_by(|a, b| b.count.cmp(&a.count));

        let total_duplicate_instances = duplicates.iter().map(|d| d.count - 1).sum();
        let wasted_space_bytes = duplicates
            .iter()
            .map(|d| d.size_bytes * (d.count as u64 - 1))
            .sum();

        DuplicateSummary {
            total_unique_files: index.entries.len(),
            total_files_with_duplicates: duplicates.len(),
            total_duplicate_instances,
            wasted_space_bytes,
            duplicates,
        }
    }

    /// Serializable copy of the whole index in registration order.
    pub fn snapshot(&self) -> Vec<IndexSnapshotEntry> {
        let index = self.lock();
        index
            .order
            .iter()
            .filter_map(|hash| index.entries.get(hash))
            .map(|e| IndexSnapshotEntry {
                canonical: (*e.canonical).clone(),
                occurrences: e.occurrences.clone(),
            })
            .collect()
    }
}
