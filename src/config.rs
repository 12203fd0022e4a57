//! Reconciliation settings.
//!
//! Defaults cover the common case; an optional TOML file overrides them and
//! CLI flags override the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::hashing::HashAlgorithm;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Rayon threads for hashing and decoding; 0 leaves rayon's default
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// Threads copying unique files
    #[serde(default = "default_copy_workers")]
    pub copy_workers: usize,
    /// Bounded queue depth between the registering thread and copy workers
    #[serde(default = "default_copy_queue")]
    pub copy_queue: usize,
    /// Names skipped during scanning, on top of the built-in list
    #[serde(default)]
    pub extra_banned: Vec<String>,
    /// Copy the files of each ambiguity group into a review directory
    #[serde(default = "default_true")]
    pub materialize_ambiguous: bool,
    /// Copy orphaned media into `issues/failed-matching/media`
    #[serde(default = "default_true")]
    pub copy_orphans: bool,
    /// Record where canonical files live without copying bytes
    #[serde(default)]
    pub dry_run: bool,
}

/// One less than the number of CPUs, at least one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

fn default_copy_workers() -> usize {
    default_worker_count().min(8)
}

fn default_copy_queue() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            hash_algorithm: HashAlgorithm::default(),
            copy_workers: default_copy_workers(),
            copy_queue: default_copy_queue(),
            extra_banned: Vec::new(),
            materialize_ambiguous: true,
            copy_orphans: true,
            dry_run: false,
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.copy_workers == 0 {
            anyhow::bail!("copy_workers must be > 0");
        }
        if self.copy_queue == 0 {
            anyhow::bail!("copy_queue must be > 0");
        }
        if let Some(bad) = self.extra_banned.iter().find(|p| p.trim().is_empty()) {
            anyhow::bail!("extra_banned entries must not be blank (got {:?})", bad);
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<ReconcileConfig> {
    let config: ReconcileConfig = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<ReconcileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.workers, 0);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Fx);
        assert!(config.copy_workers >= 1);
        assert_eq!(config.copy_queue, 256);
        assert!(config.materialize_ambiguous);
        assert!(config.copy_orphans);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_overrides() {
        let config = parse_config(
            r#"
            workers = 4
            hash_algorithm = "sha256"
            copy_queue = 16
            extra_banned = ["Trash", "Recently Deleted"]
            materialize_ambiguous = false
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.copy_queue, 16);
        assert_eq!(config.extra_banned.len(), 2);
        assert!(!config.materialize_ambiguous);
    }

    #[test]
    fn test_validation() {
        assert!(parse_config("copy_queue = 0").is_err());
        assert!(parse_config("copy_workers = 0").is_err());
        assert!(parse_config("extra_banned = [\"  \"]").is_err());
        assert!(parse_config("hash_algorithm = \"md5\"").is_err());
        assert!(parse_config("unknown_key = 1").is_err());
    }

    #[test]
    fn test_default_worker_count_at_least_one() {
        assert!(default_worker_count() >= 1);
    }
}
