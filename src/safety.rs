//! Safety checks to keep reconciliation from writing into its own inputs.
//!
//! Exports are treated as read-only. These checks reject an output directory
//! that would land inside an export (or swallow one), before anything is
//! created or copied.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Files whose presence marks a directory as an export, never an output.
const SOURCE_MARKERS: &[&str] = &["chat.db", "sms.db", "chat_history.json"];

/// Absolute form of `path` with `.` and `..` folded away. Existing paths are
/// canonicalized so symlinks compare equal.
fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().context("Failed to read current directory")?
    };
    let mut out = PathBuf::new();
    for component in base.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    // The deepest existing ancestor may itself be a symlink
    let mut existing = out.clone();
    let mut rest = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => rest.push(name.to_os_string()),
            None => break,
        }
        if !existing.pop() {
            break;
        }
    }
    if let Ok(mut resolved) = existing.canonicalize() {
        for name in rest.into_iter().rev() {
            resolved.push(name);
        }
        return Ok(resolved);
    }
    Ok(out)
}

/// Validates that `output` is safe to write into.
///
/// Checks:
/// - Output cannot be the same directory as any export
/// - Output cannot live inside any export
/// - No export can live inside the output
/// - Output must not already look like an export (message database present)
pub fn validate_output_path(output: &Path, sources: &[&Path]) -> Result<()> {
    let out = absolute(output)?;

    for source in sources {
        let src = absolute(source)?;
        if out == src {
            bail!(
                "Safety check failed: output '{}' cannot be the same as export '{}'",
                output.display(),
                source.display()
            );
        }
        if out.starts_with(&src) {
            bail!(
                "Safety check failed: output '{}' is inside export '{}'",
                output.display(),
                source.display()
            );
        }
        if src.starts_with(&out) {
            bail!(
                "Safety check failed: export '{}' is inside output '{}'",
                source.display(),
                output.display()
            );
        }
    }

    for marker in SOURCE_MARKERS {
        if output.join(marker).exists() || output.join("json").join(marker).exists() {
            bail!(
                "Safety check failed: output '{}' contains '{}' and looks like an export",
                output.display(),
                marker
            );
        }
    }

    Ok(())
}
