//! Thin CLI entry points; the engine does the work.

pub mod doctor;
pub mod resume;
pub mod run;
pub mod status;

use std::path::PathBuf;

/// Resolve the project root: an explicit flag wins, otherwise the current
/// directory.
pub(crate) fn resolve_root(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    use anyhow::Context;
    if let Some(root) = explicit {
        return Ok(root);
    }
    std::env::current_dir().context("determining project root")
}
