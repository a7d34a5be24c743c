//! Resume path: locate the most recent run, restore its checkpoint, and
//! normalise bead statuses before re-entering the run controller.

use std::path::PathBuf;

use anyhow::Context;

use crate::config::StatePaths;
use crate::state::{CheckpointStore, ExecutionState};
use crate::tracker::{BeadStatus, Tracker};

/// A previous run eligible for resumption.
#[derive(Debug)]
pub struct ResumeInfo {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// None when the checkpoint was absent or corrupt (fresh state).
    pub state: Option<ExecutionState>,
}

/// Find the most recent run directory. Run ids are timestamp-sortable, so
/// the lexicographic maximum is the newest.
pub fn latest_run(paths: &StatePaths) -> anyhow::Result<Option<ResumeInfo>> {
    let runs_dir = paths.runs_dir();
    if !runs_dir.exists() {
        return Ok(None);
    }
    let mut run_ids: Vec<String> = std::fs::read_dir(&runs_dir)
        .with_context(|| format!("reading {}", runs_dir.display()))?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    run_ids.sort();

    let Some(run_id) = run_ids.pop() else {
        return Ok(None);
    };
    let run_dir = paths.run_dir(&run_id);

    // A corrupt checkpoint must never abort a resume.
    let state = match CheckpointStore::new(&run_dir).load() {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("checkpoint unreadable, resuming with fresh state: {e:#}");
            eprintln!("Warning: checkpoint in {run_id} is corrupt; starting from tracker state.");
            None
        }
    };

    Ok(Some(ResumeInfo {
        run_id,
        run_dir,
        state,
    }))
}

/// Normalise bead statuses for a resumed run: optionally close out stuck
/// beads, and reset any in-progress beads the previous run left open.
pub fn normalize_statuses(tracker: &Tracker, skip_stuck: bool) -> anyhow::Result<()> {
    let beads = tracker.all()?;
    for bead in &beads {
        match bead.status {
            BeadStatus::InProgress => {
                tracing::info!(bead = %bead.id, "resetting in-progress bead to open");
                tracker.set_status(&bead.id, BeadStatus::Open);
            }
            BeadStatus::Stuck if skip_stuck => {
                tracing::info!(bead = %bead.id, "closing stuck bead (--skip-stuck)");
                tracker.close(&bead.id, "skipped on resume (--skip-stuck)");
            }
            _ => {}
        }
    }
    Ok(())
}

/// Prune run directories older than `max_age_days`. Zero disables pruning.
pub fn prune_old_runs(paths: &StatePaths, max_age_days: i64) {
    if max_age_days <= 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(paths.runs_dir()) else {
        return;
    };
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(60 * 60 * 24 * max_age_days.unsigned_abs());
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff {
            tracing::info!(run = %path.display(), "pruning old run directory");
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::warn!("failed to prune {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionState;

    #[test]
    fn latest_run_picks_newest_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        for run_id in ["20260710-080000", "20260801-090000", "20260731-235959"] {
            std::fs::create_dir_all(paths.run_dir(run_id)).unwrap();
        }

        let info = latest_run(&paths).unwrap().unwrap();
        assert_eq!(info.run_id, "20260801-090000");
        assert!(info.state.is_none(), "no checkpoint in the run dir");
    }

    #[test]
    fn latest_run_none_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        assert!(latest_run(&paths).unwrap().is_none());
        paths.ensure().unwrap();
        assert!(latest_run(&paths).unwrap().is_none());
    }

    #[test]
    fn latest_run_loads_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        let run_dir = paths.run_dir("20260801-100000");
        std::fs::create_dir_all(&run_dir).unwrap();

        let store = CheckpointStore::new(&run_dir);
        let mut state = ExecutionState {
            run_id: "20260801-100000".to_string(),
            consecutive_failures: 2,
            ..ExecutionState::default()
        };
        store.save(&mut state).unwrap();

        let info = latest_run(&paths).unwrap().unwrap();
        let restored = info.state.unwrap();
        assert_eq!(restored.consecutive_failures, 2);
    }

    #[test]
    fn corrupt_checkpoint_survives_as_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        let run_dir = paths.run_dir("20260801-110000");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("checkpoint.json"), "{ nope").unwrap();

        let info = latest_run(&paths).unwrap().unwrap();
        assert_eq!(info.run_id, "20260801-110000");
        assert!(info.state.is_none());
    }

    #[test]
    fn prune_respects_age_and_zero_disables() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        let old = paths.run_dir("20200101-000000");
        std::fs::create_dir_all(&old).unwrap();

        prune_old_runs(&paths, 0);
        assert!(old.exists(), "zero disables pruning");

        // Backdate the directory and prune with a 1-day horizon
        let past = filetime_from_days_ago(30);
        let _ = std::process::Command::new("touch")
            .arg("-d")
            .arg(past)
            .arg(&old)
            .status();
        prune_old_runs(&paths, 1);
        assert!(!old.exists());
    }

    fn filetime_from_days_ago(days: i64) -> String {
        let when = chrono::Utc::now() - chrono::Duration::days(days);
        when.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}
