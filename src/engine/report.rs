//! Human-readable run summary written to `report.md` in the run directory.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::state::pool::PoolSnapshot;

/// Terminal outcome of one bead, for reporting.
#[derive(Debug, Clone)]
pub struct BeadReport {
    pub id: String,
    pub title: String,
    pub outcome: String,
}

pub fn write_report(
    run_dir: &Path,
    run_id: &str,
    started_at: DateTime<Utc>,
    snapshot: &PoolSnapshot,
    beads: &[BeadReport],
) -> anyhow::Result<()> {
    let mut body = format!(
        "# Run {run_id}\n\nStarted: {started}\nFinished: {finished}\n\n\
         | | count |\n|---|---|\n\
         | completed | {completed} |\n\
         | stuck | {stuck} |\n\
         | skipped | {skipped} |\n\
         | total | {total} |\n",
        started = started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        finished = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        completed = snapshot.completed,
        stuck = snapshot.stuck,
        skipped = snapshot.skipped,
        total = snapshot.total,
    );

    if !beads.is_empty() {
        body.push_str("\n## Beads\n\n");
        for bead in beads {
            body.push_str(&format!("- `{}` {} — {}\n", bead.id, bead.title, bead.outcome));
        }
    }

    let path = run_dir.join("report.md");
    std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))
}
