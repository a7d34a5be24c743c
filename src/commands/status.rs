use std::path::PathBuf;

use clap::Args;

use crate::config::StatePaths;
use crate::engine::resume;

/// Show the latest run's checkpoint state.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

impl StatusArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let root = super::resolve_root(self.root)?;
        let paths = StatePaths::new(&root);

        let Some(info) = resume::latest_run(&paths)? else {
            println!("No runs yet.");
            return Ok(());
        };

        println!("Latest run: {}", info.run_id);
        match info.state {
            None => println!("  no checkpoint (run finished cleanly or never started a bead)"),
            Some(state) => {
                println!("  completed: {}", state.completed.len());
                println!("  failed:    {}", state.failed.len());
                if !state.current_bead.is_empty() {
                    println!("  in flight: {}", state.current_bead);
                }
                if state.consecutive_failures > 0 {
                    println!("  consecutive failures: {}", state.consecutive_failures);
                }
                if !state.last_error.is_empty() {
                    let first_line = state.last_error.lines().next().unwrap_or("");
                    println!("  last error: {first_line}");
                }
                if let Some(at) = state.updated_at {
                    println!("  updated: {at}");
                }
            }
        }

        let report = info.run_dir.join("report.md");
        if report.exists() {
            println!("  report: {}", report.display());
        }
        Ok(())
    }
}
