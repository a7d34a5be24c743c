use std::path::PathBuf;

use clap::Args;

use crate::config::{Config, StatePaths};
use crate::engine::stuck::ConsolePrompter;
use crate::engine::{self, resume, RunOptions};
use crate::tracker::Tracker;

/// Resume the most recent run from its checkpoint.
#[derive(Debug, Args)]
pub struct ResumeArgs {
    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Close out beads the previous run left stuck instead of retrying them
    #[arg(long)]
    pub skip_stuck: bool,
}

impl ResumeArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let root = super::resolve_root(self.root)?;
        let config = Config::load(&root)?;
        let paths = StatePaths::new(&root);

        let Some(info) = resume::latest_run(&paths)? else {
            anyhow::bail!("no previous run to resume under {}", paths.runs_dir().display());
        };
        eprintln!("Resuming run {}", info.run_id);

        let tracker = Tracker::new(&root, &paths.bead_meta_dir());
        resume::normalize_statuses(&tracker, self.skip_stuck)?;

        let mut options = RunOptions::new(&root);
        options.resume = Some(info);

        let mut prompter = ConsolePrompter;
        let summary = engine::run(&config, &options, &mut prompter)?;
        tracing::info!(run_id = %summary.run_id, "resumed run finished");
        Ok(())
    }
}
