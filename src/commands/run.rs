use std::path::PathBuf;

use clap::Args;

use crate::config::Config;
use crate::engine::stuck::ConsolePrompter;
use crate::engine::{self, RunOptions};

/// Start a new run over the tracker's open beads.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Agent program to invoke (advanced; defaults to `claude`)
    #[arg(long, hide = true)]
    pub agent_program: Option<String>,
}

impl RunArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let root = super::resolve_root(self.root)?;
        let config = Config::load(&root)?;

        let mut options = RunOptions::new(&root);
        if let Some(program) = self.agent_program {
            options.agent_program = program;
        }

        let mut prompter = ConsolePrompter;
        let summary = engine::run(&config, &options, &mut prompter)?;
        tracing::info!(run_id = %summary.run_id, "run finished");
        Ok(())
    }
}
