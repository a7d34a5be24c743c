use std::path::PathBuf;

use clap::Args;

use crate::config::{Config, StatePaths};
use crate::git;
use crate::subprocess::Cmd;

/// Validate the project setup and collaborator tools.
#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Project root (defaults to the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
    required: bool,
}

impl DoctorArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let root = super::resolve_root(self.root)?;
        let mut checks = Vec::new();

        let config_result = Config::load(&root);
        checks.push(Check {
            name: "config",
            ok: config_result.is_ok(),
            detail: match &config_result {
                Ok(_) if StatePaths::new(&root).config_file().exists() => {
                    "config.yaml parsed".to_string()
                }
                Ok(_) => "no config.yaml; using defaults".to_string(),
                Err(e) => format!("{e:#}"),
            },
            required: true,
        });

        checks.push(Check {
            name: "git repository",
            ok: git::is_repo(&root),
            detail: root.display().to_string(),
            required: true,
        });

        checks.push(tool_check("agent", "claude", &["--version"], true));
        checks.push(tool_check("tracker", "br", &["--version"], true));
        checks.push(tool_check("knowledge graph", "kg", &["--version"], false));

        let mut failed_required = false;
        for check in &checks {
            let mark = if check.ok {
                "ok"
            } else if check.required {
                failed_required = true;
                "MISSING"
            } else {
                "absent (optional)"
            };
            println!("{:<18} {:<18} {}", check.name, mark, check.detail);
        }

        if failed_required {
            anyhow::bail!("doctor found problems; see above");
        }
        println!("All required checks passed.");
        Ok(())
    }
}

fn tool_check(name: &'static str, program: &str, args: &[&str], required: bool) -> Check {
    let result = Cmd::new(program).args(args).run();
    let (ok, detail) = match result {
        Ok(output) if output.success() => (true, output.stdout.trim().lines().next().unwrap_or("").to_string()),
        Ok(output) => (false, format!("exited {}", output.exit_code)),
        Err(_) => (false, format!("{program} not on PATH")),
    };
    Check {
        name,
        ok,
        detail,
        required,
    }
}
