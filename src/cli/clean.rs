//! `stagecraft clean` - Delete the project's environments

use super::RuntimeArg;
use super::run::provider;
use anyhow::{Context, Result};
use stagecraft::executor::EnvironmentLifecycle;
use stagecraft::infrastructure::Config;
use std::path::PathBuf;

/// Options of `clean`
#[derive(clap::Args, Debug, Clone)]
pub struct CleanArgs {
    /// Project directory
    #[arg(short = 'C', long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Container runtime, overriding the runner configuration
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeArg>,
}

/// Deletes every environment named after the project
pub fn clean_project(config: &Config, args: &CleanArgs) -> Result<i32> {
    let project_dir = std::fs::canonicalize(&args.project_dir)
        .with_context(|| format!("Project directory not found: {}", args.project_dir.display()))?;
    let project_name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let provider = provider(config, args.runtime);
    let lifecycle = EnvironmentLifecycle::new(&provider);
    if let Err(err) = lifecycle.ensure_ready() {
        eprintln!("{err}");
        return Ok(1);
    }
    match lifecycle.clean_project(&project_name, &project_dir) {
        Ok(destroyed) => {
            for name in destroyed {
                println!("Deleted {name}");
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(err.exit_code().unwrap_or(1))
        }
    }
}
