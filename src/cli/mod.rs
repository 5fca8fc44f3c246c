//! Command-line interface for stagecraft
//!
//! - `run`: Run every stage of the project's pipeline
//! - `run-one`: Run a single matrix entry of one job
//! - `clean`: Delete the project's environments
//! - `release`: Publish CI builds to an archive
//! - `version`: Print the version
//! - `completions`: Generate shell completions

pub mod clean;
pub mod completions;
pub mod release;
pub mod run;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use stagecraft::infrastructure::{Config, ContainerRuntime, init_logging};
use std::path::{Path, PathBuf};

/// CLI arguments for stagecraft
#[derive(Parser, Debug)]
#[command(name = "stagecraft")]
#[command(author, version, about = "Run CI pipelines in containers", long_about = None)]
struct Args {
    /// Runner configuration file
    #[arg(long, global = true)]
    runner_config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline
    Run(run::RunArgs),

    /// Run a single job
    RunOne {
        /// Job name
        job: String,
        /// Matrix index of the job
        index: usize,
        #[command(flatten)]
        args: run::RunArgs,
    },

    /// Delete the environments created for the project
    Clean(clean::CleanArgs),

    /// Release a CI build to an archive
    Release(release::ReleaseArgs),

    /// Print the version
    Version,

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long, conflicts_with = "install")]
        output: Option<PathBuf>,
        /// Write to the shell's per-user completion directory
        #[arg(long)]
        install: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Container runtime selectable on the command line
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RuntimeArg {
    /// Docker
    Docker,
    /// Podman
    Podman,
}

impl From<RuntimeArg> for ContainerRuntime {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => ContainerRuntime::Docker,
            RuntimeArg::Podman => ContainerRuntime::Podman,
        }
    }
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

/// Runner configuration used when `--runner-config` is absent
fn default_runner_config() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".config")))?;
    Some(base.join("stagecraft").join("config.yaml"))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path.map(Path::to_path_buf).or_else(default_runner_config) {
        Some(path) => Config::load_or_default(&path),
        None => Ok(Config::default()),
    }
}

/// Parse and execute CLI arguments; returns the process exit code
pub fn run() -> Result<i32> {
    let args = Args::parse();
    let config = load_config(args.runner_config.as_deref())?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    match args.command {
        Command::Run(run_args) => run::run_pipeline(&config, &run_args, None),
        Command::RunOne {
            job,
            index,
            args: run_args,
        } => run::run_pipeline(&config, &run_args, Some((job.as_str(), index))),
        Command::Clean(clean_args) => clean::clean_project(&config, &clean_args),
        Command::Release(release_args) => release::release(&release_args),
        Command::Version => {
            println!("stagecraft, version {}", stagecraft::VERSION);
            Ok(0)
        }
        Command::Completions {
            shell,
            output,
            install,
        } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            let target = if install {
                Some(completions::get_default_completions_path(shell_enum)?)
            } else {
                output
            };
            if let Some(output_path) = target {
                completions::save_completions(&completions, &output_path)?;
                eprintln!("Wrote completions to {}", output_path.display());
            } else {
                println!("{completions}");
            }
            Ok(0)
        }
    }
}
