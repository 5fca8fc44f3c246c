//! `stagecraft run` and `stagecraft run-one`

use super::RuntimeArg;
use anyhow::Result;
use clap::ValueEnum;
use stagecraft::artifacts::resolve_within;
use stagecraft::executor::{
    CleanPolicy, ExecutionMode, PipelineScheduler, RunContext, RunOptions, RunReport,
    parse_key_value,
};
use stagecraft::infrastructure::{Config, ContainerProvider, LaunchpadKeySource, SnapdRevisionQuery};
use stagecraft::pipeline::{ConfigError, DEFAULT_CONFIG_FILE, PipelineConfig, RunError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// When environments are deleted
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CleanArg {
    /// After the last stage
    AtEnd,
    /// After every job
    PerJob,
}

/// Options shared by `run` and `run-one`
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Project directory
    #[arg(short = 'C', long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Pipeline configuration, relative to the project directory
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Write job outputs to this directory
    #[arg(long)]
    pub output_directory: Option<PathBuf>,

    /// Set an environment variable in every job
    #[arg(long = "set-env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set_env: Vec<(String, String)>,

    /// YAML file of secrets for package repository URLs
    #[arg(long)]
    pub secrets: Option<PathBuf>,

    /// Extra sources.list line for every job
    #[arg(long = "package-repository", value_name = "LINE")]
    pub package_repositories: Vec<String>,

    /// Replace sources.list with these lines
    #[arg(long = "apt-replace-repositories", value_name = "LINE")]
    pub replace_repositories: Vec<String>,

    /// Extra plugin setting
    #[arg(long = "plugin-setting", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub plugin_settings: Vec<(String, String)>,

    /// Only run jobs for this architecture
    #[arg(long)]
    pub architecture: Option<String>,

    /// When to delete environments
    #[arg(long, value_enum, default_value_t = CleanArg::AtEnd)]
    pub clean: CleanArg,

    /// Run the jobs of a stage concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Pass NVIDIA GPUs through to environments
    #[arg(long)]
    pub gpu_nvidia: bool,

    /// Container runtime, overriding the runner configuration
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeArg>,
}

/// Resolves the pipeline file, which must stay inside the project
pub fn resolve_config(project_dir: &Path, config: &Path) -> Result<PathBuf, RunError> {
    Ok(resolve_within(project_dir, config)?)
}

/// Reads a flat `name: value` secrets map
pub fn read_secrets(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Invalid(format!("Cannot read secrets file: {err}")))?;
    if text.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Combines flags and runner configuration into run options
pub fn run_options(args: &RunArgs, config: &Config, secrets: HashMap<String, String>) -> RunOptions {
    RunOptions {
        output_dir: args
            .output_directory
            .clone()
            .or_else(|| config.output_directory.clone()),
        set_env: args.set_env.iter().cloned().collect(),
        secrets,
        package_repositories: args.package_repositories.clone(),
        replace_repositories: args.replace_repositories.clone(),
        plugin_settings: args.plugin_settings.iter().cloned().collect(),
        architecture: args.architecture.clone(),
        clean: match args.clean {
            CleanArg::AtEnd => CleanPolicy::AtEnd,
            CleanArg::PerJob => CleanPolicy::PerJob,
        },
        mode: if args.parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        },
        gpu_nvidia: args.gpu_nvidia,
    }
}

/// Container provider for this invocation
pub fn provider(config: &Config, runtime: Option<RuntimeArg>) -> ContainerProvider {
    ContainerProvider::new(runtime.map_or(config.runtime, Into::into))
        .with_image_template(config.image_template.clone())
        .with_managed_project_path(config.managed_project_path.clone())
}

fn print_report(report: &RunReport) -> i32 {
    for error in &report.errors {
        eprintln!("{error}");
    }
    report.exit_code
}

fn prepare(args: &RunArgs, config: &Config) -> Result<(PathBuf, PipelineConfig, RunOptions), RunError> {
    let project_dir = std::fs::canonicalize(&args.project_dir)?;
    let config_path = resolve_config(&project_dir, &args.config)?;
    let pipeline = PipelineConfig::load(&config_path)?;
    let secrets = match &args.secrets {
        Some(path) => read_secrets(path)?,
        None => HashMap::new(),
    };
    Ok((project_dir, pipeline, run_options(args, config, secrets)))
}

/// Runs the pipeline, or one job of it; returns the exit code
pub fn run_pipeline(config: &Config, args: &RunArgs, selection: Option<(&str, usize)>) -> Result<i32> {
    let (project_dir, pipeline, options) = match prepare(args, config) {
        Ok(prepared) => prepared,
        Err(err) => {
            eprintln!("{err}");
            return Ok(err.exit_code().unwrap_or(1));
        }
    };
    tracing::debug!(project = %project_dir.display(), "Loaded pipeline");

    let provider = provider(config, args.runtime);
    let signing_keys = LaunchpadKeySource::default();
    let snap_revisions = SnapdRevisionQuery;
    let scheduler = PipelineScheduler::new(&provider, &signing_keys, &snap_revisions);
    let context = RunContext::new(project_dir, options);

    let report = match selection {
        Some((job, index)) => scheduler.run_one(&pipeline, job, index, &context),
        None => scheduler.run(&pipeline, &context),
    };
    Ok(print_report(&report))
}
