//! # stagecraft - a container-backed CI job runner
//!
//! stagecraft reads a pipeline of stages from `.stagecraft.yaml`, expands
//! every job's matrix into one instance per series and architecture, and
//! runs each instance in an isolated build environment.
//!
//! ## Features
//!
//! - **Matrix expansion**: `matrix` entries overlay the job's base fields
//! - **Environment lifecycle**: deterministic, per-project environment names,
//!   reused within a run and deleted at the end or after every job
//! - **Package setup**: apt repositories (PPAs with signing keys), packages
//!   and snaps installed before the job's script
//! - **Plugins**: `tox`, `pyproject-build`, `golang`, `miniconda` and
//!   `conda-build` contribute packages, snaps, environment and scripts
//! - **Artifacts**: outputs are collected per job and matrix entry, and can
//!   be fed to later jobs as inputs
//! - **Release**: publish the CI builds of a commit to an archive
//!
//! ## Example
//!
//! ```
//! use stagecraft::pipeline::{PipelineConfig, expand_pipeline};
//!
//! let config = PipelineConfig::from_yaml_str(
//!     "pipeline:\n  - test\njobs:\n  test:\n    series: focal\n    architectures: amd64\n    run: tox\n",
//! )
//! .unwrap();
//! let jobs = expand_pipeline(&config).unwrap();
//! assert_eq!(jobs["test"].len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod artifacts;
pub mod executor;
pub mod infrastructure;
pub mod pipeline;
pub mod release;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use executor::{
    CleanPolicy, Environment, EnvironmentProvider, ExecutionMode, HealthStatus, JobExecutor,
    PipelineScheduler, RunContext, RunOptions, RunReport,
};
pub use infrastructure::{Config, ContainerProvider, ContainerRuntime};
pub use pipeline::{ConfigError, EnvironmentError, PipelineConfig, RunError};

/// Version of the stagecraft crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
