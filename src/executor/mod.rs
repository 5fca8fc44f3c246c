//! Pipeline execution layer
//!
//! This module contains the backend traits, environment lifecycle, the
//! per-instance job executor and the stage scheduler.

mod context;
mod job;
mod lifecycle;
mod scheduler;
mod shell;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{
    CleanPolicy, CreatedInstances, ExecutionMode, RunContext, RunOptions, debian_architecture,
    host_architecture,
};
pub use job::{JobExecutor, JobOutcome, SOURCES_LIST};
pub use lifecycle::{
    EnvironmentLifecycle, INSTANCE_PREFIX, UNPRIVILEGED_USER, instance_name, project_prefix,
    sanitize_instance_name,
};
pub use scheduler::{PipelineScheduler, RunReport};
pub use shell::{job_environment, join_scripts, parse_key_value, render_command, script_argv};
pub use traits::{
    CommandOutput, Environment, EnvironmentProvider, ExecOptions, FileMode, HealthStatus,
    LaunchSpec, SigningKeySource, SnapRevisionQuery,
};
