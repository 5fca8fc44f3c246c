//! Environment naming, acquisition and cleanup
//!
//! An environment is identified by a name derived only from the project and
//! the (series, architecture) pair, so later invocations find and clean up
//! the same instances. Cleanup after a run only ever touches the names this
//! run acquired.

use crate::executor::context::RunContext;
use crate::executor::traits::{Environment, EnvironmentProvider, HealthStatus, LaunchSpec};
use crate::pipeline::{EnvironmentError, JobInstance, RunError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of every instance name
pub const INSTANCE_PREFIX: &str = "stagecraft";

/// User that runs jobs configured with `root: false`
pub const UNPRIVILEGED_USER: &str = "_stagecraft";

const MAX_INSTANCE_NAME: usize = 63;

static INVALID_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9-]").expect("instance name pattern is valid"));

/// Replaces characters backends reject and truncates to 63 characters
#[must_use]
pub fn sanitize_instance_name(raw: &str) -> String {
    let mut name = INVALID_NAME_CHARS.replace_all(raw, "-").into_owned();
    name.truncate(MAX_INSTANCE_NAME);
    name
}

#[cfg(unix)]
fn project_inode(project_path: &Path) -> Result<u64, RunError> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(project_path)?.ino())
}

#[cfg(not(unix))]
fn project_inode(project_path: &Path) -> Result<u64, RunError> {
    std::fs::metadata(project_path)?;
    Ok(0)
}

/// Common prefix of every instance of a project
pub fn project_prefix(project_name: &str, project_path: &Path) -> Result<String, RunError> {
    let inode = project_inode(project_path)?;
    Ok(sanitize_instance_name(&format!(
        "{INSTANCE_PREFIX}-{project_name}-{inode}-"
    )))
}

/// Deterministic instance name for a project, series and architecture
pub fn instance_name(
    project_name: &str,
    project_path: &Path,
    series: &str,
    architecture: &str,
) -> Result<String, RunError> {
    let inode = project_inode(project_path)?;
    Ok(sanitize_instance_name(&format!(
        "{INSTANCE_PREFIX}-{project_name}-{inode}-{series}-{architecture}"
    )))
}

/// Acquires environments from a provider and tracks them for cleanup
pub struct EnvironmentLifecycle<'a> {
    provider: &'a dyn EnvironmentProvider,
}

impl<'a> EnvironmentLifecycle<'a> {
    /// Creates a lifecycle over `provider`
    #[must_use]
    pub fn new(provider: &'a dyn EnvironmentProvider) -> Self {
        Self { provider }
    }

    /// The provider environments come from
    #[must_use]
    pub fn provider(&self) -> &'a dyn EnvironmentProvider {
        self.provider
    }

    /// Fails if the backend is not usable
    pub fn ensure_ready(&self) -> Result<(), EnvironmentError> {
        match self.provider.health_check() {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Degraded { reason } => {
                warn!(backend = %self.provider.name(), %reason, "Backend is degraded");
                Ok(())
            }
            HealthStatus::Unhealthy { reason } => Err(EnvironmentError::NotReady {
                backend: self.provider.name().to_string(),
                reason,
            }),
        }
    }

    /// Returns the environment for `instance`, recording it as created by this run
    pub fn acquire(
        &self,
        context: &RunContext,
        instance: &JobInstance,
    ) -> Result<Arc<dyn Environment>, RunError> {
        let name = instance_name(
            &context.project_name,
            context.project_path(),
            instance.series(),
            &instance.architecture,
        )?;
        let spec = LaunchSpec {
            instance_name: name.clone(),
            series: instance.series().to_string(),
            architecture: instance.architecture.clone(),
            project_path: context.project_path().to_path_buf(),
            gpu_nvidia: context.options.gpu_nvidia,
            unprivileged_user: (!instance.job.root).then(|| UNPRIVILEGED_USER.to_string()),
        };
        // Concurrent jobs on one series and architecture must not race to create it.
        let lock = context.created().acquisition_lock(&name);
        let _acquiring = lock.lock();
        // Recorded before launching so a half-started instance is still cleaned up.
        if context.created().record(&name) {
            debug!(instance = %name, "Recorded environment for cleanup");
        }
        let environment = self.provider.launch(&spec)?;
        info!(
            instance = %name,
            series = %spec.series,
            architecture = %spec.architecture,
            "Acquired environment"
        );
        Ok(environment)
    }

    /// Destroys every environment recorded by this run and not destroyed yet
    ///
    /// Every destroy is attempted; failures are combined into one error.
    pub fn cleanup_created(&self, context: &RunContext) -> Result<Vec<String>, RunError> {
        let mut destroyed = Vec::new();
        let mut failures = Vec::new();
        for name in context.created().pending() {
            if !context.created().mark_destroyed(&name) {
                continue;
            }
            match self.provider.destroy(&name) {
                Ok(()) => {
                    info!(instance = %name, "Destroyed environment");
                    destroyed.push(name);
                }
                Err(err) => {
                    warn!(instance = %name, error = %err, "Failed to destroy environment");
                    failures.push(err.to_string());
                }
            }
        }
        if failures.is_empty() {
            Ok(destroyed)
        } else {
            Err(RunError::Cleanup(failures.join("; ")))
        }
    }

    /// Destroys every environment of the project, whichever run created it
    pub fn clean_project(
        &self,
        project_name: &str,
        project_path: &Path,
    ) -> Result<Vec<String>, RunError> {
        let prefix = project_prefix(project_name, project_path)?;
        let names = self.provider.list_instances(&prefix)?;
        let mut destroyed = Vec::new();
        let mut failures = Vec::new();
        for name in names {
            match self.provider.destroy(&name) {
                Ok(()) => {
                    info!(instance = %name, "Deleted environment");
                    destroyed.push(name);
                }
                Err(err) => failures.push(err.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(destroyed)
        } else {
            Err(RunError::Cleanup(failures.join("; ")))
        }
    }
}
