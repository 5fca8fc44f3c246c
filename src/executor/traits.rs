//! Execution environment traits
//!
//! The engine drives build environments only through these traits. A backend
//! implements [`EnvironmentProvider`] (create, list, destroy) and hands out
//! [`Environment`] handles (execute, push, pull).

use crate::pipeline::{EnvironmentError, PpaReference, RunError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options for a command executed inside an environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Working directory inside the environment
    pub cwd: PathBuf,
    /// Variables set for the command; nothing else is added
    pub env: BTreeMap<String, String>,
    /// Capture stdout instead of streaming it
    pub capture_output: bool,
}

impl ExecOptions {
    /// Options running in `cwd` with no extra variables
    #[must_use]
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    /// Sets the variables passed to the command
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Captures stdout
    #[must_use]
    pub fn captured(mut self) -> Self {
        self.capture_output = true;
        self
    }
}

/// Result of a command executed inside an environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status
    pub exit_code: i32,
    /// Captured stdout, empty unless capture was requested
    pub stdout: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Mode and ownership of a file pushed into an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMode {
    /// Permission bits
    pub mode: u32,
    /// Owning user
    pub user: String,
    /// Owning group
    pub group: String,
}

impl FileMode {
    /// `0644`, owned by root
    #[must_use]
    pub fn root_readable() -> Self {
        Self {
            mode: 0o644,
            user: "root".to_string(),
            group: "root".to_string(),
        }
    }
}

/// A running build environment
#[allow(clippy::missing_errors_doc)]
pub trait Environment: Send + Sync {
    /// Instance name
    fn name(&self) -> &str;

    /// Executes `argv` and returns its exit status
    ///
    /// A non-zero status is not an error; errors mean the command could not be
    /// run at all.
    fn execute(&self, argv: &[String], options: &ExecOptions)
    -> Result<CommandOutput, EnvironmentError>;

    /// Copies a host file into the environment
    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError>;

    /// Writes `content` to `destination` with the given mode and ownership
    fn push_content(
        &self,
        content: &[u8],
        destination: &Path,
        mode: &FileMode,
    ) -> Result<(), EnvironmentError>;

    /// Copies a file out of the environment to the host
    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError>;
}

/// Everything a backend needs to launch an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Deterministic instance name
    pub instance_name: String,
    /// Target series
    pub series: String,
    /// Target architecture
    pub architecture: String,
    /// Project directory on the host
    pub project_path: PathBuf,
    /// Pass NVIDIA GPUs through
    pub gpu_nvidia: bool,
    /// Unprivileged user to create, for jobs that do not run as root
    pub unprivileged_user: Option<String>,
}

/// Health status of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is healthy
    Healthy,

    /// Backend works but something is off
    Degraded {
        /// Reason for degradation
        reason: String,
    },

    /// Backend cannot be used
    Unhealthy {
        /// Reason for being unhealthy
        reason: String,
    },
}

/// A backend that creates and destroys build environments
#[allow(clippy::missing_errors_doc)]
pub trait EnvironmentProvider: Send + Sync {
    /// Backend name, used in messages
    fn name(&self) -> &str;

    /// Readiness check
    fn health_check(&self) -> HealthStatus;

    /// Where the project directory appears inside every environment
    fn managed_project_path(&self) -> PathBuf;

    /// Returns the environment named in `spec`, launching it if absent
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn Environment>, EnvironmentError>;

    /// Destroys the named environment
    fn destroy(&self, name: &str) -> Result<(), EnvironmentError>;

    /// Names of every existing environment starting with `prefix`
    fn list_instances(&self, prefix: &str) -> Result<Vec<String>, EnvironmentError>;
}

/// Fetches the armored signing key of a PPA
#[allow(clippy::missing_errors_doc)]
pub trait SigningKeySource: Send + Sync {
    /// Returns the key, or [`RunError::SigningKey`] if it cannot be retrieved
    fn signing_key(&self, ppa: &PpaReference) -> Result<String, RunError>;
}

/// Looks up the published revision of a snap
#[allow(clippy::missing_errors_doc)]
pub trait SnapRevisionQuery: Send + Sync {
    /// The current revision, `None` if the snap is unknown
    fn revision(
        &self,
        environment: &dyn Environment,
        snap: &str,
    ) -> Result<Option<String>, EnvironmentError>;
}
