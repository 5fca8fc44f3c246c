//! Error types for pipeline configuration and execution

use crate::artifacts::PathEscapeError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a pipeline configuration or turning it into
/// executable jobs. All of them are reported before an environment is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file does not exist
    #[error("Couldn't find config file '{0}'")]
    MissingFile(String),

    /// The configuration file exists but could not be read
    #[error("Couldn't read config file '{}': {reason}", .path.display())]
    Unreadable {
        /// Path of the configuration file.
        path: PathBuf,
        /// Error reported by the filesystem.
        reason: String,
    },

    /// The configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The pipeline references a job without a definition
    #[error("No job definition for '{0}'")]
    UnknownJob(String),

    /// A single-instance run asked for a matrix index that does not exist
    #[error("No job definition with index {index} for '{job}'")]
    UnknownJobIndex {
        /// Name of the job.
        job: String,
        /// Requested matrix index.
        index: usize,
    },

    /// A required job field is unset after matrix expansion
    #[error("Job '{job}' does not set '{field}'")]
    MissingField {
        /// Name of the job.
        job: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// The job has nothing to run once plugin contributions are merged
    #[error("Job '{job}' for {series}/{architecture} does not set 'run'")]
    MissingRun {
        /// Name of the job.
        job: String,
        /// Target series.
        series: String,
        /// Target architecture.
        architecture: String,
    },

    /// The job names a plugin that does not exist
    #[error("Unknown plugin '{plugin}' in job '{job}'")]
    UnknownPlugin {
        /// Name of the job.
        job: String,
        /// The unrecognized plugin name.
        plugin: String,
    },

    /// A repository URL references a secret that was not supplied
    #[error("Unknown secret '{0}' referenced in a package repository URL")]
    UnknownSecret(String),

    /// Any other semantic problem with the configuration
    #[error("{0}")]
    Invalid(String),
}

/// Errors raised by an environment backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    /// The backend failed its readiness check
    #[error("{backend} is broken")]
    NotReady {
        /// Name of the backend.
        backend: String,
        /// Reason reported by the readiness check.
        reason: String,
    },

    /// An environment could not be launched
    #[error("Failed to launch environment '{name}': {reason}")]
    Launch {
        /// Instance name.
        name: String,
        /// Error message from the backend.
        reason: String,
    },

    /// A command could not be started inside the environment
    #[error("Failed to execute a command in '{name}': {reason}")]
    Execute {
        /// Instance name.
        name: String,
        /// Error message from the backend.
        reason: String,
    },

    /// A file could not be moved in or out of the environment
    #[error("Failed to transfer '{}' for '{name}': {reason}", .path.display())]
    Transfer {
        /// Instance name.
        name: String,
        /// Path inside the environment.
        path: PathBuf,
        /// Error message from the backend.
        reason: String,
    },

    /// An environment could not be destroyed
    #[error("Failed to destroy environment '{name}': {reason}")]
    Destroy {
        /// Instance name.
        name: String,
        /// Error message from the backend.
        reason: String,
    },

    /// Listing the project's environments failed
    #[error("Failed to list environments: {0}")]
    List(String),
}

/// Errors raised while collecting or importing artifacts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// An output pattern matched nothing
    #[error("{pattern} has not matched any output files.")]
    NoMatches {
        /// The glob pattern as written in the configuration.
        pattern: String,
    },

    /// An output pattern is not a valid glob
    #[error("Invalid output pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The glob pattern as written in the configuration.
        pattern: String,
        /// Parser error.
        reason: String,
    },

    /// No prior instance of the input job recorded output
    #[error(
        "Requested input from '{job}', but that job was not previously executed or did not produce any output artifacts."
    )]
    InputMissing {
        /// Name of the requested job.
        job: String,
    },

    /// Several prior instances of the input job recorded output
    #[error(
        "Requested input from '{job}', but more than one job with that name was previously executed and produced output artifacts in the following paths: {}.",
        PathList(.paths)
    )]
    InputAmbiguous {
        /// Name of the requested job.
        job: String,
        /// Every candidate output directory.
        paths: Vec<PathBuf>,
    },

    /// A job declares input but the run has no output directory
    #[error("Job '{job}' requests input, but no output directory was given")]
    NoOutputDirectory {
        /// Name of the job declaring the input.
        job: String,
    },

    /// The dynamic properties file is malformed
    #[error("Invalid dynamic properties in '{}': {reason}", .path.display())]
    DynamicProperties {
        /// Path of the properties file inside the project.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The properties file of a record could not be read or written
    #[error("Invalid properties file '{}': {reason}", .path.display())]
    Properties {
        /// Path of the properties file on the host.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

/// The error taxonomy of a pipeline run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Invalid or inconsistent configuration
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// A path resolved outside its allowed base
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),

    /// The backend or an environment failed
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    /// The job's own script exited non-zero
    #[error("Job '{job}' for {series}/{architecture} failed with exit status {code}.")]
    CommandFailed {
        /// Name of the job.
        job: String,
        /// Target series.
        series: String,
        /// Target architecture.
        architecture: String,
        /// Exit status of the script.
        code: i32,
    },

    /// A setup command (repositories, packages, snaps) exited non-zero
    #[error("`{action}` failed with exit status {code}.")]
    SetupFailed {
        /// The command that failed, as shown to the user.
        action: String,
        /// Exit status of the command.
        code: i32,
    },

    /// The signing key of a PPA could not be retrieved
    #[error(
        "Error retrieving the signing key for the '{ppa}' ppa. Please check if the PPA exists and is not empty."
    )]
    SigningKey {
        /// The PPA as `owner/name/distribution`.
        ppa: String,
    },

    /// Output collection or input import failed
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Summary of a stage in which at least one job failed
    #[error("Some jobs in {} failed; stopping.", NameList(.jobs))]
    StageAggregate {
        /// Failed job names, in dispatch order.
        jobs: Vec<String>,
    },

    /// Destroying the environments created by this run failed
    #[error("Failed to clean up environments: {0}")]
    Cleanup(String),

    /// Host filesystem error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl RunError {
    /// The process exit code this error maps to.
    ///
    /// A stage summary carries no code of its own; the code of the run comes
    /// from the instance failure it summarizes.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } | Self::SetupFailed { code, .. } => Some(*code),
            Self::StageAggregate { .. } => None,
            _ => Some(1),
        }
    }
}

/// Renders names as `['a', 'b']`
struct NameList<'a>(&'a [String]);

impl fmt::Display for NameList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{name}'")?;
        }
        write!(f, "]")
    }
}

struct PathList<'a>(&'a [PathBuf]);

impl fmt::Display for PathList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|p| p.display().to_string()).collect();
        NameList(&names).fmt(f)
    }
}
