//! Run-scoped state

use crate::artifacts::ArtifactStore;
use crate::pipeline::{PluginSettings, RunError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How the instances of one stage are dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One instance at a time, in dispatch order
    #[default]
    Sequential,
    /// All instances of a stage on their own threads
    Parallel,
}

/// When environments created by the run are destroyed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanPolicy {
    /// Once, after the last stage
    #[default]
    AtEnd,
    /// After each instance, or after each stage in parallel mode
    PerJob,
}

/// Caller-supplied settings of a run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Root of the artifact store; outputs are not collected without it
    pub output_dir: Option<PathBuf>,
    /// `--set-env` pairs, highest precedence
    pub set_env: BTreeMap<String, String>,
    /// Secrets substituted into repository URLs
    pub secrets: HashMap<String, String>,
    /// Extra `sources.list` lines appended before the configured ones
    pub package_repositories: Vec<String>,
    /// Lines that replace the whole `sources.list`
    pub replace_repositories: Vec<String>,
    /// Extra plugin settings
    pub plugin_settings: PluginSettings,
    /// Architecture to run, the host's when unset
    pub architecture: Option<String>,
    /// Cleanup policy
    pub clean: CleanPolicy,
    /// Dispatch mode
    pub mode: ExecutionMode,
    /// Pass NVIDIA GPUs through to environments
    pub gpu_nvidia: bool,
}

#[derive(Debug, Default)]
struct CreatedState {
    order: Vec<String>,
    destroyed: HashSet<String>,
}

/// Environments acquired during this run, in acquisition order
#[derive(Debug, Default)]
pub struct CreatedInstances {
    state: Mutex<CreatedState>,
    acquiring: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CreatedInstances {
    /// Records `name`; returns false if it was already recorded
    pub fn record(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.order.iter().any(|n| n == name) {
            // Reacquired after a per-job cleanup.
            state.destroyed.remove(name)
        } else {
            state.order.push(name.to_string());
            true
        }
    }

    /// Recorded names not destroyed yet
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter(|n| !state.destroyed.contains(*n))
            .cloned()
            .collect()
    }

    /// Marks `name` destroyed; returns false if it already was
    pub fn mark_destroyed(&self, name: &str) -> bool {
        self.state.lock().destroyed.insert(name.to_string())
    }

    /// Every recorded name
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state.lock().order.clone()
    }

    /// Lock held while `name` is being acquired
    ///
    /// Every caller asking for the same name gets the same lock.
    #[must_use]
    pub fn acquisition_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.acquiring.lock().entry(name.to_string()).or_default())
    }
}

/// State of one pipeline invocation
#[derive(Debug)]
pub struct RunContext {
    /// Project name, the last component of the project path
    pub project_name: String,
    /// Project directory on the host
    pub project_path: PathBuf,
    /// Architecture instances are filtered to
    pub architecture: String,
    /// Caller-supplied settings
    pub options: RunOptions,
    created: CreatedInstances,
    errors: Mutex<Vec<RunError>>,
}

impl RunContext {
    /// Creates the context for a run over `project_path`
    #[must_use]
    pub fn new(project_path: impl Into<PathBuf>, options: RunOptions) -> Self {
        let project_path = project_path.into();
        let project_name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let architecture = options
            .architecture
            .clone()
            .unwrap_or_else(|| host_architecture().to_string());
        Self {
            project_name,
            project_path,
            architecture,
            options,
            created: CreatedInstances::default(),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Project directory on the host
    #[must_use]
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Environments acquired during this run
    #[must_use]
    pub fn created(&self) -> &CreatedInstances {
        &self.created
    }

    /// The artifact store, if an output directory was given
    #[must_use]
    pub fn artifact_store(&self) -> Option<ArtifactStore> {
        self.options.output_dir.as_ref().map(ArtifactStore::new)
    }

    /// Appends an error to the run's ordered list
    pub fn record_error(&self, error: RunError) {
        self.errors.lock().push(error);
    }

    /// Errors recorded so far, in order
    #[must_use]
    pub fn errors(&self) -> Vec<RunError> {
        self.errors.lock().clone()
    }
}

/// The host architecture, in Debian naming
#[must_use]
pub fn host_architecture() -> &'static str {
    debian_architecture(std::env::consts::ARCH)
}

/// Maps a Rust target architecture to its Debian name
#[must_use]
pub fn debian_architecture(arch: &'static str) -> &'static str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_created_instances_are_ordered_and_unique() {
        let created = CreatedInstances::default();
        assert!(created.record("b"));
        assert!(created.record("a"));
        assert!(!created.record("b"));
        assert_eq!(created.names(), vec!["b", "a"]);
        assert_eq!(created.pending(), vec!["b", "a"]);
    }

    #[test]
    fn test_destroyed_instances_are_not_pending() {
        let created = CreatedInstances::default();
        created.record("a");
        created.record("b");
        assert!(created.mark_destroyed("a"));
        assert!(!created.mark_destroyed("a"));
        assert_eq!(created.pending(), vec!["b"]);

        // Reacquiring makes it pending again.
        assert!(created.record("a"));
        assert_eq!(created.pending(), vec!["a", "b"]);
    }

    #[test]
    fn test_acquisition_lock_is_shared_per_name() {
        let created = CreatedInstances::default();
        let first = created.acquisition_lock("a");
        assert!(Arc::ptr_eq(&first, &created.acquisition_lock("a")));
        assert!(!Arc::ptr_eq(&first, &created.acquisition_lock("b")));

        let _held = first.lock();
        assert!(created.acquisition_lock("a").try_lock().is_none());
        assert!(created.acquisition_lock("b").try_lock().is_some());
    }

    #[test]
    fn test_context_defaults() {
        let context = RunContext::new("/srv/my-project", RunOptions::default());
        assert_eq!(context.project_name, "my-project");
        assert_eq!(context.architecture, host_architecture());
        assert!(context.artifact_store().is_none());
        assert!(context.errors().is_empty());
    }

    #[test]
    fn test_architecture_override() {
        let options = RunOptions {
            architecture: Some("s390x".to_string()),
            ..Default::default()
        };
        assert_eq!(RunContext::new("/srv/p", options).architecture, "s390x");
    }

    #[test]
    fn test_debian_architecture_names() {
        assert_eq!(debian_architecture("x86_64"), "amd64");
        assert_eq!(debian_architecture("aarch64"), "arm64");
        assert_eq!(debian_architecture("powerpc64"), "ppc64el");
    }
}
