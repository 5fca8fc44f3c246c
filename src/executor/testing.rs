//! In-process environment backend for tests
//!
//! Every environment has a private root directory standing in for its
//! filesystem. `bash`, `find` and `readlink` run on the host against that
//! root; any other command is recorded and answered from a scripted table.
//!
//! Two layouts are available. [`LocalProvider::new`] shares a host project
//! directory at its own path, like a bind mount; only the project is shared,
//! so scripts must not step out of it. [`LocalProvider::isolated`] keeps the
//! project inside the environment root at [`ISOLATED_PROJECT`], so the
//! project's parent exists only inside the environment.

use crate::executor::traits::{
    CommandOutput, Environment, EnvironmentProvider, ExecOptions, FileMode, HealthStatus,
    LaunchSpec, SigningKeySource, SnapRevisionQuery,
};
use crate::pipeline::{EnvironmentError, PpaReference, RunError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Managed project path of isolated environments
pub(crate) const ISOLATED_PROJECT: &str = "/build/project";

const HOST_COMMANDS: [&str; 3] = ["bash", "find", "readlink"];

type Scripted = Vec<(String, CommandOutput)>;

/// A host-backed environment
pub(crate) struct LocalEnvironment {
    name: String,
    root: Arc<tempfile::TempDir>,
    shared_project: Option<PathBuf>,
    commands: Mutex<Vec<Vec<String>>>,
    scripted: Mutex<Scripted>,
    modes: Mutex<HashMap<PathBuf, FileMode>>,
}

impl LocalEnvironment {
    /// An environment sharing the host `project` at the same path
    pub(crate) fn new(name: &str, project: &Path) -> Self {
        Self::with_root(
            name,
            Arc::new(tempfile::tempdir().unwrap()),
            Some(project.to_path_buf()),
        )
    }

    /// An environment whose project lives at [`ISOLATED_PROJECT`] inside its root
    pub(crate) fn isolated(name: &str) -> Self {
        let env = Self::with_root(name, Arc::new(tempfile::tempdir().unwrap()), None);
        fs::create_dir_all(env.map(Path::new(ISOLATED_PROJECT))).unwrap();
        env
    }

    fn with_root(name: &str, root: Arc<tempfile::TempDir>, shared_project: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root,
            shared_project,
            commands: Mutex::new(Vec::new()),
            scripted: Mutex::new(Vec::new()),
            modes: Mutex::new(HashMap::new()),
        }
    }

    /// Every command executed so far
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    /// Commands executed so far, joined with spaces
    pub(crate) fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(|argv| argv.join(" ")).collect()
    }

    /// Seeds a file at an environment path
    pub(crate) fn write_file(&self, path: &Path, content: &str) {
        let target = self.map(path);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(target, content).unwrap();
    }

    /// Reads a file at an environment path
    pub(crate) fn read_file(&self, path: &Path) -> Option<String> {
        fs::read_to_string(self.map(path)).ok()
    }

    /// Mode a file was pushed with
    pub(crate) fn file_mode(&self, path: &Path) -> Option<FileMode> {
        self.modes.lock().get(path).cloned()
    }

    /// Host location of an environment path
    pub(crate) fn map(&self, path: &Path) -> PathBuf {
        match &self.shared_project {
            Some(project) if path.starts_with(project) => path.to_path_buf(),
            _ => self
                .root
                .path()
                .join(path.strip_prefix("/").unwrap_or(path)),
        }
    }

    /// Environment path of a host location
    fn unmap(&self, host: &Path) -> PathBuf {
        if self
            .shared_project
            .as_ref()
            .is_some_and(|project| host.starts_with(project))
        {
            return host.to_path_buf();
        }
        match host.strip_prefix(self.root.path()) {
            Ok(rest) => Path::new("/").join(rest),
            Err(_) => host.to_path_buf(),
        }
    }

    fn host_args(&self, program: &str, args: &[String]) -> Vec<String> {
        if program == "bash" {
            return args.to_vec();
        }
        args.iter()
            .map(|arg| {
                if arg.starts_with('/') {
                    self.map(Path::new(arg)).display().to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    fn guest_stdout(&self, program: &str, stdout: &[u8]) -> String {
        let stdout = String::from_utf8_lossy(stdout);
        if program != "readlink" {
            return stdout.into_owned();
        }
        stdout
            .split('\0')
            .filter(|line| !line.is_empty())
            .map(|line| format!("{}\0", self.unmap(Path::new(line)).display()))
            .collect()
    }

    fn transfer_error(&self, path: &Path, err: &std::io::Error) -> EnvironmentError {
        EnvironmentError::Transfer {
            name: self.name.clone(),
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        argv: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput, EnvironmentError> {
        self.commands.lock().push(argv.to_vec());
        let argv = match argv {
            [runuser, flag, _, separator, rest @ ..]
                if runuser == "runuser" && flag == "-u" && separator == "--" =>
            {
                rest
            }
            _ => argv,
        };
        let Some((program, args)) = argv
            .split_first()
            .filter(|(program, _)| HOST_COMMANDS.contains(&program.as_str()))
        else {
            let line = argv.join(" ");
            let scripted = self.scripted.lock();
            return Ok(scripted
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default());
        };

        let mut cmd = Command::new(program);
        cmd.args(self.host_args(program, args))
            .current_dir(self.map(&options.cwd))
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .envs(&options.env);
        let output = cmd.output().map_err(|e| EnvironmentError::Execute {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: if options.capture_output {
                self.guest_stdout(program, &output.stdout)
            } else {
                String::new()
            },
        })
    }

    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError> {
        let target = self.map(destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| self.transfer_error(destination, &e))?;
        }
        fs::copy(source, &target).map_err(|e| self.transfer_error(destination, &e))?;
        Ok(())
    }

    fn push_content(
        &self,
        content: &[u8],
        destination: &Path,
        mode: &FileMode,
    ) -> Result<(), EnvironmentError> {
        let target = self.map(destination);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| self.transfer_error(destination, &e))?;
        }
        fs::write(&target, content).map_err(|e| self.transfer_error(destination, &e))?;
        self.modes
            .lock()
            .insert(destination.to_path_buf(), mode.clone());
        Ok(())
    }

    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError> {
        fs::copy(self.map(source), destination).map_err(|e| self.transfer_error(source, &e))?;
        Ok(())
    }
}

/// Provider handing out [`LocalEnvironment`]s, one per instance name
pub(crate) struct LocalProvider {
    project: PathBuf,
    managed_project: PathBuf,
    isolated_root: Option<Arc<tempfile::TempDir>>,
    health: HealthStatus,
    fail_destroy: bool,
    launch_delay: Duration,
    scripted: Scripted,
    seeded: Vec<(PathBuf, String)>,
    environments: Mutex<BTreeMap<String, Arc<LocalEnvironment>>>,
    existing: Mutex<Vec<String>>,
    launching: Mutex<HashSet<String>>,
    launches: Mutex<Vec<LaunchSpec>>,
    destroyed: Mutex<Vec<String>>,
}

impl LocalProvider {
    /// Environments sharing the host `project`
    pub(crate) fn new(project: &Path) -> Self {
        Self::build(project.to_path_buf(), project.to_path_buf(), None)
    }

    /// Environments sharing one root that holds the project
    ///
    /// The host side of the project is [`LocalProvider::project_dir`].
    pub(crate) fn isolated() -> Self {
        let root = Arc::new(tempfile::tempdir().unwrap());
        let project = root.path().join(ISOLATED_PROJECT.trim_start_matches('/'));
        fs::create_dir_all(&project).unwrap();
        Self::build(project, PathBuf::from(ISOLATED_PROJECT), Some(root))
    }

    fn build(project: PathBuf, managed_project: PathBuf, isolated_root: Option<Arc<tempfile::TempDir>>) -> Self {
        Self {
            project,
            managed_project,
            isolated_root,
            health: HealthStatus::Healthy,
            fail_destroy: false,
            launch_delay: Duration::ZERO,
            scripted: Vec::new(),
            seeded: Vec::new(),
            environments: Mutex::new(BTreeMap::new()),
            existing: Mutex::new(Vec::new()),
            launching: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Host directory of the project
    pub(crate) fn project_dir(&self) -> &Path {
        &self.project
    }

    pub(crate) fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub(crate) fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// Makes every launch take `delay`; overlapping launches of one name fail
    pub(crate) fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Scripts a command in every environment launched later
    pub(crate) fn with_script(mut self, prefix: &str, exit_code: i32, stdout: &str) -> Self {
        self.scripted.push((
            prefix.to_string(),
            CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
            },
        ));
        self
    }

    /// Seeds a file in every environment launched later
    pub(crate) fn with_file(mut self, path: &str, content: &str) -> Self {
        self.seeded.push((PathBuf::from(path), content.to_string()));
        self
    }

    /// Pretends an instance already exists on the backend
    pub(crate) fn add_existing(&self, name: &str) {
        self.existing.lock().push(name.to_string());
    }

    pub(crate) fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    pub(crate) fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }

    /// The only environment launched so far
    pub(crate) fn single_environment(&self) -> Arc<LocalEnvironment> {
        let environments = self.environments.lock();
        assert_eq!(environments.len(), 1, "expected exactly one environment");
        environments.values().next().cloned().unwrap()
    }

    fn new_environment(&self, name: &str) -> LocalEnvironment {
        let env = match &self.isolated_root {
            Some(root) => LocalEnvironment::with_root(name, Arc::clone(root), None),
            None => LocalEnvironment::new(name, &self.project),
        };
        env.scripted.lock().extend(self.scripted.iter().cloned());
        for (path, content) in &self.seeded {
            env.write_file(path, content);
        }
        env
    }
}

impl EnvironmentProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn health_check(&self) -> HealthStatus {
        self.health.clone()
    }

    fn managed_project_path(&self) -> PathBuf {
        self.managed_project.clone()
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn Environment>, EnvironmentError> {
        if !self.launching.lock().insert(spec.instance_name.clone()) {
            return Err(EnvironmentError::Launch {
                name: spec.instance_name.clone(),
                reason: "the container name is already in use".to_string(),
            });
        }
        std::thread::sleep(self.launch_delay);
        self.launches.lock().push(spec.clone());
        let environment = self
            .environments
            .lock()
            .entry(spec.instance_name.clone())
            .or_insert_with(|| Arc::new(self.new_environment(&spec.instance_name)))
            .clone();
        let mut existing = self.existing.lock();
        if !existing.contains(&spec.instance_name) {
            existing.push(spec.instance_name.clone());
        }
        self.launching.lock().remove(&spec.instance_name);
        Ok(environment)
    }

    fn destroy(&self, name: &str) -> Result<(), EnvironmentError> {
        if self.fail_destroy {
            return Err(EnvironmentError::Destroy {
                name: name.to_string(),
                reason: "backend refused".to_string(),
            });
        }
        self.existing.lock().retain(|n| n != name);
        self.destroyed.lock().push(name.to_string());
        Ok(())
    }

    fn list_instances(&self, prefix: &str) -> Result<Vec<String>, EnvironmentError> {
        Ok(self
            .existing
            .lock()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Signing keys answered from a table keyed by `owner/name/distribution`
#[derive(Default)]
pub(crate) struct FixedSigningKeys {
    pub(crate) keys: HashMap<String, String>,
}

impl SigningKeySource for FixedSigningKeys {
    fn signing_key(&self, ppa: &PpaReference) -> Result<String, RunError> {
        self.keys
            .get(&ppa.to_string())
            .cloned()
            .ok_or_else(|| RunError::SigningKey {
                ppa: ppa.to_string(),
            })
    }
}

/// Snap revisions answered from a table
#[derive(Default)]
pub(crate) struct FixedSnapRevisions {
    pub(crate) revisions: HashMap<String, String>,
}

impl SnapRevisionQuery for FixedSnapRevisions {
    fn revision(
        &self,
        _environment: &dyn Environment,
        snap: &str,
    ) -> Result<Option<String>, EnvironmentError> {
        Ok(self.revisions.get(snap).cloned())
    }
}
