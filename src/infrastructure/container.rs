//! Container environments (Docker/Podman)
//!
//! Drives the `docker` or `podman` CLI. Every environment is a long-lived
//! container running `sleep infinity` with the project bind-mounted at the
//! managed project path; commands are run with `exec` and files move with
//! `cp`.

use crate::executor::{
    CommandOutput, Environment, EnvironmentProvider, ExecOptions, FileMode, HealthStatus,
    LaunchSpec,
};
use crate::infrastructure::config::{DEFAULT_IMAGE_TEMPLATE, DEFAULT_MANAGED_PROJECT_PATH};
use crate::pipeline::EnvironmentError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

/// Host variables passed through to every container
const PROXY_VARIABLES: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
];

/// Container runtime type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl ContainerRuntime {
    /// Gets the runtime executable name
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Flags passing NVIDIA GPUs through to a container
    #[must_use]
    pub fn gpu_args(self) -> Vec<String> {
        match self {
            ContainerRuntime::Docker => vec!["--gpus".to_string(), "all".to_string()],
            ContainerRuntime::Podman => {
                vec!["--device".to_string(), "nvidia.com/gpu=all".to_string()]
            }
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Provider of container environments
#[derive(Debug, Clone)]
pub struct ContainerProvider {
    runtime: ContainerRuntime,
    image_template: String,
    managed_project_path: PathBuf,
}

impl ContainerProvider {
    /// Creates a provider for `runtime` with default image and mount point
    #[must_use]
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            image_template: DEFAULT_IMAGE_TEMPLATE.to_string(),
            managed_project_path: PathBuf::from(DEFAULT_MANAGED_PROJECT_PATH),
        }
    }

    /// The runtime driving this provider
    #[must_use]
    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    /// Sets the image template; `{series}` is replaced
    #[must_use]
    pub fn with_image_template(mut self, template: impl Into<String>) -> Self {
        self.image_template = template.into();
        self
    }

    /// Sets where the project is mounted
    #[must_use]
    pub fn with_managed_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.managed_project_path = path.into();
        self
    }

    /// The image used for `series`
    #[must_use]
    pub fn image_for(&self, series: &str) -> String {
        self.image_template.replace("{series}", series)
    }

    /// Arguments of the `run` command creating an environment
    #[must_use]
    pub fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.instance_name.clone(),
            "-v".to_string(),
            format!(
                "{}:{}",
                spec.project_path.display(),
                self.managed_project_path.display()
            ),
        ];
        for variable in PROXY_VARIABLES {
            if let Ok(value) = std::env::var(variable) {
                args.push("-e".to_string());
                args.push(format!("{variable}={value}"));
            }
        }
        if spec.gpu_nvidia {
            args.extend(self.runtime.gpu_args());
        }
        args.extend([
            self.image_for(&spec.series),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }

    fn output(&self, args: &[String]) -> Result<Output, String> {
        Command::new(self.runtime.command())
            .args(args)
            .output()
            .map_err(|e| format!("{}: {e}", self.runtime))
    }

    fn exists(&self, name: &str) -> Result<bool, EnvironmentError> {
        Ok(self.list_instances(name)?.iter().any(|n| n == name))
    }

    fn provision_user(&self, name: &str, user: &str) -> Result<(), EnvironmentError> {
        let args: Vec<String> = ["exec", name, "useradd", "-m", user]
            .into_iter()
            .map(String::from)
            .collect();
        let output = self.output(&args).map_err(|reason| EnvironmentError::Launch {
            name: name.to_string(),
            reason,
        })?;
        // Exit status 9 means the user already exists.
        match output.status.code() {
            Some(0 | 9) => Ok(()),
            _ => Err(EnvironmentError::Launch {
                name: name.to_string(),
                reason: stderr_of(&output),
            }),
        }
    }
}

impl EnvironmentProvider for ContainerProvider {
    fn name(&self) -> &str {
        self.runtime.command()
    }

    fn health_check(&self) -> HealthStatus {
        match self.output(&["info".to_string()]) {
            Ok(output) if output.status.success() => HealthStatus::Healthy,
            Ok(output) => HealthStatus::Unhealthy {
                reason: stderr_of(&output),
            },
            Err(reason) => HealthStatus::Unhealthy { reason },
        }
    }

    fn managed_project_path(&self) -> PathBuf {
        self.managed_project_path.clone()
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn Environment>, EnvironmentError> {
        let name = &spec.instance_name;
        let launch_error = |reason: String| EnvironmentError::Launch {
            name: name.clone(),
            reason,
        };
        let args = if self.exists(name)? {
            vec!["start".to_string(), name.clone()]
        } else {
            self.run_args(spec)
        };
        tracing::debug!(runtime = %self.runtime, args = ?args, "Launching environment");
        let output = self.output(&args).map_err(launch_error)?;
        if !output.status.success() {
            return Err(launch_error(stderr_of(&output)));
        }
        if let Some(user) = &spec.unprivileged_user {
            self.provision_user(name, user)?;
        }
        Ok(Arc::new(ContainerEnvironment {
            runtime: self.runtime,
            name: name.clone(),
        }))
    }

    fn destroy(&self, name: &str) -> Result<(), EnvironmentError> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let destroy_error = |reason: String| EnvironmentError::Destroy {
            name: name.to_string(),
            reason,
        };
        let output = self.output(&args).map_err(destroy_error)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(destroy_error(stderr_of(&output)))
        }
    }

    fn list_instances(&self, prefix: &str) -> Result<Vec<String>, EnvironmentError> {
        let args: Vec<String> = ["ps", "-a", "--format", "{{.Names}}"]
            .into_iter()
            .map(String::from)
            .collect();
        let output = self.output(&args).map_err(EnvironmentError::List)?;
        if !output.status.success() {
            return Err(EnvironmentError::List(stderr_of(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }
}

/// A running container
#[derive(Debug, Clone)]
pub struct ContainerEnvironment {
    runtime: ContainerRuntime,
    name: String,
}

impl ContainerEnvironment {
    /// Arguments of the `exec` command running `argv`
    #[must_use]
    pub fn exec_args(&self, argv: &[String], options: &ExecOptions) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            options.cwd.display().to_string(),
        ];
        for (key, value) in &options.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.name.clone());
        args.extend(argv.iter().cloned());
        args
    }

    fn transfer_error(&self, path: &Path, reason: String) -> EnvironmentError {
        EnvironmentError::Transfer {
            name: self.name.clone(),
            path: path.to_path_buf(),
            reason,
        }
    }

    fn run_transfer(&self, args: &[String], path: &Path) -> Result<(), EnvironmentError> {
        let output = Command::new(self.runtime.command())
            .args(args)
            .output()
            .map_err(|e| self.transfer_error(path, e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.transfer_error(path, stderr_of(&output)))
        }
    }

    fn in_container(&self, argv: &[&str], path: &Path) -> Result<(), EnvironmentError> {
        let argv: Vec<String> = argv.iter().map(|a| (*a).to_string()).collect();
        let output = self
            .execute(&argv, &ExecOptions::in_dir("/").captured())
            .map_err(|e| self.transfer_error(path, e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(self.transfer_error(
                path,
                format!("`{}` exited with status {}", argv.join(" "), output.exit_code),
            ))
        }
    }
}

impl Environment for ContainerEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        argv: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput, EnvironmentError> {
        let mut cmd = Command::new(self.runtime.command());
        cmd.args(self.exec_args(argv, options));
        let execute_error = |e: std::io::Error| EnvironmentError::Execute {
            name: self.name.clone(),
            reason: e.to_string(),
        };
        if options.capture_output {
            let output = cmd.stderr(Stdio::inherit()).output().map_err(execute_error)?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        } else {
            let status = cmd.status().map_err(execute_error)?;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::new(),
            })
        }
    }

    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError> {
        if let Some(parent) = destination.parent() {
            let parent = parent.to_string_lossy();
            self.in_container(&["mkdir", "-p", &*parent], destination)?;
        }
        self.run_transfer(
            &[
                "cp".to_string(),
                source.display().to_string(),
                format!("{}:{}", self.name, destination.display()),
            ],
            destination,
        )
    }

    fn push_content(
        &self,
        content: &[u8],
        destination: &Path,
        mode: &FileMode,
    ) -> Result<(), EnvironmentError> {
        let mut staging = tempfile::NamedTempFile::new()
            .map_err(|e| self.transfer_error(destination, e.to_string()))?;
        staging
            .write_all(content)
            .map_err(|e| self.transfer_error(destination, e.to_string()))?;
        self.push_file(staging.path(), destination)?;
        let target = destination.to_string_lossy();
        let bits = format!("{:o}", mode.mode);
        let owner = format!("{}:{}", mode.user, mode.group);
        self.in_container(&["chmod", bits.as_str(), &*target], destination)?;
        self.in_container(&["chown", owner.as_str(), &*target], destination)
    }

    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), EnvironmentError> {
        self.run_transfer(
            &[
                "cp".to_string(),
                format!("{}:{}", self.name, source.display()),
                destination.display().to_string(),
            ],
            source,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn spec(gpu_nvidia: bool) -> LaunchSpec {
        LaunchSpec {
            instance_name: "stagecraft-proj-1-focal-amd64".to_string(),
            series: "focal".to_string(),
            architecture: "amd64".to_string(),
            project_path: PathBuf::from("/home/user/proj"),
            gpu_nvidia,
            unprivileged_user: None,
        }
    }

    #[test]
    fn test_container_runtime_display() {
        assert_eq!(ContainerRuntime::Docker.to_string(), "docker");
        assert_eq!(ContainerRuntime::Podman.to_string(), "podman");
    }

    #[test]
    fn test_image_template() {
        let provider = ContainerProvider::new(ContainerRuntime::Docker);
        assert_eq!(provider.image_for("jammy"), "ubuntu:jammy");
        let provider = provider.with_image_template("registry.local/build:{series}");
        assert_eq!(provider.image_for("focal"), "registry.local/build:focal");
    }

    #[test]
    fn test_run_args_mount_project() {
        let provider = ContainerProvider::new(ContainerRuntime::Docker);
        let args = provider.run_args(&spec(false));
        assert_eq!(args[..6], [
            "run",
            "-d",
            "--name",
            "stagecraft-proj-1-focal-amd64",
            "-v",
            "/home/user/proj:/build/project",
        ]);
        assert_eq!(args[args.len() - 3..], ["ubuntu:focal", "sleep", "infinity"]);
        assert!(!args.contains(&"--gpus".to_string()));
    }

    #[test]
    fn test_run_args_gpu_passthrough() {
        let docker = ContainerProvider::new(ContainerRuntime::Docker).run_args(&spec(true));
        assert!(docker.windows(2).any(|w| w == ["--gpus", "all"]));
        let podman = ContainerProvider::new(ContainerRuntime::Podman).run_args(&spec(true));
        assert!(podman.windows(2).any(|w| w == ["--device", "nvidia.com/gpu=all"]));
    }

    #[test]
    fn test_exec_args_pass_env_and_cwd() {
        let environment = ContainerEnvironment {
            runtime: ContainerRuntime::Podman,
            name: "box".to_string(),
        };
        let options = ExecOptions::in_dir("/build/project")
            .with_env(BTreeMap::from([("A".to_string(), "1=2".to_string())]));
        let argv = vec!["bash".to_string(), "-ec".to_string(), "tox".to_string()];
        assert_eq!(
            environment.exec_args(&argv, &options),
            vec!["exec", "-w", "/build/project", "-e", "A=1=2", "box", "bash", "-ec", "tox"]
        );
    }

    #[test]
    fn test_runtime_from_config_value() {
        let runtime: ContainerRuntime = serde_yaml::from_str("podman").unwrap();
        assert_eq!(runtime, ContainerRuntime::Podman);
    }
}
