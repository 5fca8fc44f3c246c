//! Running one job instance
//!
//! Each step can fail the instance; nothing is retried and siblings in the
//! same stage are unaffected.

use crate::artifacts::ArtifactRecord;
use crate::executor::context::RunContext;
use crate::executor::lifecycle::{EnvironmentLifecycle, UNPRIVILEGED_USER};
use crate::executor::shell::{job_environment, join_scripts, render_command, script_argv};
use crate::executor::traits::{
    Environment, ExecOptions, FileMode, SigningKeySource, SnapRevisionQuery,
};
use crate::pipeline::snaps::normalize_snaps;
use crate::pipeline::{
    ArtifactError, ConfigError, JobInstance, License, RunError, merge_contributions,
};
use std::path::Path;
use tracing::{debug, info, info_span};

/// Path of the APT sources file inside an environment
pub const SOURCES_LIST: &str = "/etc/apt/sources.list";

/// What one instance produced: its artifact record, if any, or why it failed
pub type JobOutcome = Result<Option<ArtifactRecord>, RunError>;

/// Runs job instances inside environments
pub struct JobExecutor<'a> {
    lifecycle: &'a EnvironmentLifecycle<'a>,
    signing_keys: &'a dyn SigningKeySource,
    snap_revisions: &'a dyn SnapRevisionQuery,
    license: Option<&'a License>,
}

impl<'a> JobExecutor<'a> {
    /// Creates an executor acquiring environments through `lifecycle`
    #[must_use]
    pub fn new(
        lifecycle: &'a EnvironmentLifecycle<'a>,
        signing_keys: &'a dyn SigningKeySource,
        snap_revisions: &'a dyn SnapRevisionQuery,
    ) -> Self {
        Self {
            lifecycle,
            signing_keys,
            snap_revisions,
            license: None,
        }
    }

    /// License injected into every recorded `properties` file
    #[must_use]
    pub fn with_license(mut self, license: Option<&'a License>) -> Self {
        self.license = license;
        self
    }

    /// Runs `instance` from environment acquisition to output collection
    pub fn execute(&self, instance: &JobInstance, context: &RunContext) -> JobOutcome {
        let span = info_span!(
            "job",
            job = %instance.name(),
            index = instance.index(),
            series = %instance.series(),
            architecture = %instance.architecture,
        );
        let _entered = span.enter();
        let job = &instance.job;

        let contributions = merge_contributions(
            job,
            &context.options.plugin_settings,
            context.project_path(),
        )?;
        let script = join_scripts(
            contributions.run_before.as_deref(),
            contributions.run.as_deref(),
            contributions.run_after.as_deref(),
        )
        .ok_or_else(|| ConfigError::MissingRun {
            job: job.name.clone(),
            series: job.series.clone(),
            architecture: instance.architecture.clone(),
        })?;

        let environment = self.lifecycle.acquire(context, instance)?;
        let managed_project = self.lifecycle.provider().managed_project_path();

        self.configure_repositories(environment.as_ref(), instance, context)?;
        install_packages(environment.as_ref(), &managed_project, &contributions.packages)?;
        self.install_snaps(environment.as_ref(), &contributions.snaps)?;

        let env = job_environment(&contributions.environment, &context.options.set_env);

        if let Some(input) = &job.input {
            let store = context
                .artifact_store()
                .ok_or_else(|| ArtifactError::NoOutputDirectory {
                    job: job.name.clone(),
                })?;
            let record = store.find_input(&input.job_name)?;
            store.import(
                environment.as_ref(),
                context.project_path(),
                &managed_project,
                &record,
                &input.target_directory,
            )?;
        }

        let user = (!job.root).then_some(UNPRIVILEGED_USER);
        let argv = script_argv(&script, user);
        info!(command = %render_command(&argv), "Running job");
        let output = environment.execute(
            &argv,
            &ExecOptions::in_dir(&managed_project).with_env(env),
        )?;
        if !output.success() {
            return Err(RunError::CommandFailed {
                job: job.name.clone(),
                series: job.series.clone(),
                architecture: instance.architecture.clone(),
                code: output.exit_code,
            });
        }

        match context.artifact_store() {
            Some(store) => store.record_output(
                environment.as_ref(),
                &managed_project,
                instance,
                job.output.as_ref(),
                self.license,
            ),
            None => Ok(None),
        }
    }

    fn configure_repositories(
        &self,
        environment: &dyn Environment,
        instance: &JobInstance,
        context: &RunContext,
    ) -> Result<(), RunError> {
        let job = &instance.job;
        let options = &context.options;
        if !options.replace_repositories.is_empty() {
            return push_sources_list(environment, &options.replace_repositories);
        }
        if job.package_repositories.is_empty() && options.package_repositories.is_empty() {
            return Ok(());
        }

        for repository in &job.package_repositories {
            if let Some(ppa) = repository.ppa_reference()? {
                let key = self.signing_keys.signing_key(&ppa)?;
                environment.push_content(
                    key.as_bytes(),
                    Path::new(&ppa.key_path()),
                    &FileMode::root_readable(),
                )?;
                debug!(ppa = %ppa, "Installed signing key");
            }
        }

        let staging = tempfile::NamedTempFile::new()?;
        environment.pull_file(Path::new(SOURCES_LIST), staging.path())?;
        let existing = std::fs::read_to_string(staging.path())?;

        let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
        lines.extend(options.package_repositories.iter().cloned());
        for repository in &job.package_repositories {
            lines.extend(repository.sources_list_lines(&job.series, &options.secrets)?);
        }
        push_sources_list(environment, &lines)
    }

    fn install_snaps(
        &self,
        environment: &dyn Environment,
        snaps: &[serde_yaml::Value],
    ) -> Result<(), RunError> {
        for snap in normalize_snaps(snaps)? {
            let revision = self.snap_revisions.revision(environment, &snap.name)?;
            debug!(
                snap = %snap.name,
                revision = revision.as_deref().unwrap_or("none"),
                "Queried snap revision"
            );
            let argv = snap.install_command();
            run_setup(environment, &argv, &ExecOptions::in_dir("/"))?;
            info!(
                snap = %snap.name,
                channel = %snap.channel,
                classic = snap.classic,
                "Installed snap"
            );
        }
        Ok(())
    }
}

fn push_sources_list(environment: &dyn Environment, lines: &[String]) -> Result<(), RunError> {
    let mut content = lines.join("\n");
    content.push('\n');
    environment.push_content(
        content.as_bytes(),
        Path::new(SOURCES_LIST),
        &FileMode::root_readable(),
    )?;
    info!(lines = lines.len(), "Wrote sources list");
    Ok(())
}

fn install_packages(
    environment: &dyn Environment,
    managed_project: &Path,
    packages: &[String],
) -> Result<(), RunError> {
    if packages.is_empty() {
        return Ok(());
    }
    let options = ExecOptions::in_dir(managed_project);
    run_setup(environment, &["apt".to_string(), "update".to_string()], &options)?;
    let mut install = vec!["apt".to_string(), "install".to_string(), "-y".to_string()];
    install.extend(packages.iter().cloned());
    run_setup(environment, &install, &options)?;
    info!(packages = %packages.join(" "), "Installed packages");
    Ok(())
}

/// Runs a setup command; a non-zero status fails the instance with that status
fn run_setup(
    environment: &dyn Environment,
    argv: &[String],
    options: &ExecOptions,
) -> Result<(), RunError> {
    let output = environment.execute(argv, options)?;
    if output.success() {
        Ok(())
    } else {
        Err(RunError::SetupFailed {
            action: argv.join(" "),
            code: output.exit_code,
        })
    }
}
