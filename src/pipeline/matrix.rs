//! Matrix expansion
//!
//! A job definition becomes one [`Job`] per matrix entry (or a single job
//! without a matrix), and each job fans out into one [`JobInstance`] per
//! architecture.

use crate::pipeline::errors::ConfigError;
use crate::pipeline::plugins::Plugin;
use crate::pipeline::repositories::PackageRepository;
use crate::pipeline::types::{InputSpec, JobDefinition, JobFields, OutputSpec, PipelineConfig};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A concrete job: one matrix entry merged over its definition
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Name of the job definition
    pub name: String,
    /// Position of the matrix entry, 0 without a matrix
    pub index: usize,
    /// Target series
    pub series: String,
    /// Target architectures, at least one
    pub architectures: Vec<String>,
    /// Script run before `run`
    pub run_before: Option<String>,
    /// Main script
    pub run: Option<String>,
    /// Script run after `run`
    pub run_after: Option<String>,
    /// Job-level environment
    pub environment: BTreeMap<String, String>,
    /// System packages
    pub packages: Vec<String>,
    /// Raw snap entries
    pub snaps: Vec<serde_yaml::Value>,
    /// Extra apt repositories
    pub package_repositories: Vec<PackageRepository>,
    /// Output collection
    pub output: Option<OutputSpec>,
    /// Input import
    pub input: Option<InputSpec>,
    /// Run as root
    pub root: bool,
    /// Built-in plugin
    pub plugin: Option<Plugin>,
}

impl Job {
    /// Builds a job from merged fields
    pub fn from_fields(name: &str, index: usize, fields: JobFields) -> Result<Self, ConfigError> {
        let missing = |field| ConfigError::MissingField {
            job: name.to_string(),
            field,
        };
        let series = fields.series.clone().ok_or_else(|| missing("series"))?;
        let architectures = fields
            .architectures
            .clone()
            .filter(|archs| !archs.is_empty())
            .ok_or_else(|| missing("architectures"))?;

        if let Some(expires) = fields.output.as_ref().and_then(|o| o.expires)
            && expires < 0
        {
            return Err(ConfigError::Invalid(format!(
                "Job '{name}' sets a negative output 'expires'."
            )));
        }
        let package_repositories = fields.package_repositories.clone().unwrap_or_default();
        for repository in &package_repositories {
            repository.validate()?;
        }
        let plugin = Plugin::from_fields(name, &fields)?;

        Ok(Self {
            name: name.to_string(),
            index,
            series,
            architectures,
            run_before: fields.run_before,
            run: fields.run,
            run_after: fields.run_after,
            environment: fields.environment.unwrap_or_default(),
            packages: fields.packages.unwrap_or_default(),
            snaps: fields.snaps.unwrap_or_default(),
            package_repositories,
            output: fields.output,
            input: fields.input,
            root: fields.root.unwrap_or(true),
            plugin,
        })
    }
}

/// One instance per architecture of `job`, in declaration order
#[must_use]
pub fn instances(job: &Arc<Job>) -> Vec<JobInstance> {
    job.architectures
        .iter()
        .map(|architecture| JobInstance {
            job: Arc::clone(job),
            architecture: architecture.clone(),
        })
        .collect()
}

impl JobDefinition {
    /// Expands the matrix into ordered jobs
    pub fn expand(&self, name: &str) -> Result<Vec<Job>, ConfigError> {
        match &self.matrix {
            Some(entries) if !entries.is_empty() => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| Job::from_fields(name, index, entry.overlaid_on(&self.fields)))
                .collect(),
            _ => Ok(vec![Job::from_fields(name, 0, self.fields.clone())?]),
        }
    }
}

/// The unit of execution: one job on one architecture
#[derive(Debug, Clone, PartialEq)]
pub struct JobInstance {
    /// The job this instance belongs to
    pub job: Arc<Job>,
    /// The single architecture of this instance
    pub architecture: String,
}

impl JobInstance {
    /// Name of the job
    #[must_use]
    pub fn name(&self) -> &str {
        &self.job.name
    }

    /// Matrix index of the job
    #[must_use]
    pub fn index(&self) -> usize {
        self.job.index
    }

    /// Target series
    #[must_use]
    pub fn series(&self) -> &str {
        &self.job.series
    }
}

impl fmt::Display for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' for {}/{}",
            self.job.name, self.job.series, self.architecture
        )
    }
}

/// Jobs of every definition the pipeline references, keyed by name
pub type ExpandedJobs = BTreeMap<String, Vec<Arc<Job>>>;

/// Expands every job referenced by the pipeline
///
/// Fails on the first unknown job reference or invalid definition.
pub fn expand_pipeline(config: &PipelineConfig) -> Result<ExpandedJobs, ConfigError> {
    let mut expanded = ExpandedJobs::new();
    for name in config.referenced_jobs() {
        let definition = config
            .jobs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))?;
        let jobs = definition
            .expand(name)?
            .into_iter()
            .map(Arc::new)
            .collect();
        expanded.insert(name.to_string(), jobs);
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn config(yaml: &str) -> PipelineConfig {
        PipelineConfig::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_job_without_matrix() {
        let config = config(
            "pipeline: [test]\njobs:\n  test:\n    series: focal\n    architectures: [amd64, arm64]\n    run: tox\n",
        );
        let expanded = expand_pipeline(&config).unwrap();
        let jobs = &expanded["test"];
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].index, 0);
        assert!(jobs[0].root);

        let instances = instances(&jobs[0]);
        let labels: Vec<String> = instances.iter().map(ToString::to_string).collect();
        assert_eq!(
            labels,
            vec!["'test' for focal/amd64", "'test' for focal/arm64"]
        );
    }

    #[test]
    fn test_matrix_entries_override_base() {
        let config = config(
            r#"
pipeline: [test]
jobs:
  test:
    architectures: amd64
    run: tox
    matrix:
      - series: bionic
      - series: focal
        run: tox -e py38
        architectures: [amd64, s390x]
"#,
        );
        let expanded = expand_pipeline(&config).unwrap();
        let jobs = &expanded["test"];
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].series, "bionic");
        assert_eq!(jobs[0].run.as_deref(), Some("tox"));
        assert_eq!(jobs[1].index, 1);
        assert_eq!(jobs[1].run.as_deref(), Some("tox -e py38"));
        assert_eq!(jobs[1].architectures, vec!["amd64", "s390x"]);
    }

    #[test]
    fn test_unknown_job_reference() {
        let config = config("pipeline: [test, missing]\njobs:\n  test:\n    series: focal\n    architectures: amd64\n");
        assert_eq!(
            expand_pipeline(&config).unwrap_err(),
            ConfigError::UnknownJob("missing".to_string())
        );
    }

    #[test]
    fn test_missing_series() {
        let config = config("pipeline: [test]\njobs:\n  test:\n    architectures: amd64\n");
        assert_eq!(
            expand_pipeline(&config).unwrap_err().to_string(),
            "Job 'test' does not set 'series'"
        );
    }

    #[test]
    fn test_unknown_plugin_rejected_at_expansion() {
        let config = config(
            "pipeline: [test]\njobs:\n  test:\n    series: focal\n    architectures: amd64\n    plugin: nope\n",
        );
        assert_eq!(
            expand_pipeline(&config).unwrap_err(),
            ConfigError::UnknownPlugin {
                job: "test".to_string(),
                plugin: "nope".to_string(),
            }
        );
    }

    #[test]
    fn test_negative_expiry_rejected() {
        let config = config(
            "pipeline: [test]\njobs:\n  test:\n    series: focal\n    architectures: amd64\n    output:\n      expires: -1\n",
        );
        assert!(expand_pipeline(&config).is_err());
    }

    proptest! {
        #[test]
        fn prop_one_instance_per_declared_combination(
            entries in proptest::collection::vec(
                (prop::sample::select(vec!["bionic", "focal", "jammy"]),
                 proptest::collection::vec(prop::sample::select(vec!["amd64", "arm64", "s390x"]), 1..4)),
                1..5,
            )
        ) {
            let matrix = entries
                .iter()
                .map(|(series, archs)| JobFields {
                    series: Some((*series).to_string()),
                    architectures: Some(archs.iter().map(|a| (*a).to_string()).collect()),
                    ..Default::default()
                })
                .collect();
            let definition = JobDefinition {
                fields: JobFields { run: Some("true".to_string()), ..Default::default() },
                matrix: Some(matrix),
            };

            let flattened: Vec<(usize, String, String)> = definition
                .expand("job")
                .unwrap()
                .into_iter()
                .map(Arc::new)
                .flat_map(|job| instances(&job))
                .map(|i| (i.index(), i.series().to_string(), i.architecture.clone()))
                .collect();

            let declared: Vec<(usize, String, String)> = entries
                .iter()
                .enumerate()
                .flat_map(|(index, (series, archs))| {
                    archs.iter().map(move |a| (index, (*series).to_string(), (*a).to_string()))
                })
                .collect();

            prop_assert_eq!(flattened, declared);
        }
    }
}
