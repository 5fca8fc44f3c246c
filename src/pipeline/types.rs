//! Pipeline configuration model
//!
//! These types mirror the YAML pipeline file. They are deserialized once and
//! then treated as read-only by the engine; matrix expansion in
//! [`crate::pipeline::matrix`] turns them into concrete jobs.

use crate::pipeline::errors::ConfigError;
use crate::pipeline::repositories::PackageRepository;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default name of the pipeline file inside a project
pub const DEFAULT_CONFIG_FILE: &str = ".stagecraft.yaml";

/// A parsed pipeline file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineConfig {
    /// Ordered stages
    pub pipeline: Vec<Stage>,
    /// Job definitions by name
    pub jobs: BTreeMap<String, JobDefinition>,
    /// License metadata attached to every job's properties
    #[serde(default)]
    pub license: Option<License>,
}

impl PipelineConfig {
    /// Parses a pipeline from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(license) = &config.license {
            license.validate()?;
        }
        Ok(config)
    }

    /// Reads and parses a pipeline file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ConfigError::MissingFile(
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            ),
            _ => ConfigError::Unreadable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
        })?;
        Self::from_yaml_str(&text)
    }

    /// Every job name referenced by the pipeline, in order of first appearance
    #[must_use]
    pub fn referenced_jobs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for stage in &self.pipeline {
            for name in &stage.jobs {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// One pipeline stage
///
/// In YAML a stage is either a single job name or a list of job names. Only
/// the list form is a group whose failure is summarized after the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Job names in dispatch order
    pub jobs: Vec<String>,
    /// Whether the stage was written as a list
    pub grouped: bool,
}

impl Stage {
    /// A stage holding a single job
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            jobs: vec![name.into()],
            grouped: false,
        }
    }

    /// A stage holding a list of jobs
    #[must_use]
    pub fn group<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jobs: names.into_iter().map(Into::into).collect(),
            grouped: true,
        }
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(name) => Ok(Stage::single(name)),
            OneOrMany::Many(names) => Ok(Stage::group(names)),
        }
    }
}

/// A named job template, optionally with a matrix of overrides
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobDefinition {
    /// Base fields shared by every matrix entry
    #[serde(flatten)]
    pub fields: JobFields,
    /// Per-entry overrides; each entry becomes one job
    #[serde(default)]
    pub matrix: Option<Vec<JobFields>>,
}

/// The fields a job or a matrix entry may set
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobFields {
    /// Target release, e.g. `focal`
    pub series: Option<String>,
    /// Target architectures, a string or a list in YAML
    #[serde(default, deserialize_with = "one_or_many")]
    pub architectures: Option<Vec<String>>,
    /// Script run before `run`
    pub run_before: Option<String>,
    /// Main script
    pub run: Option<String>,
    /// Script run after `run`
    pub run_after: Option<String>,
    /// Job-level environment variables; scalar values are kept as strings
    #[serde(default, deserialize_with = "optional_scalar_map")]
    pub environment: Option<BTreeMap<String, String>>,
    /// System packages to install
    pub packages: Option<Vec<String>>,
    /// Raw snap entries, normalized when the job executes
    pub snaps: Option<Vec<serde_yaml::Value>>,
    /// Extra apt repositories
    pub package_repositories: Option<Vec<PackageRepository>>,
    /// Artifacts to collect
    pub output: Option<OutputSpec>,
    /// Artifacts to import from an earlier job
    pub input: Option<InputSpec>,
    /// Run as root (the default) or as an unprivileged user
    pub root: Option<bool>,
    /// Name of a built-in plugin
    pub plugin: Option<String>,
    /// Go toolchain version for the `golang` plugin
    pub golang_version: Option<String>,
    /// Conda packages for the conda plugins
    pub conda_packages: Option<Vec<String>>,
    /// Python version for the conda plugins
    #[serde(default, deserialize_with = "optional_scalar")]
    pub conda_python: Option<String>,
    /// Conda channels for the conda plugins
    pub conda_channels: Option<Vec<String>>,
    /// Recipe directory for `conda-build`
    pub build_target: Option<String>,
    /// Where `conda-build` searches for a recipe
    pub recipe_folder: Option<String>,
}

macro_rules! overlay {
    ($entry:expr, $base:expr, $($field:ident),+ $(,)?) => {
        JobFields {
            $($field: $entry.$field.clone().or_else(|| $base.$field.clone()),)+
        }
    };
}

impl JobFields {
    /// Shallow merge: every field set on `self` wins over `base`
    #[must_use]
    pub fn overlaid_on(&self, base: &JobFields) -> JobFields {
        overlay!(
            self,
            base,
            series,
            architectures,
            run_before,
            run,
            run_after,
            environment,
            packages,
            snaps,
            package_repositories,
            output,
            input,
            root,
            plugin,
            golang_version,
            conda_packages,
            conda_python,
            conda_channels,
            build_target,
            recipe_folder,
        )
    }
}

/// Output collection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputSpec {
    /// Glob patterns relative to the project directory
    #[serde(default)]
    pub paths: Vec<String>,
    /// Static properties
    #[serde(default, deserialize_with = "scalar_map")]
    pub properties: BTreeMap<String, String>,
    /// File of `key=value` lines merged over `properties`
    #[serde(default)]
    pub dynamic_properties: Option<PathBuf>,
    /// How long the artifacts should be kept, in seconds
    #[serde(default)]
    pub expires: Option<i64>,
    /// Where the artifacts should be distributed
    #[serde(default)]
    pub distribute: Option<String>,
    /// Distribution channels
    #[serde(default)]
    pub channels: Option<Vec<String>>,
}

/// A request to import a previous job's artifacts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InputSpec {
    /// Name of the job whose output is imported
    pub job_name: String,
    /// Directory inside the project that receives the artifacts
    pub target_directory: PathBuf,
}

/// Pipeline-wide license metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct License {
    /// SPDX identifier
    #[serde(default)]
    pub spdx: Option<String>,
    /// Path of a license file within the project
    #[serde(default)]
    pub path: Option<String>,
}

impl License {
    /// Exactly one of `spdx` and `path` must be set
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.spdx, &self.path) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "You cannot set `license` `spdx` and `path` at the same time.".to_string(),
            )),
            (None, None) => Err(ConfigError::Invalid(
                "You need to set either the `license` `spdx` or `path`.".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The nested object stored in a job's properties
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "spdx": self.spdx, "path": self.path })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }),
    )
}

fn scalar_to_string<E: serde::de::Error>(value: serde_yaml::Value) -> Result<String, E> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(E::custom(format!("expected a scalar, got {other:?}"))),
    }
}

fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<serde_yaml::Value>::deserialize(deserializer)?
        .map(scalar_to_string)
        .transpose()
}

fn stringify_values<E: serde::de::Error>(
    map: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>, E> {
    map.into_iter()
        .map(|(k, v)| Ok((k, scalar_to_string(v)?)))
        .collect()
}

fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    stringify_values(BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?)
}

fn optional_scalar_map<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?
        .map(stringify_values)
        .transpose()
}
