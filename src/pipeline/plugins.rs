//! Built-in plugins and command contributions
//!
//! A job's packages, snaps, environment and commands come from an ordered list
//! of [`Contributor`]s: the job's plugin (if any) followed by the job's own
//! configuration. Configuration values win on conflict, except for plugins
//! that interpolate the configured commands into their own.

use crate::pipeline::errors::ConfigError;
use crate::pipeline::matrix::Job;
use crate::pipeline::types::JobFields;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Extra plugin settings supplied on the command line
pub type PluginSettings = BTreeMap<String, String>;

/// Name of the conda environment created by the conda plugins
pub const CONDA_ENV_NAME: &str = "stagecraft";

const DEFAULT_CONDA_PYTHON: &str = "3.8";
const DEFAULT_RECIPE_FOLDER: &str = "./info";

/// Settings shared by the conda plugins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondaSettings {
    /// Extra conda packages
    pub packages: Vec<String>,
    /// Python version, 3.8 when unset
    pub python: Option<String>,
    /// Conda channels
    pub channels: Vec<String>,
}

impl CondaSettings {
    fn from_fields(fields: &JobFields) -> Self {
        Self {
            packages: fields.conda_packages.clone().unwrap_or_default(),
            python: fields.conda_python.clone(),
            channels: fields.conda_channels.clone().unwrap_or_default(),
        }
    }
}

/// The closed set of built-in plugins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plugin {
    /// Installs tox and runs it
    Tox,
    /// Builds a Python package with `build`
    PyProjectBuild,
    /// Installs a Go toolchain and puts it on `PATH`
    Golang {
        /// The `golang-version` setting
        version: String,
    },
    /// Installs miniconda and runs the job inside a fresh conda environment
    Miniconda(CondaSettings),
    /// Runs `conda-build` on a recipe inside a miniconda environment
    CondaBuild {
        /// Conda settings
        conda: CondaSettings,
        /// Explicit recipe directory; searched for when unset
        build_target: Option<String>,
        /// Where to search for a recipe
        recipe_folder: Option<String>,
    },
}

impl Plugin {
    /// Resolves the `plugin` field of a job, rejecting unknown names
    pub fn from_fields(job: &str, fields: &JobFields) -> Result<Option<Self>, ConfigError> {
        let Some(name) = fields.plugin.as_deref() else {
            return Ok(None);
        };
        let plugin = match name {
            "tox" => Plugin::Tox,
            "pyproject-build" => Plugin::PyProjectBuild,
            "golang" => Plugin::Golang {
                version: fields.golang_version.clone().ok_or_else(|| {
                    ConfigError::MissingField {
                        job: job.to_string(),
                        field: "golang-version",
                    }
                })?,
            },
            "miniconda" => Plugin::Miniconda(CondaSettings::from_fields(fields)),
            "conda-build" => Plugin::CondaBuild {
                conda: CondaSettings::from_fields(fields),
                build_target: fields.build_target.clone(),
                recipe_folder: fields.recipe_folder.clone(),
            },
            other => {
                return Err(ConfigError::UnknownPlugin {
                    job: job.to_string(),
                    plugin: other.to_string(),
                });
            }
        };
        Ok(Some(plugin))
    }

    /// Configuration name of the plugin
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Plugin::Tox => "tox",
            Plugin::PyProjectBuild => "pyproject-build",
            Plugin::Golang { .. } => "golang",
            Plugin::Miniconda(_) => "miniconda",
            Plugin::CondaBuild { .. } => "conda-build",
        }
    }

    /// Whether the plugin embeds the configured commands in its own
    #[must_use]
    pub fn interpolates_run_command(&self) -> bool {
        matches!(
            self,
            Plugin::Golang { .. } | Plugin::Miniconda(_) | Plugin::CondaBuild { .. }
        )
    }
}

/// A source of job setup and commands
pub trait Contributor {
    /// System packages to install
    fn packages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Snaps to install, by name
    fn snaps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment entries; `None` unsets a variable set by an earlier contributor
    fn environment(&self) -> BTreeMap<String, Option<String>> {
        BTreeMap::new()
    }

    /// Script run before the main command
    fn before_command(&self) -> Option<String> {
        None
    }

    /// Main command
    fn run_command(&self) -> Result<Option<String>, ConfigError> {
        Ok(None)
    }

    /// Script run after the main command
    fn after_command(&self) -> Option<String> {
        None
    }
}

/// The job's own configuration as a contributor
struct ConfiguredJob<'a> {
    job: &'a Job,
}

impl Contributor for ConfiguredJob<'_> {
    fn packages(&self) -> Vec<String> {
        self.job.packages.clone()
    }

    fn environment(&self) -> BTreeMap<String, Option<String>> {
        self.job
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect()
    }

    fn before_command(&self) -> Option<String> {
        self.job.run_before.clone()
    }

    fn run_command(&self) -> Result<Option<String>, ConfigError> {
        Ok(self.job.run.clone())
    }

    fn after_command(&self) -> Option<String> {
        self.job.run_after.clone()
    }
}

/// A built-in plugin bound to the job it serves
struct PluginContributor<'a> {
    plugin: &'a Plugin,
    job: &'a Job,
    settings: &'a PluginSettings,
    project: &'a Path,
}

impl PluginContributor<'_> {
    fn conda(&self) -> Option<&CondaSettings> {
        match self.plugin {
            Plugin::Miniconda(conda) | Plugin::CondaBuild { conda, .. } => Some(conda),
            _ => None,
        }
    }

    fn conda_packages(&self, conda: &CondaSettings) -> Vec<String> {
        let default = match self.plugin {
            Plugin::CondaBuild { .. } => "conda-build",
            _ => "pip",
        };
        let python = conda.python.as_deref().unwrap_or(DEFAULT_CONDA_PYTHON);
        let mut packages: Vec<String> = conda.packages.clone();
        packages.push(format!("PYTHON={python}"));
        packages.push(default.to_string());
        packages.sort();
        packages.dedup();
        packages
    }

    fn conda_channels(&self, conda: &CondaSettings) -> Vec<String> {
        let mut channels = conda.channels.clone();
        if !channels.iter().any(|c| c == "defaults") {
            channels.push("defaults".to_string());
        }
        if let Some(extra) = self.settings.get("miniconda_conda_channel") {
            channels.push(extra.clone());
        }
        channels
    }

    fn channel_flags(&self, conda: &CondaSettings) -> String {
        self.conda_channels(conda)
            .iter()
            .map(|c| format!("-c {c}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn recipe_root(&self, recipe_folder: Option<&str>) -> PathBuf {
        let folder = recipe_folder.unwrap_or(DEFAULT_RECIPE_FOLDER);
        self.project.join(folder.trim_start_matches("./"))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.project)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

impl Contributor for PluginContributor<'_> {
    fn packages(&self) -> Vec<String> {
        let names: &[&str] = match self.plugin {
            Plugin::Tox => &["python3-pip"],
            Plugin::PyProjectBuild => &["python3-pip", "python3-venv"],
            Plugin::Golang { version } => return vec![format!("golang-{version}")],
            Plugin::Miniconda(_) => &["git", "python3-dev", "python3-pip", "python3-venv", "wget"],
            Plugin::CondaBuild { .. } => &[
                "git",
                "python3-dev",
                "python3-pip",
                "python3-venv",
                "wget",
                "automake",
                "build-essential",
                "cmake",
                "gcc",
                "g++",
                "libc++-dev",
                "libc6-dev",
                "libffi-dev",
                "libjpeg-dev",
                "libpng-dev",
                "libreadline-dev",
                "libsqlite3-dev",
                "libtool",
                "zlib1g-dev",
            ],
        };
        names.iter().map(ToString::to_string).collect()
    }

    fn environment(&self) -> BTreeMap<String, Option<String>> {
        match self.plugin {
            // tox drops lower-case proxy variables unless told to pass them
            Plugin::Tox => BTreeMap::from([(
                "TOX_TESTENV_PASSENV".to_string(),
                Some("http_proxy https_proxy".to_string()),
            )]),
            Plugin::Miniconda(_) | Plugin::CondaBuild { .. } => BTreeMap::from([(
                "CONDA_ENV".to_string(),
                Some(CONDA_ENV_NAME.to_string()),
            )]),
            _ => BTreeMap::new(),
        }
    }

    fn before_command(&self) -> Option<String> {
        let conda = self.conda()?;
        let create = format!(
            "conda create -n $CONDA_ENV -q -y {} {}",
            self.channel_flags(conda),
            self.conda_packages(conda).join(" ")
        );
        let run = self.job.run_before.as_deref().unwrap_or_default();
        Some(
            [
                "if [ ! -d \"$HOME/miniconda3\" ]; then",
                "    wget -O /tmp/miniconda.sh https://repo.continuum.io/miniconda/Miniconda3-latest-Linux-x86_64.sh",
                "    chmod +x /tmp/miniconda.sh",
                "    /tmp/miniconda.sh -b",
                "fi",
                "export PATH=$HOME/miniconda3/bin:$PATH",
                "conda remove --all -q -y -n $CONDA_ENV",
                create.as_str(),
                "source activate $CONDA_ENV",
                run,
            ]
            .join("\n"),
        )
    }

    fn run_command(&self) -> Result<Option<String>, ConfigError> {
        let run = self.job.run.as_deref().unwrap_or_default();
        let command = match self.plugin {
            Plugin::Tox => "python3 -m pip install tox==3.24.5; tox".to_string(),
            Plugin::PyProjectBuild => {
                "python3 -m pip install build==0.7.0; python3 -m build".to_string()
            }
            Plugin::Golang { version } => {
                format!("export PATH=/usr/lib/go-{version}/bin/:$PATH\n{run}")
            }
            Plugin::Miniconda(_) => {
                format!("export PATH=$HOME/miniconda3/bin:$PATH\nsource activate $CONDA_ENV\n{run}")
            }
            Plugin::CondaBuild {
                conda,
                build_target,
                recipe_folder,
            } => {
                let root = self.recipe_root(recipe_folder.as_deref());
                let recipe = find_recipe(&root);
                let target = match build_target {
                    Some(target) => target.clone(),
                    None => {
                        let recipe = recipe.as_deref().ok_or_else(|| {
                            ConfigError::Invalid("No build target found".to_string())
                        })?;
                        self.relative(&find_parent_recipe(recipe).unwrap_or_else(|| recipe.to_path_buf()))
                    }
                };
                let configs: String = recipe
                    .as_deref()
                    .map(build_configs)
                    .unwrap_or_default()
                    .iter()
                    .map(|c| format!(" -m {}", self.relative(c)))
                    .collect();
                format!(
                    "export PATH=$HOME/miniconda3/bin:$PATH\nsource activate $CONDA_ENV\n\
                     conda-build --no-anaconda-upload --output-folder dist {}{configs} {target}\n{run}",
                    self.channel_flags(conda)
                )
            }
        };
        Ok(Some(command))
    }

    fn after_command(&self) -> Option<String> {
        self.conda()?;
        let run = self
            .job
            .run_after
            .as_deref()
            .map(|r| format!("; {r}"))
            .unwrap_or_default();
        Some(format!(
            "export PATH=$HOME/miniconda3/bin:$PATH; source activate $CONDA_ENV; conda env export{run}"
        ))
    }
}

fn has_recipe(dir: &Path) -> bool {
    dir.join("meta.yaml").is_file()
}

fn sorted_subdirectories(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

/// Depth-first search for a `recipe` directory holding a `meta.yaml`
fn find_recipe(root: &Path) -> Option<PathBuf> {
    for dir in sorted_subdirectories(root) {
        if dir.file_name().is_some_and(|n| n == "recipe") && has_recipe(&dir) {
            return Some(dir);
        }
        if let Some(found) = find_recipe(&dir) {
            return Some(found);
        }
    }
    None
}

/// Some packages are only buildable through the recipe of their parent
fn find_parent_recipe(recipe: &Path) -> Option<PathBuf> {
    sorted_subdirectories(recipe)
        .into_iter()
        .find(|dir| dir.file_name().is_some_and(|n| n == "parent") && has_recipe(dir))
}

fn build_configs(recipe: &Path) -> Vec<PathBuf> {
    let pattern = recipe.join("**").join("conda_build_config.yaml");
    let mut configs: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map(|paths| paths.filter_map(Result::ok).collect())
        .unwrap_or_default();
    configs.sort();
    configs.reverse();
    configs
}

/// The merged setup and commands of one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contributions {
    /// System packages, deduplicated in contribution order
    pub packages: Vec<String>,
    /// Raw snap entries
    pub snaps: Vec<serde_yaml::Value>,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Script run before `run`
    pub run_before: Option<String>,
    /// Main script
    pub run: Option<String>,
    /// Script run after `run`
    pub run_after: Option<String>,
}

impl Contributions {
    /// Whether there is anything to execute
    #[must_use]
    pub fn has_commands(&self) -> bool {
        self.run.is_some() || self.run_before.is_some() || self.run_after.is_some()
    }
}

/// Merges the job's plugin contributions with its configuration
pub fn merge_contributions(
    job: &Job,
    settings: &PluginSettings,
    project: &Path,
) -> Result<Contributions, ConfigError> {
    let configured = ConfiguredJob { job };
    let plugin = job.plugin.as_ref().map(|plugin| PluginContributor {
        plugin,
        job,
        settings,
        project,
    });
    let interpolates = job
        .plugin
        .as_ref()
        .is_some_and(Plugin::interpolates_run_command);

    // Later contributors override earlier ones.
    let mut contributors: Vec<&dyn Contributor> = Vec::new();
    if let Some(plugin) = &plugin {
        contributors.push(plugin);
    }
    contributors.push(&configured);

    let mut merged = Contributions::default();
    for contributor in &contributors {
        for package in contributor.packages() {
            if !merged.packages.contains(&package) {
                merged.packages.push(package);
            }
        }
        merged
            .snaps
            .extend(contributor.snaps().into_iter().map(serde_yaml::Value::String));
        for (key, value) in contributor.environment() {
            match value {
                Some(value) => {
                    merged.environment.insert(key, value);
                }
                None => {
                    merged.environment.remove(&key);
                }
            }
        }
    }
    merged.snaps.extend(job.snaps.iter().cloned());

    let (first, second): (&dyn Contributor, Option<&dyn Contributor>) = match &plugin {
        Some(plugin) if interpolates => (plugin as &dyn Contributor, Some(&configured as &dyn Contributor)),
        Some(plugin) => (&configured as &dyn Contributor, Some(plugin as &dyn Contributor)),
        None => (&configured as &dyn Contributor, None),
    };
    merged.run_before = first
        .before_command()
        .or_else(|| second.and_then(|c| c.before_command()));
    merged.run = match first.run_command()? {
        Some(run) => Some(run),
        None => match second {
            Some(c) => c.run_command()?,
            None => None,
        },
    };
    merged.run_after = first
        .after_command()
        .or_else(|| second.and_then(|c| c.after_command()));
    Ok(merged)
}
