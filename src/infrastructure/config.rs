//! Configuration management
//!
//! Runner defaults, read from an optional YAML file. Command-line flags take
//! precedence over anything set here.

use crate::infrastructure::container::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the project directory is mounted inside every environment
pub const DEFAULT_MANAGED_PROJECT_PATH: &str = "/build/project";

/// Image used for a series unless configured otherwise
pub const DEFAULT_IMAGE_TEMPLATE: &str = "ubuntu:{series}";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Container runtime driving the environments
    pub runtime: ContainerRuntime,
    /// Image for a series; `{series}` is replaced
    pub image_template: String,
    /// Mount point of the project inside environments
    pub managed_project_path: PathBuf,
    /// Log level
    pub log_level: String,
    /// Default output directory for artifacts
    pub output_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: ContainerRuntime::default(),
            image_template: DEFAULT_IMAGE_TEMPLATE.to_string(),
            managed_project_path: PathBuf::from(DEFAULT_MANAGED_PROJECT_PATH),
            log_level: "info".to_string(),
            output_directory: None,
        }
    }
}

impl Config {
    /// Parses a configuration document
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Loads `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
            .map_err(|e| anyhow::anyhow!("Invalid configuration in '{}': {e}", path.display()))
    }
}
