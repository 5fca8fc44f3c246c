//! Pipeline configuration and job expansion

pub mod errors;
pub mod matrix;
pub mod plugins;
pub mod repositories;
pub mod snaps;
pub mod types;

pub use errors::{ArtifactError, ConfigError, EnvironmentError, RunError};
pub use matrix::{ExpandedJobs, Job, JobInstance, expand_pipeline, instances};
pub use plugins::{Contributions, Contributor, Plugin, PluginSettings, merge_contributions};
pub use repositories::{PackageRepository, PpaReference};
pub use snaps::SnapSpec;
pub use types::{
    DEFAULT_CONFIG_FILE, InputSpec, JobDefinition, JobFields, License, OutputSpec, PipelineConfig,
    Stage,
};
