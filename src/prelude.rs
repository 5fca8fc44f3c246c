//! Prelude module for common imports

// Configuration and expansion
pub use crate::pipeline::{
    ConfigError, Job, JobDefinition, JobFields, JobInstance, PackageRepository, PipelineConfig,
    RunError, SnapSpec, Stage, expand_pipeline,
};

// Execution
pub use crate::executor::{
    CleanPolicy, Environment, EnvironmentLifecycle, EnvironmentProvider, ExecOptions,
    ExecutionMode, HealthStatus, JobExecutor, PipelineScheduler, RunContext, RunOptions,
    RunReport, SigningKeySource, SnapRevisionQuery,
};

// Artifacts
pub use crate::artifacts::{ArtifactRecord, ArtifactStore, resolve_within};

// Backends
pub use crate::infrastructure::{
    Config, ContainerProvider, ContainerRuntime, LaunchpadKeySource, SnapdRevisionQuery,
};

// Release
pub use crate::release::{BuildArchive, ReleaseRequest, ReleaseSelector};
