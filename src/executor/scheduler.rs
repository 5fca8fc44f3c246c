//! Stage-by-stage pipeline execution
//!
//! Every instance of a stage is attempted before the stage is judged. The
//! first stage with a failure ends the pipeline, and the environments this
//! run created are always cleaned up afterwards.

use crate::executor::context::{CleanPolicy, ExecutionMode, RunContext};
use crate::executor::job::{JobExecutor, JobOutcome};
use crate::executor::lifecycle::EnvironmentLifecycle;
use crate::executor::traits::{EnvironmentProvider, SigningKeySource, SnapRevisionQuery};
use crate::pipeline::{
    ConfigError, Job, JobInstance, PipelineConfig, RunError, expand_pipeline, instances,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The result of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Process exit code
    pub exit_code: i32,
    /// Every error, in the order it occurred
    pub errors: Vec<RunError>,
}

impl RunReport {
    /// Returns true if nothing failed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.errors.is_empty()
    }
}

/// Drives pipelines through a backend
pub struct PipelineScheduler<'a> {
    provider: &'a dyn EnvironmentProvider,
    signing_keys: &'a dyn SigningKeySource,
    snap_revisions: &'a dyn SnapRevisionQuery,
}

impl<'a> PipelineScheduler<'a> {
    /// Creates a scheduler over `provider`
    #[must_use]
    pub fn new(
        provider: &'a dyn EnvironmentProvider,
        signing_keys: &'a dyn SigningKeySource,
        snap_revisions: &'a dyn SnapRevisionQuery,
    ) -> Self {
        Self {
            provider,
            signing_keys,
            snap_revisions,
        }
    }

    /// Runs every stage of the pipeline in order
    pub fn run(&self, config: &PipelineConfig, context: &RunContext) -> RunReport {
        let expanded = match expand_pipeline(config) {
            Ok(expanded) => expanded,
            Err(err) => return fail_early(context, err.into()),
        };
        let lifecycle = EnvironmentLifecycle::new(self.provider);
        if let Err(err) = lifecycle.ensure_ready() {
            return fail_early(context, err.into());
        }
        let executor = JobExecutor::new(&lifecycle, self.signing_keys, self.snap_revisions)
            .with_license(config.license.as_ref());

        let mut first_code = None;
        for (stage_index, stage) in config.pipeline.iter().enumerate() {
            let stage_instances: Vec<JobInstance> = stage
                .jobs
                .iter()
                .filter_map(|name| expanded.get(name))
                .flatten()
                .flat_map(instances)
                .filter(|instance| matches_architecture(instance, context))
                .collect();
            info!(
                stage = stage_index,
                jobs = ?stage.jobs,
                instances = stage_instances.len(),
                "Running stage"
            );

            let failed = run_stage(&executor, &lifecycle, &stage_instances, context, &mut first_code);
            if !failed.is_empty() {
                error!(stage = stage_index, failed = ?failed, "Stage failed, stopping pipeline");
                if stage.grouped {
                    context.record_error(RunError::StageAggregate { jobs: failed });
                }
                break;
            }
        }

        cleanup(&lifecycle, context);
        report(context, first_code)
    }

    /// Runs the instances of one matrix entry of one job
    pub fn run_one(
        &self,
        config: &PipelineConfig,
        job_name: &str,
        index: usize,
        context: &RunContext,
    ) -> RunReport {
        let job = match select_job(config, job_name, index) {
            Ok(job) => job,
            Err(err) => return fail_early(context, err.into()),
        };
        let lifecycle = EnvironmentLifecycle::new(self.provider);
        if let Err(err) = lifecycle.ensure_ready() {
            return fail_early(context, err.into());
        }
        let executor = JobExecutor::new(&lifecycle, self.signing_keys, self.snap_revisions)
            .with_license(config.license.as_ref());

        let selected: Vec<JobInstance> = instances(&job)
            .into_iter()
            .filter(|instance| matches_architecture(instance, context))
            .collect();
        let mut first_code = None;
        run_stage(&executor, &lifecycle, &selected, context, &mut first_code);

        cleanup(&lifecycle, context);
        report(context, first_code)
    }
}

fn matches_architecture(instance: &JobInstance, context: &RunContext) -> bool {
    let matches = instance.architecture == context.architecture;
    if !matches {
        debug!(
            job = %instance.name(),
            architecture = %instance.architecture,
            "Skipping instance for another architecture"
        );
    }
    matches
}

/// Runs a batch of instances behind a barrier; returns the names of failed jobs
fn run_stage(
    executor: &JobExecutor<'_>,
    lifecycle: &EnvironmentLifecycle<'_>,
    stage_instances: &[JobInstance],
    context: &RunContext,
    first_code: &mut Option<i32>,
) -> Vec<String> {
    let per_job = context.options.clean == CleanPolicy::PerJob;
    let mut cleanup_errors = Vec::new();
    let outcomes: Vec<JobOutcome> = match context.options.mode {
        ExecutionMode::Sequential => stage_instances
            .iter()
            .map(|instance| {
                let outcome = executor.execute(instance, context);
                if per_job {
                    if let Err(err) = lifecycle.cleanup_created(context) {
                        cleanup_errors.push(err);
                    }
                }
                outcome
            })
            .collect(),
        ExecutionMode::Parallel => {
            let outcomes = run_parallel(executor, stage_instances, context);
            if per_job {
                if let Err(err) = lifecycle.cleanup_created(context) {
                    cleanup_errors.push(err);
                }
            }
            outcomes
        }
    };

    let mut failed: Vec<String> = Vec::new();
    for (instance, outcome) in stage_instances.iter().zip(outcomes) {
        match outcome {
            Ok(record) => info!(
                job = %instance.name(),
                series = %instance.series(),
                architecture = %instance.architecture,
                recorded = record.is_some(),
                "Job succeeded"
            ),
            Err(err) => {
                warn!(job = %instance.name(), error = %err, "Job failed");
                first_code.get_or_insert(err.exit_code().unwrap_or(1));
                if !failed.iter().any(|name| name == instance.name()) {
                    failed.push(instance.name().to_string());
                }
                context.record_error(err);
            }
        }
    }
    for err in cleanup_errors {
        context.record_error(err);
    }
    failed
}

fn run_parallel(
    executor: &JobExecutor<'_>,
    stage_instances: &[JobInstance],
    context: &RunContext,
) -> Vec<JobOutcome> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = stage_instances
            .iter()
            .map(|instance| scope.spawn(move || executor.execute(instance, context)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(RunError::Io("job thread panicked".to_string())))
            })
            .collect()
    })
}

fn select_job(
    config: &PipelineConfig,
    job_name: &str,
    index: usize,
) -> Result<Arc<Job>, ConfigError> {
    let definition = config
        .jobs
        .get(job_name)
        .ok_or_else(|| ConfigError::UnknownJob(job_name.to_string()))?;
    definition
        .expand(job_name)?
        .into_iter()
        .nth(index)
        .map(Arc::new)
        .ok_or_else(|| ConfigError::UnknownJobIndex {
            job: job_name.to_string(),
            index,
        })
}

fn cleanup(lifecycle: &EnvironmentLifecycle<'_>, context: &RunContext) {
    if let Err(err) = lifecycle.cleanup_created(context) {
        context.record_error(err);
    }
}

fn fail_early(context: &RunContext, err: RunError) -> RunReport {
    error!(error = %err, "Pipeline cannot start");
    context.record_error(err);
    report(context, None)
}

fn report(context: &RunContext, first_code: Option<i32>) -> RunReport {
    let errors = context.errors();
    let exit_code = first_code.unwrap_or(i32::from(!errors.is_empty()));
    RunReport { exit_code, errors }
}
