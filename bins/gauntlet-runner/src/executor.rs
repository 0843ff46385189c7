/// Submission Orchestrator - Build Once, Run Every Collection
///
/// Glue between the container lifecycle, the result protocol and the store.
/// One call to [`SubmissionOrchestrator::run_submission`] produces one
/// MultiRun: a build container whose filesystem is committed on success,
/// then one run container per collection started from that image.
///
/// A failed build closes the MultiRun as `build_failed` and spawns no runs.
/// A failed run only affects its own Run record.

use crate::budget;
use crate::config::FixtureConfig;
use crate::docker::ContainerEngine;
use crate::engine::{ContainerLifecycle, ContainerRequest, ExecutionResult, LifecycleHooks};
use crate::error::RunnerError;
use crate::evaluator::{evaluate_build, TestEvaluator};
use crate::submission::Submission;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gauntlet_common::store::ResultStore;
use gauntlet_common::types::{
    BuildConstraints, BuildOutcome, ExecutionStatus, MultiRunId, MultiRunStatus, NewMultiRun,
    RunClosure, RunConstraints, RunId, RunStatus, TestSummary, TestcaseCollection, TestcaseId,
    Verdict,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONTAINER_TESTRUNNER: &str = "/container_testrunner";
pub const CONTAINER_SUBMISSION_TAR: &str = "/dut.tar";
pub const CONTAINER_DUT_DIR: &str = "/dut";
pub const CONTAINER_META_FILE: &str = "/meta.json";
pub const CONTAINER_TESTCASE_FILE: &str = "/testcases.json";

pub type BuildFinishedCallback = Arc<dyn Fn(MultiRunId) + Send + Sync>;
pub type RunFinishedCallback = Arc<dyn Fn(&Submission, RunId) + Send + Sync>;
pub type MultiRunFinishedCallback = Arc<dyn Fn(&Submission, MultiRunId) + Send + Sync>;

/// Observers notified after the matching store write returned
#[derive(Clone, Default)]
pub struct Callbacks {
    build_finished: Vec<BuildFinishedCallback>,
    run_finished: Vec<RunFinishedCallback>,
    multirun_finished: Vec<MultiRunFinishedCallback>,
}

impl Callbacks {
    pub fn on_build_finished(&mut self, callback: impl Fn(MultiRunId) + Send + Sync + 'static) {
        self.build_finished.push(Arc::new(callback));
    }

    pub fn on_run_finished(&mut self, callback: impl Fn(&Submission, RunId) + Send + Sync + 'static) {
        self.run_finished.push(Arc::new(callback));
    }

    pub fn on_multirun_finished(
        &mut self,
        callback: impl Fn(&Submission, MultiRunId) + Send + Sync + 'static,
    ) {
        self.multirun_finished.push(Arc::new(callback));
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub runtime: Option<Duration>,
    pub summary: Option<TestSummary>,
    /// Accepted replies, kept for reference recording
    pub replies: BTreeMap<TestcaseId, Value>,
}

#[derive(Debug, Clone)]
pub struct MultiRunReport {
    pub multirun_id: MultiRunId,
    pub status: MultiRunStatus,
    pub build_status: RunStatus,
    pub runs: Vec<RunReport>,
}

struct BuildStep {
    outcome: BuildOutcome,
    committed_image: Option<String>,
}

struct BuildHooks {
    archive: Vec<u8>,
    meta: Vec<u8>,
    testrunner: PathBuf,
    repository: String,
    tag: String,
}

#[async_trait]
impl LifecycleHooks for BuildHooks {
    async fn before_start(&self, engine: &dyn ContainerEngine, container_id: &str) -> Result<()> {
        engine
            .write_file(container_id, CONTAINER_SUBMISSION_TAR, &self.archive, 0o644)
            .await?;
        engine
            .write_file(container_id, CONTAINER_META_FILE, &self.meta, 0o644)
            .await?;
        engine
            .copy_file(container_id, &self.testrunner, CONTAINER_TESTRUNNER, 0o755)
            .await
    }

    async fn after_exit(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        status: ExecutionStatus,
    ) -> Result<Option<String>> {
        if status != ExecutionStatus::Finished {
            return Ok(None);
        }
        let image = engine
            .commit(container_id, &self.repository, &self.tag)
            .await?;
        Ok(Some(image))
    }
}

struct RunHooks {
    testcases: Vec<u8>,
}

#[async_trait]
impl LifecycleHooks for RunHooks {
    async fn before_start(&self, engine: &dyn ContainerEngine, container_id: &str) -> Result<()> {
        engine
            .write_file(container_id, CONTAINER_TESTCASE_FILE, &self.testcases, 0o644)
            .await
    }
}

/// Docker names allow `[a-zA-Z0-9_.-]`
fn container_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn infrastructure_error(error: &anyhow::Error) -> Value {
    json!({ "error": format!("{:#}", error) })
}

pub struct SubmissionOrchestrator {
    lifecycle: ContainerLifecycle,
    store: Arc<dyn ResultStore>,
    config: Arc<FixtureConfig>,
    collections: Arc<Vec<TestcaseCollection>>,
    callbacks: Callbacks,
    unbounded: bool,
}

impl SubmissionOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn ResultStore>,
        config: Arc<FixtureConfig>,
        collections: Arc<Vec<TestcaseCollection>>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            lifecycle: ContainerLifecycle::new(engine),
            store,
            config,
            collections,
            callbacks,
            unbounded: false,
        }
    }

    /// Disable all time allowances. Only for trusted reference submissions.
    pub fn without_timeouts(mut self) -> Self {
        self.unbounded = true;
        self
    }

    fn engine(&self) -> &dyn ContainerEngine {
        self.lifecycle.engine().as_ref()
    }

    fn build_allowance(&self) -> Result<Option<Duration>, RunnerError> {
        if self.unbounded {
            Ok(None)
        } else {
            self.config.max_build_time().map(Some)
        }
    }

    fn run_allowance(&self, collection: &TestcaseCollection) -> Result<Option<Duration>, RunnerError> {
        if self.unbounded {
            return Ok(None);
        }
        budget::runtime_allowance(
            collection.reference_runtime_secs(),
            self.config.minimum_testbatch_time_secs,
            self.config.reference_time_factor,
        )
    }

    #[tracing::instrument(skip_all, fields(submission = %submission.shortname()))]
    pub async fn run_submission(&self, submission: &Submission) -> Result<MultiRunReport> {
        info!("Starting testing of submission {}", submission);

        let image = match self.engine().inspect_image(&self.config.docker_image).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(image = %self.config.docker_image, error = %e, "Failed to inspect base image");
                None
            }
        };
        let build_allowance = self.build_allowance()?;
        let multirun_id = self
            .store
            .create_multirun(&NewMultiRun {
                submission: submission.shortname().to_string(),
                revision: submission.revision().map(str::to_string),
                build_constraints: BuildConstraints {
                    runtime_allowance_secs: build_allowance.map(|d| d.as_secs_f64()),
                },
                image,
            })
            .await
            .context("Failed to create multirun")?;

        let started = Instant::now();
        let safe_name = container_safe(submission.shortname());
        let network = format!("gauntlet_{}_{}", safe_name, &Uuid::new_v4().simple().to_string()[..8]);
        let network_created = match self.engine().create_network(&network, self.config.allow_network).await {
            Ok(()) => true,
            Err(e) => {
                warn!(network = %network, error = %e, "Failed to create network");
                false
            }
        };

        let build = if network_created {
            self.build(submission, &safe_name, &network, build_allowance).await
        } else {
            BuildStep {
                outcome: BuildOutcome {
                    status: RunStatus::Aborted,
                    runtime_secs: 0.0,
                    error_details: Some(json!({ "error": "failed to create network" })),
                },
                committed_image: None,
            }
        };

        let outcome = self.finish_build(multirun_id, build, submission, &safe_name, &network, started).await;

        if network_created {
            if let Err(e) = self.engine().remove_network(&network).await {
                warn!(network = %network, error = %e, "Failed to remove network");
            }
        }

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                self.abort_multirun(multirun_id, started).await;
                return Err(e);
            }
        };
        for callback in &self.callbacks.multirun_finished {
            callback(submission, multirun_id);
        }
        info!(
            multirun_id,
            status = ?report.status,
            runs = report.runs.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Finished testing of submission"
        );
        Ok(report)
    }

    /// Closes a multirun whose orchestration failed half-way, so it neither
    /// stays `running` nor marks its revision as tested
    async fn abort_multirun(&self, multirun_id: MultiRunId, started: Instant) {
        warn!(multirun_id, "Aborting multirun");
        if let Err(e) = self
            .store
            .close_multirun(multirun_id, MultiRunStatus::Aborted, started.elapsed())
            .await
        {
            warn!(multirun_id, error = %e, "Failed to close aborted multirun");
        }
    }

    /// Records the build outcome, runs every collection if it succeeded and
    /// closes the multirun
    async fn finish_build(
        &self,
        multirun_id: MultiRunId,
        build: BuildStep,
        submission: &Submission,
        safe_name: &str,
        network: &str,
        started: Instant,
    ) -> Result<MultiRunReport> {
        self.store
            .record_build(multirun_id, &build.outcome)
            .await
            .context("Failed to record build outcome")?;
        for callback in &self.callbacks.build_finished {
            callback(multirun_id);
        }

        let build_status = build.outcome.status;
        let mut runs = Vec::new();
        let status = match (build_status, &build.committed_image) {
            (RunStatus::Finished, Some(image)) => {
                let result = self
                    .run_collections(multirun_id, submission, safe_name, network, image, &mut runs)
                    .await;
                if let Err(e) = self.engine().remove_image(image).await {
                    warn!(image = %image, error = %e, "Failed to remove committed image");
                }
                result?;
                MultiRunStatus::Finished
            }
            _ => {
                info!(multirun_id, status = %build_status, "Build did not finish, skipping runs");
                if let Some(image) = &build.committed_image {
                    if let Err(e) = self.engine().remove_image(image).await {
                        warn!(image = %image, error = %e, "Failed to remove committed image");
                    }
                }
                // An infrastructure failure says nothing about the submission
                if build_status == RunStatus::Aborted {
                    MultiRunStatus::Aborted
                } else {
                    MultiRunStatus::BuildFailed
                }
            }
        };

        self.store
            .close_multirun(multirun_id, status, started.elapsed())
            .await
            .context("Failed to close multirun")?;

        Ok(MultiRunReport {
            multirun_id,
            status,
            build_status,
            runs,
        })
    }

    async fn build(
        &self,
        submission: &Submission,
        safe_name: &str,
        network: &str,
        allowance: Option<Duration>,
    ) -> BuildStep {
        let started = Instant::now();
        match self.execute_build(submission, safe_name, network, allowance).await {
            Ok((result, control_key)) => {
                let evaluation = evaluate_build(
                    &result.stdout_text(),
                    &control_key,
                    result.status,
                    result.error_details.clone(),
                );
                debug!(status = ?evaluation.status, stderr = %result.stderr_text(), "Build container finished");
                BuildStep {
                    outcome: BuildOutcome {
                        status: evaluation.status.into(),
                        runtime_secs: result.runtime.as_secs_f64(),
                        error_details: evaluation.error_details,
                    },
                    committed_image: result.post_result,
                }
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Build aborted by infrastructure error");
                BuildStep {
                    outcome: BuildOutcome {
                        status: RunStatus::Aborted,
                        runtime_secs: started.elapsed().as_secs_f64(),
                        error_details: Some(infrastructure_error(&e)),
                    },
                    committed_image: None,
                }
            }
        }
    }

    async fn execute_build(
        &self,
        submission: &Submission,
        safe_name: &str,
        network: &str,
        allowance: Option<Duration>,
    ) -> Result<(ExecutionResult, String)> {
        let control_key = Uuid::new_v4().to_string();
        let meta = json!({
            "control_key": control_key,
            "container_dut_dir": CONTAINER_DUT_DIR,
            "container_submission_tar_file": CONTAINER_SUBMISSION_TAR,
            "container_testcase_file": CONTAINER_TESTCASE_FILE,
            "build_name": self.config.build_name,
            "solution_name": self.config.solution_name,
            "max_build_time_secs": allowance.map(|d| d.as_secs_f64()),
            "submission": {
                "shortname": submission.shortname(),
                "meta": submission.meta(),
            },
        });
        let hooks = BuildHooks {
            archive: submission.archive().await?,
            meta: serde_json::to_vec(&meta).context("Failed to encode build metadata")?,
            testrunner: self.config.container_testrunner.clone(),
            repository: self.config.image_repository.clone(),
            tag: format!("{}_{}", safe_name.to_ascii_lowercase(), Uuid::new_v4().simple()),
        };

        let request = ContainerRequest {
            name_prefix: format!("gauntlet_bld_{}", safe_name),
            image: self.config.docker_image.clone(),
            command: vec![CONTAINER_TESTRUNNER.to_string(), "--execute-build".to_string()],
            network: Some(network.to_string()),
            memory_limit_mib: Some(self.config.max_memory_mib),
            cpu_limit: self.config.cpu_limit,
            timeout: allowance,
            dependencies: Default::default(),
        };
        let result = self.lifecycle.run(&request, &hooks).await?;
        Ok((result, control_key))
    }

    async fn run_collections(
        &self,
        multirun_id: MultiRunId,
        submission: &Submission,
        safe_name: &str,
        network: &str,
        image: &str,
        runs: &mut Vec<RunReport>,
    ) -> Result<()> {
        for collection in self.collections.iter() {
            let report = self
                .run_collection(multirun_id, safe_name, network, image, collection)
                .await?;
            info!(
                multirun_id,
                run_id = report.run_id,
                collection = %collection.name(),
                status = %report.status,
                summary = %report.summary.map(|s| s.to_string()).unwrap_or_default(),
                "Run finished"
            );
            let run_id = report.run_id;
            runs.push(report);
            for callback in &self.callbacks.run_finished {
                callback(submission, run_id);
            }
        }
        Ok(())
    }

    async fn run_collection(
        &self,
        multirun_id: MultiRunId,
        safe_name: &str,
        network: &str,
        image: &str,
        collection: &TestcaseCollection,
    ) -> Result<RunReport> {
        let allowance = self.run_allowance(collection)?;
        let constraints = RunConstraints {
            runtime_allowance_secs: allowance.map(|d| d.as_secs_f64()),
            max_permissible_ram_mib: self.config.max_memory_mib,
        };
        let run_id = self
            .store
            .create_run(multirun_id, collection.name(), &constraints)
            .await
            .context("Failed to create run")?;

        let result = self
            .execute_run(run_id, safe_name, network, image, allowance, collection)
            .await;
        if result.is_err() {
            // Best effort, the store may be what failed
            let closure = RunClosure {
                status: RunStatus::Aborted,
                runtime_secs: None,
                error_details: None,
            };
            if let Err(e) = self.store.close_run(run_id, &closure).await {
                warn!(run_id, error = %e, "Failed to close run after error");
            }
        }
        result
    }

    async fn execute_run(
        &self,
        run_id: RunId,
        safe_name: &str,
        network: &str,
        image: &str,
        allowance: Option<Duration>,
        collection: &TestcaseCollection,
    ) -> Result<RunReport> {
        let control_key = Uuid::new_v4().to_string();
        let testcases = json!({
            "control_key": control_key,
            "testcases": collection.guest_testcases(),
        });
        let hooks = RunHooks {
            testcases: serde_json::to_vec(&testcases).context("Failed to encode testcases")?,
        };
        let request = ContainerRequest {
            name_prefix: format!("gauntlet_run_{}", safe_name),
            image: image.to_string(),
            command: vec![CONTAINER_TESTRUNNER.to_string(), "--execute-run".to_string()],
            network: Some(network.to_string()),
            memory_limit_mib: Some(self.config.max_memory_mib),
            cpu_limit: self.config.cpu_limit,
            timeout: allowance,
            dependencies: collection.dependencies().clone(),
        };

        let result = match self.lifecycle.run(&request, &hooks).await {
            Ok(result) => result,
            Err(e) => {
                warn!(run_id, collection = %collection.name(), error = %format!("{:#}", e), "Run aborted by infrastructure error");
                let summary = unanswered(collection);
                self.store
                    .insert_test_summary(run_id, &summary)
                    .await
                    .context("Failed to store test summary")?;
                self.store
                    .close_run(
                        run_id,
                        &RunClosure {
                            status: RunStatus::Aborted,
                            runtime_secs: None,
                            error_details: Some(infrastructure_error(&e)),
                        },
                    )
                    .await
                    .context("Failed to close run")?;
                return Ok(RunReport {
                    run_id,
                    status: RunStatus::Aborted,
                    runtime: None,
                    summary: Some(summary),
                    replies: BTreeMap::new(),
                });
            }
        };

        let mut evaluator =
            TestEvaluator::new(collection, &control_key, self.config.failure_sample_size);
        evaluator.feed(&result.stdout_text());
        let evaluation = evaluator.finish(result.status, result.error_details.clone());

        self.store
            .insert_test_summary(run_id, &evaluation.summary)
            .await
            .context("Failed to store test summary")?;
        for failure in &evaluation.failures {
            self.store
                .insert_test_failure(run_id, failure)
                .await
                .context("Failed to store test failure")?;
        }
        let status = RunStatus::from(evaluation.status);
        self.store
            .close_run(
                run_id,
                &RunClosure {
                    status,
                    runtime_secs: Some(result.runtime.as_secs_f64()),
                    error_details: evaluation.error_details,
                },
            )
            .await
            .context("Failed to close run")?;

        Ok(RunReport {
            run_id,
            status,
            runtime: Some(result.runtime),
            summary: Some(evaluation.summary),
            replies: evaluation.replies,
        })
    }
}

/// Summary of a run that produced no output at all
fn unanswered(collection: &TestcaseCollection) -> TestSummary {
    let mut summary = TestSummary::default();
    summary.add(Verdict::NoAnswer, collection.len());
    summary
}
