/// Reference Runs - gauge collection runtimes with a trusted submission
///
/// The reference runs without any time allowance. Its measured runtime
/// becomes the collection's reference runtime and its replies fill in
/// testcases that have no answer yet.

use crate::config::FixtureConfig;
use crate::docker::ContainerEngine;
use crate::executor::{Callbacks, SubmissionOrchestrator};
use crate::submission::Submission;
use anyhow::{Context, Result};
use gauntlet_common::store::ResultStore;
use gauntlet_common::types::{RunStatus, TestcaseCollection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceReport {
    pub path: PathBuf,
    pub collection: String,
    pub status: RunStatus,
    pub runtime_secs: Option<f64>,
    /// Reference agreed with the stored answer
    pub confirmed: usize,
    /// Testcases without an answer that now have one
    pub adopted: usize,
    /// Reference disagreed with the stored answer; the stored one is kept
    pub mismatched: usize,
    pub committed: bool,
}

pub struct ReferenceRecorder {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn ResultStore>,
    config: Arc<FixtureConfig>,
}

impl ReferenceRecorder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn ResultStore>,
        config: Arc<FixtureConfig>,
    ) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// Runs `submission` against each collection file in turn, without any
    /// time allowance. With `commit` the measured runtime and adopted
    /// answers are written back into the file.
    pub async fn record(
        &self,
        submission: &Submission,
        collection_files: &[PathBuf],
        commit: bool,
    ) -> Result<Vec<ReferenceReport>> {
        let mut reports = Vec::with_capacity(collection_files.len());
        for path in collection_files {
            reports.push(self.record_one(submission, path, commit).await?);
        }
        Ok(reports)
    }

    async fn record_one(
        &self,
        submission: &Submission,
        path: &Path,
        commit: bool,
    ) -> Result<ReferenceReport> {
        let mut collection = TestcaseCollection::load(path)?;
        let orchestrator = SubmissionOrchestrator::new(
            self.engine.clone(),
            self.store.clone(),
            self.config.clone(),
            Arc::new(vec![collection.clone()]),
            Callbacks::default(),
        )
        .without_timeouts();

        let multirun = orchestrator
            .run_submission(submission)
            .await
            .with_context(|| format!("Reference run for {} failed", path.display()))?;

        let mut report = ReferenceReport {
            path: path.to_path_buf(),
            collection: collection.name().to_string(),
            status: multirun.build_status,
            runtime_secs: None,
            confirmed: 0,
            adopted: 0,
            mismatched: 0,
            committed: false,
        };

        let Some(run) = multirun.runs.into_iter().next() else {
            warn!(path = %path.display(), status = %report.status, "Reference build did not finish");
            return Ok(report);
        };
        report.status = run.status;
        report.runtime_secs = run.runtime.map(|d| d.as_secs_f64());
        if run.status != RunStatus::Finished {
            warn!(
                path = %path.display(),
                status = %run.status,
                "Refusing to use a reference run that did not finish"
            );
            return Ok(report);
        }

        for (id, reply) in run.replies {
            let expected = collection.get(id).and_then(|tc| tc.correct_reply.clone());
            match expected {
                None => {
                    collection.set_correct_reply(id, reply);
                    report.adopted += 1;
                }
                Some(expected) if expected == reply => report.confirmed += 1,
                Some(_) => {
                    warn!(testcase_id = id, "Reference disagrees with stored answer");
                    report.mismatched += 1;
                }
            }
        }

        info!(
            path = %path.display(),
            confirmed = report.confirmed,
            adopted = report.adopted,
            mismatched = report.mismatched,
            runtime_secs = report.runtime_secs,
            "Reference run finished"
        );

        if commit {
            if let Some(runtime) = report.runtime_secs {
                if !collection.set_reference_runtime_secs(runtime) {
                    warn!(path = %path.display(), runtime_secs = runtime, "Measured runtime unusable, keeping previous value");
                }
            }
            collection.save(path)?;
            report.committed = true;
        } else {
            info!(path = %path.display(), "Not committing reference results");
        }
        Ok(report)
    }
}
