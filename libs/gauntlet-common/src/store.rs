/// Result Store - persistence interface for multirun and run records
///
/// The orchestrator only ever talks to [`ResultStore`]; the Redis backend in
/// [`crate::redis`] is the production implementation and [`MemoryStore`] backs
/// tests and `--memory-store` invocations.

use crate::types::{
    BuildOutcome, MultiRunId, MultiRunRecord, MultiRunStatus, NewMultiRun, RunClosure,
    RunConstraints, RunId, RunRecord, RunStatus, TestFailure, TestSummary,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("multirun {0} not found")]
    UnknownMultiRun(MultiRunId),

    #[error("run {0} not found")]
    UnknownRun(RunId),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_multirun(&self, multirun: &NewMultiRun) -> StoreResult<MultiRunId>;

    async fn record_build(&self, id: MultiRunId, outcome: &BuildOutcome) -> StoreResult<()>;

    /// Closes the multirun and adds `elapsed` to the submission's cumulative
    /// pipeline time. Only a status that [`MultiRunStatus::is_result`] marks
    /// the multirun's revision as tested.
    async fn close_multirun(
        &self,
        id: MultiRunId,
        status: MultiRunStatus,
        elapsed: Duration,
    ) -> StoreResult<()>;

    async fn create_run(
        &self,
        multirun: MultiRunId,
        collection: &str,
        constraints: &RunConstraints,
    ) -> StoreResult<RunId>;

    async fn insert_test_summary(&self, run: RunId, summary: &TestSummary) -> StoreResult<()>;

    async fn insert_test_failure(&self, run: RunId, failure: &TestFailure) -> StoreResult<()>;

    async fn close_run(&self, run: RunId, closure: &RunClosure) -> StoreResult<()>;

    /// Revision of the most recently closed multirun for `submission` that
    /// produced a result
    async fn most_recent_tested_revision(&self, submission: &str) -> StoreResult<Option<String>>;

    /// Seconds spent in the pipeline, per submission shortname
    async fn cumulative_pipeline_time(&self) -> StoreResult<HashMap<String, f64>>;

    async fn get_multirun(&self, id: MultiRunId) -> StoreResult<Option<MultiRunRecord>>;

    async fn get_run(&self, id: RunId) -> StoreResult<Option<RunRecord>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_multirun: MultiRunId,
    next_run: RunId,
    multiruns: HashMap<MultiRunId, MultiRunRecord>,
    runs: HashMap<RunId, RunRecord>,
    revisions: HashMap<String, Option<String>>,
    pipeline_time: HashMap<String, f64>,
}

/// Process-local store; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn multirun_count(&self) -> usize {
        self.state.lock().await.multiruns.len()
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }

    /// Seeds the pipeline time of a submission, used to replay history
    pub async fn add_pipeline_time(&self, submission: &str, secs: f64) {
        *self
            .state
            .lock()
            .await
            .pipeline_time
            .entry(submission.to_string())
            .or_insert(0.0) += secs;
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_multirun(&self, multirun: &NewMultiRun) -> StoreResult<MultiRunId> {
        let mut state = self.state.lock().await;
        state.next_multirun += 1;
        let id = state.next_multirun;
        state.multiruns.insert(
            id,
            MultiRunRecord {
                id,
                submission: multirun.submission.clone(),
                revision: multirun.revision.clone(),
                status: MultiRunStatus::Running,
                build: None,
                build_constraints: multirun.build_constraints,
                image: multirun.image.clone(),
                started_at: Utc::now(),
                elapsed_secs: None,
                run_ids: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn record_build(&self, id: MultiRunId, outcome: &BuildOutcome) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .multiruns
            .get_mut(&id)
            .ok_or(StoreError::UnknownMultiRun(id))?;
        record.build = Some(outcome.clone());
        Ok(())
    }

    async fn close_multirun(
        &self,
        id: MultiRunId,
        status: MultiRunStatus,
        elapsed: Duration,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .multiruns
            .get_mut(&id)
            .ok_or(StoreError::UnknownMultiRun(id))?;
        record.status = status;
        record.elapsed_secs = Some(elapsed.as_secs_f64());
        let submission = record.submission.clone();
        let revision = record.revision.clone();
        if status.is_result() {
            state.revisions.insert(submission.clone(), revision);
        }
        *state.pipeline_time.entry(submission).or_insert(0.0) += elapsed.as_secs_f64();
        Ok(())
    }

    async fn create_run(
        &self,
        multirun: MultiRunId,
        collection: &str,
        constraints: &RunConstraints,
    ) -> StoreResult<RunId> {
        let mut state = self.state.lock().await;
        if !state.multiruns.contains_key(&multirun) {
            return Err(StoreError::UnknownMultiRun(multirun));
        }
        state.next_run += 1;
        let id = state.next_run;
        state.runs.insert(
            id,
            RunRecord {
                id,
                multirun_id: multirun,
                collection: collection.to_string(),
                constraints: *constraints,
                status: RunStatus::Running,
                started_at: Utc::now(),
                runtime_secs: None,
                error_details: None,
                summary: None,
                failures: Vec::new(),
            },
        );
        if let Some(record) = state.multiruns.get_mut(&multirun) {
            record.run_ids.push(id);
        }
        Ok(id)
    }

    async fn insert_test_summary(&self, run: RunId, summary: &TestSummary) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        record.summary = Some(*summary);
        Ok(())
    }

    async fn insert_test_failure(&self, run: RunId, failure: &TestFailure) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        record.failures.push(failure.clone());
        Ok(())
    }

    async fn close_run(&self, run: RunId, closure: &RunClosure) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.runs.get_mut(&run).ok_or(StoreError::UnknownRun(run))?;
        record.status = closure.status;
        record.runtime_secs = closure.runtime_secs;
        record.error_details = closure.error_details.clone();
        Ok(())
    }

    async fn most_recent_tested_revision(&self, submission: &str) -> StoreResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .revisions
            .get(submission)
            .cloned()
            .flatten())
    }

    async fn cumulative_pipeline_time(&self) -> StoreResult<HashMap<String, f64>> {
        Ok(self.state.lock().await.pipeline_time.clone())
    }

    async fn get_multirun(&self, id: MultiRunId) -> StoreResult<Option<MultiRunRecord>> {
        Ok(self.state.lock().await.multiruns.get(&id).cloned())
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<RunRecord>> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildConstraints, Verdict};
    use serde_json::json;

    fn new_multirun(submission: &str, revision: &str) -> NewMultiRun {
        NewMultiRun {
            submission: submission.to_string(),
            revision: Some(revision.to_string()),
            build_constraints: BuildConstraints {
                runtime_allowance_secs: Some(30.0),
            },
            image: None,
        }
    }

    #[tokio::test]
    async fn test_multirun_lifecycle() {
        let store = MemoryStore::new();
        let id = store.create_multirun(&new_multirun("alice", "abc123")).await.unwrap();

        let constraints = RunConstraints {
            runtime_allowance_secs: Some(5.0),
            max_permissible_ram_mib: 1024,
        };
        let run = store.create_run(id, "basic", &constraints).await.unwrap();

        let mut summary = TestSummary::default();
        summary.add(Verdict::Pass, 3);
        store.insert_test_summary(run, &summary).await.unwrap();
        store
            .insert_test_failure(
                run,
                &TestFailure {
                    testcase_id: 4,
                    verdict: Verdict::Fail,
                    action: "add".to_string(),
                    arguments: json!({}),
                    expected_reply: Some(json!(1)),
                    received_reply: json!(2),
                },
            )
            .await
            .unwrap();
        store
            .close_run(
                run,
                &RunClosure {
                    status: RunStatus::Finished,
                    runtime_secs: Some(1.5),
                    error_details: None,
                },
            )
            .await
            .unwrap();
        store
            .close_multirun(id, MultiRunStatus::Finished, Duration::from_secs(12))
            .await
            .unwrap();

        let multirun = store.get_multirun(id).await.unwrap().unwrap();
        assert_eq!(multirun.status, MultiRunStatus::Finished);
        assert_eq!(multirun.run_ids, vec![run]);

        let record = store.get_run(run).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Finished);
        assert_eq!(record.summary.unwrap().pass, 3);
        assert_eq!(record.failures.len(), 1);

        assert_eq!(
            store.most_recent_tested_revision("alice").await.unwrap(),
            Some("abc123".to_string())
        );
        assert_eq!(store.cumulative_pipeline_time().await.unwrap()["alice"], 12.0);
    }

    #[tokio::test]
    async fn test_revision_recorded_only_on_result() {
        let store = MemoryStore::new();
        let first = store.create_multirun(&new_multirun("bob", "r1")).await.unwrap();
        assert!(store.most_recent_tested_revision("bob").await.unwrap().is_none());
        store
            .close_multirun(first, MultiRunStatus::BuildFailed, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            store.most_recent_tested_revision("bob").await.unwrap(),
            Some("r1".to_string())
        );

        let second = store.create_multirun(&new_multirun("bob", "r2")).await.unwrap();
        store
            .close_multirun(second, MultiRunStatus::Aborted, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            store.most_recent_tested_revision("bob").await.unwrap(),
            Some("r1".to_string())
        );
        assert_eq!(store.cumulative_pipeline_time().await.unwrap()["bob"], 2.0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_errors() {
        let store = MemoryStore::new();
        let constraints = RunConstraints {
            runtime_allowance_secs: None,
            max_permissible_ram_mib: 512,
        };
        assert!(matches!(
            store.create_run(42, "basic", &constraints).await,
            Err(StoreError::UnknownMultiRun(42))
        ));
        assert!(store.most_recent_tested_revision("nobody").await.unwrap().is_none());
    }
}
