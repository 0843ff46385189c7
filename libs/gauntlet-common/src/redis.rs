/// Redis Store - production backend for multirun and run records

use crate::config::StoreConfig;
use crate::store::{ResultStore, StoreError, StoreResult};
use crate::types::{
    BuildOutcome, MultiRunId, MultiRunRecord, MultiRunStatus, NewMultiRun, RunClosure,
    RunConstraints, RunId, RunRecord, RunStatus, TestFailure, TestSummary,
};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Redis key layout - deterministic so that report tooling reading the same
/// database never drifts from the runner.

pub fn multirun_seq_key(prefix: &str) -> String {
    format!("{}:seq:multirun", prefix)
}

pub fn run_seq_key(prefix: &str) -> String {
    format!("{}:seq:run", prefix)
}

pub fn multirun_key(prefix: &str, id: MultiRunId) -> String {
    format!("{}:multirun:{}", prefix, id)
}

pub fn multirun_runs_key(prefix: &str, id: MultiRunId) -> String {
    format!("{}:multirun:{}:runs", prefix, id)
}

pub fn run_key(prefix: &str, id: RunId) -> String {
    format!("{}:run:{}", prefix, id)
}

pub fn run_failures_key(prefix: &str, id: RunId) -> String {
    format!("{}:run:{}:failures", prefix, id)
}

pub fn revision_key(prefix: &str, submission: &str) -> String {
    format!("{}:revision:{}", prefix, submission)
}

pub fn pipeline_time_key(prefix: &str) -> String {
    format!("{}:pipeline_time", prefix)
}

/// Result store persisting JSON documents in Redis
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
        })
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize + Sync>(&self, key: &str, value: &T) -> StoreResult<()> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, payload).await?;
        Ok(())
    }

    async fn next_id(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(key, 1u64).await?;
        Ok(id)
    }

    async fn load_multirun(&self, id: MultiRunId) -> StoreResult<MultiRunRecord> {
        self.load(&multirun_key(&self.prefix, id))
            .await?
            .ok_or(StoreError::UnknownMultiRun(id))
    }

    async fn load_run(&self, id: RunId) -> StoreResult<RunRecord> {
        self.load(&run_key(&self.prefix, id))
            .await?
            .ok_or(StoreError::UnknownRun(id))
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn create_multirun(&self, multirun: &NewMultiRun) -> StoreResult<MultiRunId> {
        let id = self.next_id(&multirun_seq_key(&self.prefix)).await?;
        let record = MultiRunRecord {
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
        };
        self.save(&multirun_key(&self.prefix, id), &record).await?;
        Ok(id)
    }

    async fn record_build(&self, id: MultiRunId, outcome: &BuildOutcome) -> StoreResult<()> {
        let mut record = self.load_multirun(id).await?;
        record.build = Some(outcome.clone());
        self.save(&multirun_key(&self.prefix, id), &record).await
    }

    async fn close_multirun(
        &self,
        id: MultiRunId,
        status: MultiRunStatus,
        elapsed: Duration,
    ) -> StoreResult<()> {
        let mut record = self.load_multirun(id).await?;
        record.status = status;
        record.elapsed_secs = Some(elapsed.as_secs_f64());
        self.save(&multirun_key(&self.prefix, id), &record).await?;

        let mut conn = self.conn.clone();
        if status.is_result() {
            let revision_key = revision_key(&self.prefix, &record.submission);
            match &record.revision {
                Some(revision) => {
                    let _: () = conn.set(&revision_key, revision).await?;
                }
                None => {
                    let _: () = conn.del(&revision_key).await?;
                }
            }
        }
        let _: f64 = conn
            .hincr(
                pipeline_time_key(&self.prefix),
                &record.submission,
                elapsed.as_secs_f64(),
            )
            .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        multirun: MultiRunId,
        collection: &str,
        constraints: &RunConstraints,
    ) -> StoreResult<RunId> {
        // Existence check so that runs never dangle
        self.load_multirun(multirun).await?;

        let id = self.next_id(&run_seq_key(&self.prefix)).await?;
        let record = RunRecord {
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
        };
        self.save(&run_key(&self.prefix, id), &record).await?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(multirun_runs_key(&self.prefix, multirun), id)
            .await?;
        Ok(id)
    }

    async fn insert_test_summary(&self, run: RunId, summary: &TestSummary) -> StoreResult<()> {
        let mut record = self.load_run(run).await?;
        record.summary = Some(*summary);
        self.save(&run_key(&self.prefix, run), &record).await
    }

    async fn insert_test_failure(&self, run: RunId, failure: &TestFailure) -> StoreResult<()> {
        let payload = serde_json::to_string(failure)?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(run_failures_key(&self.prefix, run), payload).await?;
        Ok(())
    }

    async fn close_run(&self, run: RunId, closure: &RunClosure) -> StoreResult<()> {
        let mut record = self.load_run(run).await?;
        record.status = closure.status;
        record.runtime_secs = closure.runtime_secs;
        record.error_details = closure.error_details.clone();
        self.save(&run_key(&self.prefix, run), &record).await
    }

    async fn most_recent_tested_revision(&self, submission: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let revision: Option<String> = conn.get(revision_key(&self.prefix, submission)).await?;
        Ok(revision)
    }

    async fn cumulative_pipeline_time(&self) -> StoreResult<HashMap<String, f64>> {
        let mut conn = self.conn.clone();
        let times: HashMap<String, f64> = conn.hgetall(pipeline_time_key(&self.prefix)).await?;
        Ok(times)
    }

    async fn get_multirun(&self, id: MultiRunId) -> StoreResult<Option<MultiRunRecord>> {
        let Some(mut record) = self
            .load::<MultiRunRecord>(&multirun_key(&self.prefix, id))
            .await?
        else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        record.run_ids = conn
            .lrange(multirun_runs_key(&self.prefix, id), 0, -1)
            .await?;
        Ok(Some(record))
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<RunRecord>> {
        let Some(mut record) = self.load::<RunRecord>(&run_key(&self.prefix, id)).await? else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        let failures: Vec<String> = conn
            .lrange(run_failures_key(&self.prefix, id), 0, -1)
            .await?;
        record.failures = failures
            .iter()
            .map(|payload| serde_json::from_str(payload))
            .collect::<Result<_, _>>()?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(multirun_key("gauntlet", 7), "gauntlet:multirun:7");
        assert_eq!(multirun_runs_key("gauntlet", 7), "gauntlet:multirun:7:runs");
        assert_eq!(run_key("gauntlet", 12), "gauntlet:run:12");
        assert_eq!(run_failures_key("gauntlet", 12), "gauntlet:run:12:failures");
        assert_eq!(pipeline_time_key("gauntlet"), "gauntlet:pipeline_time");
    }

    #[test]
    fn test_revision_key_scoped_by_submission() {
        let key = revision_key("gauntlet", "alice");
        assert_eq!(key, "gauntlet:revision:alice");
        assert_ne!(key, revision_key("gauntlet", "bob"));
    }

    #[test]
    fn test_sequence_keys_distinct() {
        assert_ne!(multirun_seq_key("g"), run_seq_key("g"));
        assert!(multirun_seq_key("g").starts_with("g:seq:"));
    }

    /// Requires a running Redis instance
    #[tokio::test]
    #[ignore]
    async fn test_redis_store_roundtrip() {
        use crate::types::BuildConstraints;

        let config = StoreConfig {
            key_prefix: format!("gauntlet-test-{}", uuid::Uuid::new_v4()),
            ..StoreConfig::from_env()
        };
        let store = RedisStore::connect(&config).await.expect("Failed to connect to Redis");

        let id = store
            .create_multirun(&NewMultiRun {
                submission: "alice".to_string(),
                revision: Some("deadbeef".to_string()),
                build_constraints: BuildConstraints {
                    runtime_allowance_secs: Some(30.0),
                },
                image: None,
            })
            .await
            .unwrap();
        let run = store
            .create_run(
                id,
                "basic",
                &RunConstraints {
                    runtime_allowance_secs: None,
                    max_permissible_ram_mib: 256,
                },
            )
            .await
            .unwrap();
        store
            .close_multirun(id, MultiRunStatus::Finished, Duration::from_secs(3))
            .await
            .unwrap();

        let record = store.get_multirun(id).await.unwrap().unwrap();
        assert_eq!(record.run_ids, vec![run]);
        assert_eq!(
            store.most_recent_tested_revision("alice").await.unwrap(),
            Some("deadbeef".to_string())
        );
        assert!(store.cumulative_pipeline_time().await.unwrap()["alice"] >= 3.0);
    }
}
