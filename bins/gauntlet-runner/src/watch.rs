/// Watch Scheduler - continuous re-testing of changed submissions
///
/// One cycle:
/// 1. discover submissions, keep the version-controlled ones
/// 2. update them through a small gate; any failure aborts the cycle
/// 3. discover again for fresh metadata and drop every submission whose
///    revision was already tested or that is still being tested
/// 4. order by cumulative pipeline time, cheapest first
/// 5. for `loop_duration`, hand the head of the queue to the runner whenever
///    its gate has a free slot
///
/// Work left in the queue is simply rediscovered by the next cycle.

use crate::config::FixtureConfig;
use crate::gate::ConcurrencyGate;
use crate::runner::TestRunner;
use crate::submission::{Submission, SubmissionSource};
use anyhow::{Context, Result};
use gauntlet_common::store::ResultStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub update_parallelism: usize,
    pub loop_duration: Duration,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl From<&FixtureConfig> for WatchSettings {
    fn from(config: &FixtureConfig) -> Self {
        Self {
            update_parallelism: config.git_update_parallelism,
            loop_duration: config.watch_loop_duration(),
            retry_delay: config.watch_retry_delay(),
            poll_interval: config.watch_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// At least one update failed; nothing was scheduled
    UpdateFailed { failures: usize },
    Completed {
        scheduled: Vec<String>,
        /// Already tested at their current revision
        unchanged: usize,
        /// Still being tested from an earlier cycle
        in_flight: usize,
        /// Still queued when the loop duration ran out
        pending: usize,
    },
}

impl CycleReport {
    pub fn all_scheduled(&self) -> bool {
        matches!(self, CycleReport::Completed { pending: 0, .. })
    }
}

pub struct WatchScheduler {
    source: Arc<dyn SubmissionSource>,
    runner: TestRunner,
    store: Arc<dyn ResultStore>,
    settings: WatchSettings,
}

impl WatchScheduler {
    pub fn new(
        source: Arc<dyn SubmissionSource>,
        runner: TestRunner,
        store: Arc<dyn ResultStore>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            source,
            runner,
            store,
            settings,
        }
    }

    pub fn runner(&self) -> &TestRunner {
        &self.runner
    }

    /// Runs cycles forever
    pub async fn watch(&self) -> Result<()> {
        info!(
            max_parallel = self.runner.gate().max_parallel(),
            loop_duration_secs = self.settings.loop_duration.as_secs(),
            "Watching submissions"
        );
        loop {
            match self.run_cycle().await {
                Ok(CycleReport::UpdateFailed { failures }) => {
                    warn!(
                        failures,
                        retry_secs = self.settings.retry_delay.as_secs(),
                        "Update of submission repositories failed, delaying and retrying"
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Ok(report) => {
                    if !report.all_scheduled() {
                        info!(
                            slots_free = self.runner.gate().slots_free(),
                            pending = self.runner.gate().pending(),
                            "Submissions still pending after cycle"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Watch cycle failed");
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let submissions = self.version_controlled().await?;

        let failures = self.update_all(&submissions).await;
        if failures > 0 {
            return Ok(CycleReport::UpdateFailed { failures });
        }

        // Metadata changes with the update
        let submissions = self.version_controlled().await?;
        let total = submissions.len();
        let (submissions, in_flight): (Vec<_>, Vec<_>) = submissions
            .into_iter()
            .partition(|s| !self.runner.is_in_flight(s.shortname()));
        let in_flight = in_flight.len();
        let mut queue = self.changed(submissions).await?;
        let unchanged = total - in_flight - queue.len();

        info!(
            slots_free = self.runner.gate().slots_free(),
            requested = queue.len(),
            unchanged,
            in_flight,
            "Repository watcher cycle"
        );

        let pipeline_time = self
            .store
            .cumulative_pipeline_time()
            .await
            .context("Failed to read pipeline times")?;
        prioritize(&mut queue, &pipeline_time);

        let scheduled = self.schedule(VecDeque::from(queue)).await;
        Ok(CycleReport::Completed {
            pending: total - unchanged - in_flight - scheduled.len(),
            scheduled,
            unchanged,
            in_flight,
        })
    }

    async fn version_controlled(&self) -> Result<Vec<Submission>> {
        let submissions = self
            .source
            .discover()
            .await
            .context("Failed to discover submissions")?;
        Ok(submissions
            .into_iter()
            .filter(Submission::is_version_controlled)
            .collect())
    }

    /// Returns the number of failed updates
    async fn update_all(&self, submissions: &[Submission]) -> usize {
        let gate = ConcurrencyGate::with_error_callback(
            self.settings.update_parallelism,
            Arc::new(|e: &anyhow::Error| {
                warn!(error = %format!("{:#}", e), "Submission update failed");
            }),
        );
        for submission in submissions {
            let source = self.source.clone();
            let submission = submission.clone();
            gate.submit(async move { source.update(&submission).await }).await;
        }
        gate.wait().await;
        gate.exception_count()
    }

    async fn changed(&self, submissions: Vec<Submission>) -> Result<Vec<Submission>> {
        let mut changed = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let tested = self
                .store
                .most_recent_tested_revision(submission.shortname())
                .await
                .context("Failed to read tested revision")?;
            if tested.as_deref() != submission.revision() {
                changed.push(submission);
            }
        }
        Ok(changed)
    }

    async fn schedule(&self, mut queue: VecDeque<Submission>) -> Vec<String> {
        let deadline = Instant::now() + self.settings.loop_duration;
        let mut scheduled = Vec::new();
        loop {
            while self.runner.gate().slots_free() > 0 {
                let Some(next) = queue.pop_front() else {
                    break;
                };
                info!(submission = %next, "Submitting for testing");
                scheduled.push(next.shortname().to_string());
                self.runner.submit(next).await;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        scheduled
    }
}

/// Cheapest cumulative pipeline time first; unknown submissions count as 0
fn prioritize(submissions: &mut [Submission], pipeline_time: &HashMap<String, f64>) {
    let cost = |s: &Submission| pipeline_time.get(s.shortname()).copied().unwrap_or(0.0);
    submissions.sort_by(|a, b| cost(a).total_cmp(&cost(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SubmissionOrchestrator;
    use crate::testing::{fixture_config, git_submission, FakeEngine, FakeSource, ScriptedExit};
    use gauntlet_common::store::MemoryStore;
    use gauntlet_common::types::TestcaseCollection;

    struct Harness {
        _dir: tempfile::TempDir,
        source: Arc<FakeSource>,
        store: Arc<MemoryStore>,
        engine: Arc<FakeEngine>,
        scheduler: WatchScheduler,
    }

    fn harness(names: &[&str], max_parallel: usize) -> Harness {
        harness_with(names, max_parallel, |_| {})
    }

    fn harness_with(
        names: &[&str],
        max_parallel: usize,
        adjust: impl FnOnce(&mut FixtureConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture_config(dir.path());
        adjust(&mut config);
        let config = Arc::new(config);
        let submissions = names
            .iter()
            .map(|name| {
                std::fs::create_dir_all(dir.path().join(name)).unwrap();
                git_submission(dir.path(), name, "c0ffee01")
            })
            .collect();
        let source = Arc::new(FakeSource::new(submissions));
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(FakeEngine::new());
        let collection = TestcaseCollection::new("empty", None, vec![]).unwrap();
        let orchestrator = SubmissionOrchestrator::new(
            engine.clone(),
            store.clone(),
            config.clone(),
            Arc::new(vec![collection]),
            Default::default(),
        );
        let runner = TestRunner::new(Arc::new(orchestrator), max_parallel);
        let scheduler = WatchScheduler::new(
            source.clone(),
            runner,
            store.clone(),
            WatchSettings::from(config.as_ref()),
        );
        Harness {
            _dir: dir,
            source,
            store,
            engine,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_unchanged_submissions_are_not_rescheduled() {
        let h = harness(&["alice", "bob"], 4);

        let first = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert!(first.all_scheduled());
        assert_eq!(h.store.multirun_count().await, 2);

        let second = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert_eq!(
            second,
            CycleReport::Completed {
                scheduled: vec![],
                unchanged: 2,
                in_flight: 0,
                pending: 0
            }
        );
        assert_eq!(h.store.multirun_count().await, 2);
        assert_eq!(h.source.update_calls(), 4);
    }

    #[tokio::test]
    async fn test_new_commit_is_rescheduled() {
        let h = harness(&["alice"], 2);
        h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;

        h.source.set_commit("alice", "deadbeef");
        let report = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert!(matches!(report, CycleReport::Completed { ref scheduled, .. } if scheduled == &["alice"]));
        assert_eq!(h.store.multirun_count().await, 2);
    }

    #[tokio::test]
    async fn test_in_flight_submission_not_rescheduled() {
        let h = harness_with(&["alice"], 2, |config| config.max_build_time_secs = 0.2);
        h.engine.script(ScriptedExit::hang());

        let first = h.scheduler.run_cycle().await.unwrap();
        assert!(first.all_scheduled());
        assert!(h.scheduler.runner().is_in_flight("alice"));

        let second = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(
            second,
            CycleReport::Completed {
                scheduled: vec![],
                unchanged: 0,
                in_flight: 1,
                pending: 0
            }
        );

        h.scheduler.runner().gate().wait().await;
        assert!(!h.scheduler.runner().is_in_flight("alice"));
        assert_eq!(h.store.multirun_count().await, 1);
        let third = h.scheduler.run_cycle().await.unwrap();
        assert!(matches!(third, CycleReport::Completed { unchanged: 1, .. }));
    }

    #[tokio::test]
    async fn test_aborted_multirun_is_retried() {
        let h = harness(&["alice"], 2);
        h.engine.fail_containers_from("gauntlet-testrunner:latest");

        h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert!(h.store.most_recent_tested_revision("alice").await.unwrap().is_none());

        let retry = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert!(matches!(retry, CycleReport::Completed { ref scheduled, .. } if scheduled == &["alice"]));
        assert_eq!(h.store.multirun_count().await, 2);
    }

    #[tokio::test]
    async fn test_update_failure_aborts_cycle() {
        let h = harness(&["alice", "bob"], 2);
        h.source.fail_updates(true);

        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::UpdateFailed { failures: 2 });
        assert!(!report.all_scheduled());
        assert_eq!(h.store.multirun_count().await, 0);
    }

    #[tokio::test]
    async fn test_cheapest_submission_first_under_backpressure() {
        let h = harness(&["heavy", "light"], 1);
        h.store.add_pipeline_time("heavy", 500.0).await;

        let report = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert_eq!(
            report,
            CycleReport::Completed {
                scheduled: vec!["light".to_string()],
                unchanged: 0,
                in_flight: 0,
                pending: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unversioned_submissions_ignored() {
        let h = harness(&["alice"], 2);
        h.source.add(Submission::from_parts(
            "plain",
            h._dir.path().join("plain"),
            Default::default(),
        ));
        let report = h.scheduler.run_cycle().await.unwrap();
        h.scheduler.runner().gate().wait().await;
        assert!(matches!(report, CycleReport::Completed { ref scheduled, .. } if scheduled == &["alice"]));
    }

    #[test]
    fn test_prioritize_unknown_counts_as_zero() {
        let dir = std::path::Path::new("/tmp");
        let mut submissions = vec![
            git_submission(dir, "b", "1"),
            git_submission(dir, "a", "1"),
            git_submission(dir, "c", "1"),
        ];
        let times = HashMap::from([("b".to_string(), 3.0), ("c".to_string(), 1.0)]);
        prioritize(&mut submissions, &times);
        let order: Vec<&str> = submissions.iter().map(|s| s.shortname()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }
}
