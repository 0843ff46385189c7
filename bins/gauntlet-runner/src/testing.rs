/// Test Doubles - scripted container engine, submission source and store

use crate::docker::{ContainerEngine, ContainerLogs, ContainerSpec};
use crate::submission::{GitInfo, Submission, SubmissionMeta, SubmissionSource};
use anyhow::{bail, Result};
use async_trait::async_trait;
use gauntlet_common::store::{MemoryStore, ResultStore, StoreError, StoreResult};
use gauntlet_common::types::{
    BuildOutcome, ImageMetadata, MultiRunId, MultiRunRecord, MultiRunStatus, NewMultiRun,
    RunClosure, RunConstraints, RunId, RunRecord, TestFailure, TestSummary,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Files written into a container, by absolute path
pub type Files = BTreeMap<String, Vec<u8>>;

type Responder = Arc<dyn Fn(&Files) -> String + Send + Sync>;

/// How the next subject container behaves
#[derive(Clone)]
pub struct ScriptedExit {
    /// `None` runs until killed
    exit_code: Option<i64>,
    stdout: Responder,
    stderr: String,
}

impl ScriptedExit {
    pub fn code(exit_code: i64) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: Arc::new(|_| String::new()),
            stderr: String::new(),
        }
    }

    pub fn hang() -> Self {
        Self {
            exit_code: None,
            ..Self::code(0)
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        let text = text.to_string();
        self.stdout = Arc::new(move |_| text.clone());
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = text.to_string();
        self
    }

    /// Produce stdout from what was injected, e.g. to echo the control key
    pub fn respond<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Files) -> String + Send + Sync + 'static,
    {
        self.stdout = Arc::new(responder);
        self
    }
}

/// Reads an injected JSON file
pub fn json_file(files: &Files, path: &str) -> Value {
    files
        .get(path)
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or(Value::Null)
}

/// Control key the orchestrator handed to the guest
pub fn control_key(files: &Files) -> String {
    let from_testcases = json_file(files, "/testcases.json")["control_key"].clone();
    let key = if from_testcases.is_null() {
        json_file(files, "/meta.json")["control_key"].clone()
    } else {
        from_testcases
    };
    key.as_str().unwrap_or_default().to_string()
}

struct FakeContainer {
    spec: ContainerSpec,
    files: Files,
    script: Option<ScriptedExit>,
    killed: bool,
    removed: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    scripts: VecDeque<ScriptedExit>,
    events: Vec<String>,
    created: Vec<ContainerSpec>,
    networks: Vec<String>,
    images: Vec<String>,
    failing_images: Vec<String>,
    image_labels: Option<ImageMetadata>,
    /// `stop` reports failure, as for a container that already exited
    fail_stops: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviour for the next subject container; unscripted subjects
    /// exit 0 without output
    pub fn script(&self, exit: ScriptedExit) {
        self.state.lock().unwrap().scripts.push_back(exit);
    }

    /// Creating containers from `image` fails like an unreachable daemon
    pub fn fail_containers_from(&self, image: &str) {
        self.state.lock().unwrap().failing_images.push(image.to_string());
    }

    /// Every `stop` fails the way Docker refuses to kill an exited
    /// container; the container is gone nonetheless
    pub fn fail_stops(&self) {
        self.state.lock().unwrap().fail_stops = true;
    }

    pub fn set_image_metadata(&self, metadata: ImageMetadata) {
        self.state.lock().unwrap().image_labels = Some(metadata);
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn live_containers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.containers.values().filter(|c| !c.removed).count()
    }

    pub fn live_networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.clone()
    }

    pub fn live_images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.clone()
    }

    /// Files of every subject container, in creation order
    pub fn injected_files(&self) -> Vec<Files> {
        let state = self.state.lock().unwrap();
        let mut containers: Vec<(&String, &FakeContainer)> = state
            .containers
            .iter()
            .filter(|(_, c)| c.spec.network_alias.is_none())
            .collect();
        containers.sort_by_key(|(id, _)| id[2..].parse::<u64>().unwrap_or(0));
        containers.into_iter().map(|(_, c)| c.files.clone()).collect()
    }

    fn record(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }

    fn with_container<T>(&self, id: &str, f: impl FnOnce(&mut FakeContainer) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => Ok(f(container)),
            _ => bail!("No such container: {}", id),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_network(&self, name: &str, allow_external: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.networks.push(name.to_string());
        state
            .events
            .push(format!("create_network {} external={}", name, allow_external));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.networks.retain(|n| n != name);
        state.events.push(format!("remove_network {}", name));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.failing_images.contains(&spec.image) {
            bail!("Docker daemon unreachable");
        }
        state.next_id += 1;
        let id = format!("c-{}", state.next_id);
        let script = if spec.network_alias.is_none() {
            Some(state.scripts.pop_front().unwrap_or_else(|| ScriptedExit::code(0)))
        } else {
            None
        };
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                files: Files::new(),
                script,
                killed: false,
                removed: false,
            },
        );
        state.created.push(spec.clone());
        state.events.push(format!("create {} {}", id, spec.image));
        Ok(id)
    }

    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8], _mode: u32) -> Result<()> {
        self.with_container(container_id, |c| {
            c.files.insert(path.to_string(), contents.to_vec());
        })?;
        self.record(format!("write {} {}", container_id, path));
        Ok(())
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.with_container(container_id, |_| ())?;
        self.record(format!("start {}", container_id));
        Ok(())
    }

    async fn wait_timeout(&self, container_id: &str, timeout: Option<Duration>) -> Result<Option<i64>> {
        let (exit_code, killed) = self.with_container(container_id, |c| {
            (c.script.as_ref().and_then(|s| s.exit_code), c.killed)
        })?;
        if let Some(code) = exit_code {
            return Ok(Some(code));
        }
        if killed {
            return Ok(Some(137));
        }
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                Ok(None)
            }
            None => bail!("Container {} would never exit", container_id),
        }
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        self.with_container(container_id, |c| c.killed = true)?;
        if self.state.lock().unwrap().fail_stops {
            bail!("Container {} is not running", container_id);
        }
        self.record(format!("stop {} grace={}", container_id, grace.as_secs()));
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let (script, files) =
            self.with_container(container_id, |c| (c.script.clone(), c.files.clone()))?;
        self.record(format!("logs {}", container_id));
        Ok(match script {
            Some(script) => ContainerLogs {
                stdout: (script.stdout)(&files).into_bytes(),
                stderr: script.stderr.into_bytes(),
            },
            None => ContainerLogs::default(),
        })
    }

    async fn commit(&self, container_id: &str, repository: &str, tag: &str) -> Result<String> {
        self.with_container(container_id, |_| ())?;
        let image = format!("{}:{}", repository, tag);
        let mut state = self.state.lock().unwrap();
        state.images.push(image.clone());
        state.events.push(format!("commit {} {}", container_id, image));
        Ok(image)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.with_container(container_id, |c| c.removed = true)?;
        self.record(format!("remove {}", container_id));
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.images.retain(|i| i != image);
        state.events.push(format!("remove_image {}", image));
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageMetadata> {
        match self.state.lock().unwrap().image_labels.clone() {
            Some(metadata) => Ok(ImageMetadata {
                name: image.to_string(),
                ..metadata
            }),
            None => bail!("No such image: {}", image),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| !c.removed && !c.killed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Fixture configuration with a dummy guest runner under `dir` and a watch
/// loop that schedules exactly once per cycle
pub fn fixture_config(dir: &std::path::Path) -> crate::config::FixtureConfig {
    let testrunner = dir.join("container_testrunner");
    std::fs::write(&testrunner, b"#!/bin/sh\n").unwrap();
    crate::config::FixtureConfig {
        container_testrunner: testrunner,
        watch_loop_duration_secs: 0,
        watch_retry_delay_secs: 0,
        watch_poll_interval_secs: 0,
        ..Default::default()
    }
}

/// Version-controlled submission at `<root>/<name>`
pub fn git_submission(root: &std::path::Path, name: &str, commit: &str) -> Submission {
    Submission::from_parts(
        name,
        root.join(name),
        SubmissionMeta {
            git: Some(GitInfo {
                branch: Some("main".to_string()),
                commit: commit.to_string(),
                date: None,
            }),
            ..Default::default()
        },
    )
}

/// In-memory [`SubmissionSource`] whose updates can be made to fail
#[derive(Default)]
pub struct FakeSource {
    submissions: Mutex<Vec<Submission>>,
    fail_updates: AtomicBool,
    update_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(submissions: Vec<Submission>) -> Self {
        Self {
            submissions: Mutex::new(submissions),
            ..Default::default()
        }
    }

    pub fn add(&self, submission: Submission) {
        self.submissions.lock().unwrap().push(submission);
    }

    pub fn set_commit(&self, shortname: &str, commit: &str) {
        let mut submissions = self.submissions.lock().unwrap();
        for submission in submissions.iter_mut() {
            if submission.shortname() == shortname {
                let root = submission.path().parent().unwrap().to_path_buf();
                *submission = git_submission(&root, shortname, commit);
            }
        }
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubmissionSource for FakeSource {
    async fn discover(&self) -> Result<Vec<Submission>> {
        Ok(self.submissions.lock().unwrap().clone())
    }

    async fn update(&self, submission: &Submission) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("git pull failed for {}", submission.shortname());
        }
        Ok(())
    }
}

/// [`MemoryStore`] whose writes for one run can be made to fail, as if the
/// record vanished from the database
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_summaries: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_summaries(&self) {
        self.fail_summaries.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultStore for FailingStore {
    async fn create_multirun(&self, multirun: &NewMultiRun) -> StoreResult<MultiRunId> {
        self.inner.create_multirun(multirun).await
    }

    async fn record_build(&self, id: MultiRunId, outcome: &BuildOutcome) -> StoreResult<()> {
        self.inner.record_build(id, outcome).await
    }

    async fn close_multirun(
        &self,
        id: MultiRunId,
        status: MultiRunStatus,
        elapsed: Duration,
    ) -> StoreResult<()> {
        self.inner.close_multirun(id, status, elapsed).await
    }

    async fn create_run(
        &self,
        multirun: MultiRunId,
        collection: &str,
        constraints: &RunConstraints,
    ) -> StoreResult<RunId> {
        self.inner.create_run(multirun, collection, constraints).await
    }

    async fn insert_test_summary(&self, run: RunId, summary: &TestSummary) -> StoreResult<()> {
        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(StoreError::UnknownRun(run));
        }
        self.inner.insert_test_summary(run, summary).await
    }

    async fn insert_test_failure(&self, run: RunId, failure: &TestFailure) -> StoreResult<()> {
        self.inner.insert_test_failure(run, failure).await
    }

    async fn close_run(&self, run: RunId, closure: &RunClosure) -> StoreResult<()> {
        self.inner.close_run(run, closure).await
    }

    async fn most_recent_tested_revision(&self, submission: &str) -> StoreResult<Option<String>> {
        self.inner.most_recent_tested_revision(submission).await
    }

    async fn cumulative_pipeline_time(&self) -> StoreResult<HashMap<String, f64>> {
        self.inner.cumulative_pipeline_time().await
    }

    async fn get_multirun(&self, id: MultiRunId) -> StoreResult<Option<MultiRunRecord>> {
        self.inner.get_multirun(id).await
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<RunRecord>> {
        self.inner.get_run(id).await
    }
}
