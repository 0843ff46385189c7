/// Container Lifecycle - one build or run container from creation to removal
///
/// **Core Responsibility:**
/// Create the subject container (plus its dependency containers), let hooks
/// populate it, start it, wait for it under a time allowance and classify how
/// it ended. Raw stdout/stderr are returned untouched.
///
/// **Boundary:**
/// - The lifecycle knows HOW containers are driven
/// - It does NOT interpret output, that is the evaluator's job
///
/// Classification:
/// - exit code 0 within the allowance → `Finished`
/// - allowance expired → `Terminated` (killed with zero grace, then reaped)
/// - any other exit → `Failed`

use crate::docker::{ContainerEngine, ContainerSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use gauntlet_common::types::{DependencyMap, DependencySpec, ExecutionStatus};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to wait for a killed container to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    /// Container names are `<name_prefix>_<random suffix>`
    pub name_prefix: String,
    pub image: String,
    pub command: Vec<String>,
    pub network: Option<String>,
    pub memory_limit_mib: Option<u64>,
    pub cpu_limit: Option<f64>,
    /// `None` waits forever
    pub timeout: Option<Duration>,
    pub dependencies: DependencyMap,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub runtime: Duration,
    pub error_details: Option<Value>,
    /// Whatever `after_exit` produced, e.g. the committed image
    pub post_result: Option<String>,
}

impl ExecutionResult {
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Extension points around the subject container
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs after creation and before start; used to inject files.
    async fn before_start(&self, _engine: &dyn ContainerEngine, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn after_exit(
        &self,
        _engine: &dyn ContainerEngine,
        _container_id: &str,
        _status: ExecutionStatus,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Force-removes the container when dropped unless it was released
/// explicitly. Covers error paths and cancelled futures.
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, container_id: String) -> Self {
        Self {
            engine,
            container_id: Some(container_id),
        }
    }

    fn id(&self) -> &str {
        self.container_id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.engine.remove_container(&id).await {
                warn!(container = %id, error = %e, "Failed to remove container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let engine = self.engine.clone();
        // Cannot await in Drop; best effort when a runtime is still around
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = engine.remove_container(&container_id).await {
                    warn!(container = %container_id, error = %e, "Failed to cleanup container");
                }
            });
        }
    }
}

pub fn container_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..12])
}

#[derive(Clone)]
pub struct ContainerLifecycle {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerLifecycle {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Drive one subject container to completion.
    ///
    /// `Err` means infrastructure trouble (daemon, hooks); a misbehaving
    /// guest always yields `Ok` with a non-`Finished` status. Dependency
    /// containers are torn down in both cases.
    pub async fn run(
        &self,
        request: &ContainerRequest,
        hooks: &dyn LifecycleHooks,
    ) -> Result<ExecutionResult> {
        let dependencies = self.start_dependencies(request).await?;
        let result = self.run_subject(request, hooks).await;
        self.teardown(dependencies).await;
        result
    }

    async fn run_subject(
        &self,
        request: &ContainerRequest,
        hooks: &dyn LifecycleHooks,
    ) -> Result<ExecutionResult> {
        let spec = ContainerSpec {
            name: container_name(&request.name_prefix),
            image: request.image.clone(),
            command: request.command.clone(),
            env: Vec::new(),
            network: request.network.clone(),
            network_alias: None,
            memory_limit_mib: request.memory_limit_mib,
            cpu_limit: request.cpu_limit,
        };

        let container_id = self
            .engine
            .create_container(&spec)
            .await
            .with_context(|| format!("Failed to create container from {}", request.image))?;
        let guard = ContainerGuard::new(self.engine.clone(), container_id);
        debug!(container = %spec.name, image = %request.image, "Container created");

        hooks
            .before_start(self.engine.as_ref(), guard.id())
            .await
            .context("Failed to populate container")?;

        let started = Instant::now();
        self.engine.start(guard.id()).await?;

        let (exit_code, timed_out) = match self.engine.wait_timeout(guard.id(), request.timeout).await? {
            Some(code) => (Some(code), false),
            None => {
                info!(
                    container = %spec.name,
                    timeout_secs = request.timeout.map(|t| t.as_secs_f64()),
                    "Container exceeded its time allowance, killing"
                );
                // The container may have exited on its own since the wait
                // gave up, in which case the kill is refused
                if let Err(e) = self.engine.stop(guard.id(), Duration::ZERO).await {
                    warn!(container = %spec.name, error = %e, "Failed to kill timed out container");
                }
                let code = self.engine.wait_timeout(guard.id(), Some(REAP_TIMEOUT)).await?;
                (code, true)
            }
        };
        let runtime = started.elapsed();

        let status = classify(exit_code, timed_out);
        let error_details = if timed_out {
            request
                .timeout
                .map(|t| json!({ "reason": "timeout", "allowance_secs": t.as_secs_f64() }))
        } else {
            None
        };
        debug!(container = %spec.name, ?exit_code, ?status, runtime_secs = runtime.as_secs_f64(), "Container exited");

        let post_result = hooks
            .after_exit(self.engine.as_ref(), guard.id(), status)
            .await?;

        let logs = self.engine.logs(guard.id()).await?;
        guard.release().await;

        Ok(ExecutionResult {
            stdout: logs.stdout,
            stderr: logs.stderr,
            status,
            exit_code,
            runtime,
            error_details,
            post_result,
        })
    }

    async fn start_dependencies(&self, request: &ContainerRequest) -> Result<Vec<ContainerGuard>> {
        if request.dependencies.is_empty() {
            return Ok(Vec::new());
        }

        let starts = request
            .dependencies
            .iter()
            .map(|(alias, dependency)| self.start_dependency(request, alias, dependency));
        let outcomes = join_all(starts).await;

        let mut started = Vec::new();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(guard) => started.push(guard),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            None => Ok(started),
            Some(e) => {
                self.teardown(started).await;
                Err(e.context("Failed to start dependency containers"))
            }
        }
    }

    async fn start_dependency(
        &self,
        request: &ContainerRequest,
        alias: &str,
        dependency: &DependencySpec,
    ) -> Result<ContainerGuard> {
        let spec = ContainerSpec {
            name: container_name(&format!("{}_{}", request.name_prefix, alias)),
            image: dependency.image.clone(),
            command: dependency.command.clone(),
            env: dependency
                .env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            network: request.network.clone(),
            network_alias: Some(alias.to_string()),
            memory_limit_mib: None,
            cpu_limit: None,
        };
        let id = self
            .engine
            .create_container(&spec)
            .await
            .with_context(|| format!("Failed to create dependency {}", alias))?;
        let guard = ContainerGuard::new(self.engine.clone(), id);
        self.engine
            .start(guard.id())
            .await
            .with_context(|| format!("Failed to start dependency {}", alias))?;
        debug!(alias, image = %dependency.image, "Dependency container started");
        Ok(guard)
    }

    async fn teardown(&self, guards: Vec<ContainerGuard>) {
        let stops = guards.into_iter().map(|guard| async move {
            if let Err(e) = self.engine.stop(guard.id(), Duration::ZERO).await {
                debug!(container = %guard.id(), error = %e, "Dependency already stopped");
            }
            guard.release().await;
        });
        join_all(stops).await;
    }
}

pub fn classify(exit_code: Option<i64>, timed_out: bool) -> ExecutionStatus {
    if timed_out {
        ExecutionStatus::Terminated
    } else if exit_code == Some(0) {
        ExecutionStatus::Finished
    } else {
        ExecutionStatus::Failed
    }
}

/// Emergency stop: kill every container this runner manages, all at once.
/// Returns how many containers were stopped.
pub async fn scram(engine: &dyn ContainerEngine) -> Result<usize> {
    let containers = engine
        .list_managed_containers()
        .await
        .context("Failed to list managed containers")?;
    warn!(containers = containers.len(), "Scram: killing all managed containers");

    let kills = containers.iter().map(|id| async move {
        let result = engine.stop(id, Duration::ZERO).await;
        if let Err(e) = &result {
            warn!(container = %id, error = %e, "Failed to kill container");
        }
        result.is_ok()
    });
    let stopped = join_all(kills).await.into_iter().filter(|ok| *ok).count();
    info!(stopped, "Scram finished");
    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, ScriptedExit};
    use std::collections::BTreeMap;

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(0), false), ExecutionStatus::Finished);
        assert_eq!(classify(Some(1), false), ExecutionStatus::Failed);
        assert_eq!(classify(Some(137), true), ExecutionStatus::Terminated);
        assert_eq!(classify(Some(0), true), ExecutionStatus::Terminated);
        assert_eq!(classify(None, false), ExecutionStatus::Failed);
    }

    #[test]
    fn test_container_name_unique() {
        let a = container_name("alice_build");
        let b = container_name("alice_build");
        assert!(a.starts_with("alice_build_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_finished_container_collects_logs_and_is_removed() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::code(0).stdout("hello\n"));
        let lifecycle = ContainerLifecycle::new(engine.clone());

        let request = ContainerRequest {
            name_prefix: "alice_build".to_string(),
            image: "base:latest".to_string(),
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = lifecycle.run(&request, &NoHooks).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Finished);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_text(), "hello\n");
        assert!(result.error_details.is_none());
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_then_reaps() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::hang().stdout("partial\n"));
        let lifecycle = ContainerLifecycle::new(engine.clone());

        let request = ContainerRequest {
            name_prefix: "bob_run".to_string(),
            image: "base:latest".to_string(),
            timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let result = lifecycle.run(&request, &NoHooks).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Terminated);
        assert_eq!(result.stdout_text(), "partial\n");
        assert_eq!(result.error_details.unwrap()["reason"], "timeout");
        let events = engine.events();
        let kill = events.iter().position(|e| e.starts_with("stop")).unwrap();
        let logs = events.iter().position(|e| e.starts_with("logs")).unwrap();
        assert!(kill < logs);
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::code(2));
        let lifecycle = ContainerLifecycle::new(engine);

        let result = lifecycle
            .run(&ContainerRequest::default(), &NoHooks)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_dependencies_started_before_and_removed_after() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::code(0));
        let lifecycle = ContainerLifecycle::new(engine.clone());

        let mut dependencies = BTreeMap::new();
        dependencies.insert(
            "db".to_string(),
            DependencySpec {
                image: "postgres:16".to_string(),
                command: vec![],
                env: BTreeMap::from([("POSTGRES_PASSWORD".to_string(), "x".to_string())]),
            },
        );
        let request = ContainerRequest {
            name_prefix: "carol_run".to_string(),
            image: "built:1".to_string(),
            network: Some("carol_net".to_string()),
            dependencies,
            ..Default::default()
        };
        lifecycle.run(&request, &NoHooks).await.unwrap();

        let created = engine.created_specs();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].image, "postgres:16");
        assert_eq!(created[0].network_alias.as_deref(), Some("db"));
        assert_eq!(created[0].env, vec!["POSTGRES_PASSWORD=x".to_string()]);
        assert_eq!(created[1].image, "built:1");
        assert_eq!(engine.live_containers(), 0);
    }

    struct FailingHooks;

    #[async_trait]
    impl LifecycleHooks for FailingHooks {
        async fn before_start(&self, _engine: &dyn ContainerEngine, _id: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn test_hook_failure_is_infrastructure_error_and_cleans_up() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::code(0));
        let lifecycle = ContainerLifecycle::new(engine.clone());

        let err = lifecycle
            .run(&ContainerRequest::default(), &FailingHooks)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));

        // The guard's cleanup is spawned from Drop
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if engine.live_containers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.live_containers(), 0);
        assert!(!engine.events().iter().any(|e| e.starts_with("start")));
    }

    #[tokio::test]
    async fn test_refused_kill_after_timeout_still_terminated() {
        let engine = Arc::new(FakeEngine::new());
        engine.script(ScriptedExit::hang().stdout("partial\n"));
        engine.fail_stops();
        let lifecycle = ContainerLifecycle::new(engine.clone());

        let request = ContainerRequest {
            timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let result = lifecycle.run(&request, &NoHooks).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Terminated);
        assert_eq!(result.stdout_text(), "partial\n");
        assert_eq!(result.error_details.unwrap()["reason"], "timeout");
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_scram_kills_every_running_container() {
        let engine = FakeEngine::new();
        for image in ["a:1", "b:1", "c:1"] {
            let spec = ContainerSpec {
                image: image.to_string(),
                ..Default::default()
            };
            let id = engine.create_container(&spec).await.unwrap();
            engine.start(&id).await.unwrap();
        }

        assert_eq!(scram(&engine).await.unwrap(), 3);
        assert!(engine.list_managed_containers().await.unwrap().is_empty());
        let kills = engine.events().iter().filter(|e| e.ends_with("grace=0")).count();
        assert_eq!(kills, 3);
        assert_eq!(scram(&engine).await.unwrap(), 0);
    }
}
