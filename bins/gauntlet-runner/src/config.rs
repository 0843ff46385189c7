/// Fixture Configuration - limits and paths for every container
///
/// Loaded once from JSON at startup and validated before any container is
/// started. Every field has a default, so a partial file is enough.

use crate::budget;
use crate::error::RunnerError;
use anyhow::{bail, Context, Result};
use gauntlet_common::types::{is_sane_duration_secs, MAX_DURATION_SECS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_REFERENCE_TIME_FACTOR: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixtureConfig {
    /// Image every build container starts from
    pub docker_image: String,
    /// Host path of the guest runner injected as `/container_testrunner`
    pub container_testrunner: PathBuf,
    pub max_memory_mib: u64,
    pub cpu_limit: Option<f64>,
    pub host_memory_usage_percent: f64,
    pub max_concurrent_processes: usize,
    pub max_build_time_secs: f64,
    pub minimum_testbatch_time_secs: f64,
    /// `null` disables run timeouts entirely
    pub reference_time_factor: Option<f64>,
    pub build_name: String,
    pub solution_name: String,
    pub allow_network: bool,
    pub failure_sample_size: usize,
    pub git_update_parallelism: usize,
    pub watch_loop_duration_secs: u64,
    pub watch_retry_delay_secs: u64,
    pub watch_poll_interval_secs: u64,
    /// Repository name for committed build images
    pub image_repository: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            docker_image: "gauntlet-testrunner:latest".to_string(),
            container_testrunner: PathBuf::from("container/container_testrunner"),
            max_memory_mib: 1024,
            cpu_limit: None,
            host_memory_usage_percent: 100.0,
            max_concurrent_processes: 8,
            max_build_time_secs: 30.0,
            minimum_testbatch_time_secs: 1.0,
            reference_time_factor: Some(10.0),
            build_name: "build".to_string(),
            solution_name: "solution".to_string(),
            allow_network: false,
            failure_sample_size: 10,
            git_update_parallelism: 8,
            watch_loop_duration_secs: 60,
            watch_retry_delay_secs: 10,
            watch_poll_interval_secs: 1,
            image_repository: "gauntlet_testrun".to_string(),
        }
    }
}

impl FixtureConfig {
    /// Load fixture configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Fixture config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: FixtureConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default path (config/fixture.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/fixture.json"))
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.max_memory_mib == 0 {
            return Err(RunnerError::InvalidConfig(
                "max_memory_mib must be non-zero".to_string(),
            ));
        }
        if !(self.host_memory_usage_percent > 0.0 && self.host_memory_usage_percent <= 100.0) {
            return Err(RunnerError::InvalidConfig(format!(
                "host_memory_usage_percent must be in (0, 100], got {}",
                self.host_memory_usage_percent
            )));
        }
        if self.max_concurrent_processes == 0 {
            return Err(RunnerError::InvalidConfig(
                "max_concurrent_processes must be non-zero".to_string(),
            ));
        }
        if self.failure_sample_size == 0 {
            return Err(RunnerError::InvalidConfig(
                "failure_sample_size must be non-zero".to_string(),
            ));
        }
        for (name, secs) in [
            ("max_build_time_secs", self.max_build_time_secs),
            ("minimum_testbatch_time_secs", self.minimum_testbatch_time_secs),
        ] {
            if !is_sane_duration_secs(secs) {
                return Err(RunnerError::InvalidConfig(format!(
                    "{} must be between 0 and {} seconds, got {}",
                    name, MAX_DURATION_SECS, secs
                )));
            }
        }
        if let Some(factor) = self.reference_time_factor {
            if !(factor.is_finite() && factor > 0.0 && factor <= MAX_REFERENCE_TIME_FACTOR) {
                return Err(RunnerError::InvalidConfig(format!(
                    "reference_time_factor must be in (0, {}], got {}",
                    MAX_REFERENCE_TIME_FACTOR, factor
                )));
            }
        }
        if self.git_update_parallelism == 0 {
            return Err(RunnerError::InvalidConfig(
                "git_update_parallelism must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_build_time(&self) -> Result<Duration, RunnerError> {
        budget::seconds_to_duration(self.max_build_time_secs)
    }

    pub fn watch_loop_duration(&self) -> Duration {
        Duration::from_secs(self.watch_loop_duration_secs)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_secs(self.watch_retry_delay_secs)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch_poll_interval_secs)
    }
}
