/// Resource Budget
///
/// Turns host capacity and configured limits into the number of submissions
/// that may run side by side, and collection reference runtimes into time
/// allowances. Everything here is pure except [`host_memory_mib`].

use crate::error::RunnerError;
use anyhow::{Context, Result};
use std::time::Duration;

/// Maximum number of concurrently running containers.
///
/// `min(floor(round(host * usage / 100) / per_run), max_processes)`; a result
/// of zero is a configuration error, the runner must never start without a
/// single worker slot.
pub fn concurrency(
    host_memory_mib: u64,
    usage_percent: f64,
    per_run_memory_mib: u64,
    max_processes: usize,
) -> Result<usize, RunnerError> {
    if per_run_memory_mib == 0 {
        return Err(RunnerError::InvalidConfig(
            "per-run memory limit must be non-zero".to_string(),
        ));
    }

    let usable_mib = (host_memory_mib as f64 * usage_percent / 100.0).round().max(0.0) as u64;
    let by_ram = usize::try_from(usable_mib / per_run_memory_mib).unwrap_or(usize::MAX);
    let concurrent = by_ram.min(max_processes);

    tracing::debug!(
        host_memory_mib,
        usage_percent,
        usable_mib,
        per_run_memory_mib,
        by_ram,
        max_processes,
        concurrent,
        "Determined concurrent process count"
    );

    if concurrent < 1 {
        return Err(RunnerError::NoConcurrency {
            host_memory_mib,
            usage_percent,
            per_run_memory_mib,
            max_processes,
        });
    }
    Ok(concurrent)
}

/// Time a run may take, or `None` for no timeout at all.
///
/// Without a reference runtime or a scaling factor there is nothing to scale
/// against; that only happens for trusted reference submissions.
pub fn runtime_allowance(
    reference_runtime_secs: Option<f64>,
    minimum_allowance_secs: f64,
    scaling_factor: Option<f64>,
) -> Result<Option<Duration>, RunnerError> {
    match (reference_runtime_secs, scaling_factor) {
        (Some(reference), Some(factor)) => {
            seconds_to_duration(minimum_allowance_secs + reference * factor).map(Some)
        }
        _ => Ok(None),
    }
}

/// Negative, NaN and overflowing values are configuration errors
pub fn seconds_to_duration(secs: f64) -> Result<Duration, RunnerError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| RunnerError::InvalidConfig(format!("unusable duration {}s: {}", secs, e)))
}

/// Total host memory in MiB, from `/proc/meminfo`
pub async fn host_memory_mib() -> Result<u64> {
    let meminfo = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("Failed to read /proc/meminfo")?;
    parse_meminfo_total_mib(&meminfo).context("No MemTotal entry in /proc/meminfo")
}

fn parse_meminfo_total_mib(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib / 1024)
}
