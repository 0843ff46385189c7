use thiserror::Error;

/// Errors that make the runner refuse to start. Never retried.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("memory/process limits allow no concurrent run at all (host {host_memory_mib} MiB, {usage_percent}% usable, {per_run_memory_mib} MiB per run, max {max_processes} processes)")]
    NoConcurrency {
        host_memory_mib: u64,
        usage_percent: f64,
        per_run_memory_mib: u64,
        max_processes: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Collection error: {0}")]
    Collection(#[from] gauntlet_common::types::CollectionError),
}
