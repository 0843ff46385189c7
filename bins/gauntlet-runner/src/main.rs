mod budget;
mod config;
mod docker;
mod engine;
mod error;
mod evaluator;
mod executor;
mod gate;
mod reference;
mod runner;
mod submission;
mod watch;

#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::FixtureConfig;
use docker::{ContainerEngine, DockerEngine};
use error::RunnerError;
use executor::{Callbacks, SubmissionOrchestrator};
use gauntlet_common::config::StoreConfig;
use gauntlet_common::redis::RedisStore;
use gauntlet_common::store::{MemoryStore, ResultStore};
use gauntlet_common::types::TestcaseCollection;
use reference::ReferenceRecorder;
use runner::TestRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use submission::{DirectorySource, Submission};
use tokio::signal;
use tracing::{error, info, warn};
use watch::{WatchScheduler, WatchSettings};

#[derive(Parser)]
#[command(name = "gauntlet-runner")]
#[command(about = "Gauntlet - build and test untrusted submissions in containers", long_about = None)]
struct Cli {
    /// Fixture configuration file (defaults to config/fixture.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep results in memory instead of Redis
    #[arg(long, global = true, default_value = "false")]
    memory_store: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test the given submissions once and exit
    Run {
        /// Testcase collection file, may be repeated
        #[arg(short = 'C', long = "collection", required = true)]
        collections: Vec<PathBuf>,

        /// Submission directories
        #[arg(required = true)]
        submissions: Vec<PathBuf>,
    },

    /// Keep re-testing submissions whenever their repository changes
    Watch {
        /// Testcase collection file, may be repeated
        #[arg(short = 'C', long = "collection", required = true)]
        collections: Vec<PathBuf>,

        /// Submission directories (git checkouts)
        #[arg(required = true)]
        submissions: Vec<PathBuf>,
    },

    /// Measure collection runtimes with a trusted reference submission
    Reference {
        /// Testcase collection file, may be repeated
        #[arg(short = 'C', long = "collection", required = true)]
        collections: Vec<PathBuf>,

        /// Write runtimes and adopted answers back into the collection files
        #[arg(long, default_value = "false")]
        commit: bool,

        /// Reference submission directory
        submission: PathBuf,
    },

    /// Kill every container started by any gauntlet runner on this host
    Scram,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect().context("Failed to connect to Docker")?);

    if let Commands::Scram = cli.command {
        engine::scram(engine.as_ref()).await?;
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => FixtureConfig::load(path),
        None => FixtureConfig::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load fixture configuration: {:#}", e);
        error!("Make sure config/fixture.json exists or pass --config");
        e
    })?;
    let config = Arc::new(config);

    let store = open_store(cli.memory_store).await?;

    match cli.command {
        Commands::Run {
            collections,
            submissions,
        } => {
            let runner = build_runner(engine, store, config.clone(), &collections).await?;
            let submissions = load_submissions(&submissions).await?;
            let report = runner.run(submissions).await;
            if report.failed > 0 {
                bail!("{} of {} submissions could not be tested", report.failed, report.submitted);
            }
        }
        Commands::Watch {
            collections,
            submissions,
        } => {
            let runner = build_runner(engine, store.clone(), config.clone(), &collections).await?;
            let source = Arc::new(DirectorySource::new(submissions));
            let scheduler =
                WatchScheduler::new(source, runner, store, WatchSettings::from(config.as_ref()));

            let shutdown = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                warn!("Received shutdown signal, stopping watch loop...");
            };

            tokio::select! {
                result = scheduler.watch() => result?,
                _ = shutdown => {
                    info!(
                        pending = scheduler.runner().gate().pending(),
                        "Waiting for in-flight submissions"
                    );
                    scheduler.runner().gate().wait().await;
                }
            }
        }
        Commands::Reference {
            collections,
            commit,
            submission,
        } => {
            let submission = Submission::load(&submission).await?;
            let recorder = ReferenceRecorder::new(engine, store, config);
            for report in recorder.record(&submission, &collections, commit).await? {
                info!(
                    collection = %report.collection,
                    status = %report.status,
                    runtime_secs = report.runtime_secs,
                    confirmed = report.confirmed,
                    adopted = report.adopted,
                    mismatched = report.mismatched,
                    committed = report.committed,
                    "Reference result"
                );
            }
        }
        Commands::Scram => {}
    }

    info!("Gauntlet runner shutdown complete");
    Ok(())
}

async fn open_store(in_memory: bool) -> Result<Arc<dyn ResultStore>> {
    if in_memory {
        warn!("Using in-memory result store, results are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store_config = StoreConfig::from_env();
    let store = RedisStore::connect(&store_config)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", store_config.redis_url))?;
    info!("Connected to Redis: {}", store_config.redis_url);
    Ok(Arc::new(store))
}

fn load_collections(paths: &[PathBuf]) -> Result<Vec<TestcaseCollection>, RunnerError> {
    let collections = paths
        .iter()
        .map(|path| TestcaseCollection::load(path))
        .collect::<Result<Vec<_>, _>>()?;
    for collection in &collections {
        info!("Loaded collection {}", collection);
    }
    Ok(collections)
}

async fn load_submissions(paths: &[PathBuf]) -> Result<Vec<Submission>> {
    let mut submissions = Vec::with_capacity(paths.len());
    for path in paths {
        submissions.push(Submission::load(path).await?);
    }
    Ok(submissions)
}

async fn build_runner(
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn ResultStore>,
    config: Arc<FixtureConfig>,
    collection_files: &[PathBuf],
) -> Result<TestRunner> {
    let collections = load_collections(collection_files)?;
    check_testrunner(&config.container_testrunner)?;

    let host_memory_mib = budget::host_memory_mib().await?;
    let max_parallel = budget::concurrency(
        host_memory_mib,
        config.host_memory_usage_percent,
        config.max_memory_mib,
        config.max_concurrent_processes,
    )?;
    info!(
        max_parallel,
        host_memory_mib,
        image = %config.docker_image,
        collections = collections.len(),
        "Runner configured"
    );

    let orchestrator = SubmissionOrchestrator::new(
        engine,
        store,
        config,
        Arc::new(collections),
        logging_callbacks(),
    );
    Ok(TestRunner::new(Arc::new(orchestrator), max_parallel))
}

fn check_testrunner(path: &Path) -> Result<(), RunnerError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RunnerError::InvalidConfig(format!(
            "container testrunner {} does not exist",
            path.display()
        )))
    }
}

fn logging_callbacks() -> Callbacks {
    let mut callbacks = Callbacks::default();
    callbacks.on_multirun_finished(|submission, multirun_id| {
        info!(submission = %submission.shortname(), multirun_id, "Results stored");
    });
    callbacks
}
