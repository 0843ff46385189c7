/// Test Runner - every submission through the orchestrator under the main gate

use crate::executor::SubmissionOrchestrator;
use crate::gate::ConcurrencyGate;
use crate::submission::Submission;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

/// Outcome of one [`TestRunner::run`] batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    /// Submissions whose orchestration returned an error or panicked
    pub failed: usize,
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

fn lock(set: &InFlightSet) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes its submission from the in-flight set however the task ends
struct InFlight {
    set: InFlightSet,
    shortname: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.shortname);
    }
}

#[derive(Clone)]
pub struct TestRunner {
    orchestrator: Arc<SubmissionOrchestrator>,
    gate: ConcurrencyGate,
    in_flight: InFlightSet,
}

impl TestRunner {
    pub fn new(orchestrator: Arc<SubmissionOrchestrator>, max_parallel: usize) -> Self {
        let gate = ConcurrencyGate::with_error_callback(
            max_parallel,
            Arc::new(|e: &anyhow::Error| {
                error!(error = %format!("{:#}", e), "Submission orchestration failed");
            }),
        );
        Self {
            orchestrator,
            gate,
            in_flight: Default::default(),
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Submitted and not yet finished, including waiting for a slot
    pub fn is_in_flight(&self, shortname: &str) -> bool {
        lock(&self.in_flight).contains(shortname)
    }

    /// Queue one submission; suspends while the gate is full
    pub async fn submit(&self, submission: Submission) {
        lock(&self.in_flight).insert(submission.shortname().to_string());
        let marker = InFlight {
            set: self.in_flight.clone(),
            shortname: submission.shortname().to_string(),
        };
        let orchestrator = self.orchestrator.clone();
        self.gate
            .submit(async move {
                let _marker = marker;
                orchestrator.run_submission(&submission).await?;
                Ok(())
            })
            .await;
    }

    /// Test all submissions and wait for every one of them to finish
    pub async fn run(&self, submissions: Vec<Submission>) -> BatchReport {
        let failed_before = self.gate.exception_count();
        let submitted = submissions.len();
        info!(
            submissions = submitted,
            max_parallel = self.gate.max_parallel(),
            "Testing batch of submissions"
        );

        for submission in submissions {
            self.submit(submission).await;
        }
        self.gate.wait().await;

        let report = BatchReport {
            submitted,
            failed: self.gate.exception_count() - failed_before,
        };
        info!(submitted = report.submitted, failed = report.failed, "Batch finished");
        report
    }
}
