/// Domain Types - collections, multiruns, runs and their summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type MultiRunId = u64;
pub type RunId = u64;
pub type TestcaseId = u64;

/// Auxiliary service container that must be reachable under a network alias
/// while a collection runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Network alias -> dependency container
pub type DependencyMap = BTreeMap<String, DependencySpec>;

/// Host view of a testcase. Carries the expected answer and must never be
/// serialized into a container; use [`Testcase::guest_view`] for that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testcase {
    pub id: TestcaseId,
    pub action: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_reply: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyMap>,
}

/// The part of a testcase that is safe to hand to untrusted code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestTestcase<'a> {
    pub action: &'a str,
    pub arguments: &'a Value,
}

impl Testcase {
    pub fn guest_view(&self) -> GuestTestcase<'_> {
        GuestTestcase {
            action: &self.action,
            arguments: &self.arguments,
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("failed to read collection file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse collection file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("collection '{collection}' declares dependency '{alias}' with conflicting definitions")]
    IncompatibleDependency { collection: String, alias: String },

    #[error("collection '{collection}' contains testcase id {id} more than once")]
    DuplicateTestcase { collection: String, id: TestcaseId },

    #[error("collection '{collection}' has invalid reference runtime {secs}s")]
    InvalidReferenceRuntime { collection: String, secs: f64 },
}

/// Upper bound for any configured or measured duration, one week
pub const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Finite, non-negative and at most [`MAX_DURATION_SECS`]
pub fn is_sane_duration_secs(secs: f64) -> bool {
    secs.is_finite() && (0.0..=MAX_DURATION_SECS).contains(&secs)
}

/// On-disk representation of a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFile {
    pub name: String,
    #[serde(default)]
    pub reference_runtime_secs: Option<f64>,
    pub testcases: Vec<Testcase>,
}

/// Named, ordered set of testcases that are executed together in one run.
#[derive(Debug, Clone)]
pub struct TestcaseCollection {
    name: String,
    reference_runtime_secs: Option<f64>,
    testcases: Vec<Testcase>,
    index: HashMap<TestcaseId, usize>,
    dependencies: DependencyMap,
}

impl TestcaseCollection {
    pub fn new(
        name: impl Into<String>,
        reference_runtime_secs: Option<f64>,
        mut testcases: Vec<Testcase>,
    ) -> Result<Self, CollectionError> {
        let name = name.into();
        if let Some(secs) = reference_runtime_secs.filter(|s| !is_sane_duration_secs(*s)) {
            return Err(CollectionError::InvalidReferenceRuntime {
                collection: name,
                secs,
            });
        }
        testcases.sort_by(|a, b| (&a.action, a.id).cmp(&(&b.action, b.id)));

        let mut index = HashMap::with_capacity(testcases.len());
        let mut dependencies = DependencyMap::new();
        for (pos, testcase) in testcases.iter().enumerate() {
            if index.insert(testcase.id, pos).is_some() {
                return Err(CollectionError::DuplicateTestcase {
                    collection: name,
                    id: testcase.id,
                });
            }
            for (alias, spec) in testcase.dependencies.iter().flatten() {
                match dependencies.get(alias) {
                    Some(existing) if existing != spec => {
                        return Err(CollectionError::IncompatibleDependency {
                            collection: name,
                            alias: alias.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        dependencies.insert(alias.clone(), spec.clone());
                    }
                }
            }
        }

        Ok(Self {
            name,
            reference_runtime_secs,
            testcases,
            index,
            dependencies,
        })
    }

    pub fn load(path: &Path) -> Result<Self, CollectionError> {
        let content = fs::read_to_string(path).map_err(|source| CollectionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CollectionFile =
            serde_json::from_str(&content).map_err(|source| CollectionError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(file.name, file.reference_runtime_secs, file.testcases)
    }

    pub fn save(&self, path: &Path) -> Result<(), CollectionError> {
        let file = CollectionFile {
            name: self.name.clone(),
            reference_runtime_secs: self.reference_runtime_secs,
            testcases: self.testcases.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|source| CollectionError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(|source| CollectionError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference_runtime_secs(&self) -> Option<f64> {
        self.reference_runtime_secs
    }

    /// Ignores values that [`TestcaseCollection::new`] would reject
    pub fn set_reference_runtime_secs(&mut self, secs: f64) -> bool {
        if !is_sane_duration_secs(secs) {
            return false;
        }
        self.reference_runtime_secs = Some(secs);
        true
    }

    pub fn len(&self) -> usize {
        self.testcases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.testcases.is_empty()
    }

    pub fn contains(&self, id: TestcaseId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: TestcaseId) -> Option<&Testcase> {
        self.index.get(&id).map(|&pos| &self.testcases[pos])
    }

    /// Returns false if the id is unknown
    pub fn set_correct_reply(&mut self, id: TestcaseId, reply: Value) -> bool {
        match self.index.get(&id) {
            Some(&pos) => {
                self.testcases[pos].correct_reply = Some(reply);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Testcase> {
        self.testcases.iter()
    }

    pub fn dependencies(&self) -> &DependencyMap {
        &self.dependencies
    }

    /// Guest views keyed by the stringified testcase id
    pub fn guest_testcases(&self) -> BTreeMap<String, GuestTestcase<'_>> {
        self.testcases
            .iter()
            .map(|tc| (tc.id.to_string(), tc.guest_view()))
            .collect()
    }
}

impl fmt::Display for TestcaseCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} TCs)", self.name, self.testcases.len())
    }
}

/// Judgment for a single testcase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Indeterminate,
    NoAnswer,
}

impl Verdict {
    pub const ALL: [Verdict; 4] = [
        Verdict::Pass,
        Verdict::Fail,
        Verdict::Indeterminate,
        Verdict::NoAnswer,
    ];
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Indeterminate => "indeterminate",
            Verdict::NoAnswer => "no_answer",
        };
        f.write_str(s)
    }
}

/// Aggregated verdict counts of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub pass: usize,
    pub fail: usize,
    pub indeterminate: usize,
    pub no_answer: usize,
}

impl TestSummary {
    pub fn count(&self, verdict: Verdict) -> usize {
        match verdict {
            Verdict::Pass => self.pass,
            Verdict::Fail => self.fail,
            Verdict::Indeterminate => self.indeterminate,
            Verdict::NoAnswer => self.no_answer,
        }
    }

    pub fn add(&mut self, verdict: Verdict, n: usize) {
        let slot = match verdict {
            Verdict::Pass => &mut self.pass,
            Verdict::Fail => &mut self.fail,
            Verdict::Indeterminate => &mut self.indeterminate,
            Verdict::NoAnswer => &mut self.no_answer,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.indeterminate + self.no_answer
    }
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Verdict::ALL
            .iter()
            .filter(|v| self.count(**v) > 0)
            .map(|v| format!("{} {}", self.count(*v), v))
            .collect();
        if parts.is_empty() {
            f.write_str("no testcases")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Detail record for a failing or indeterminate testcase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub testcase_id: TestcaseId,
    pub verdict: Verdict,
    pub action: String,
    pub arguments: Value,
    #[serde(default)]
    pub expected_reply: Option<Value>,
    pub received_reply: Value,
}

/// Terminal classification of a container invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Finished,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Aborted,
    Terminated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl From<ExecutionStatus> for RunStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Finished => RunStatus::Finished,
            ExecutionStatus::Failed => RunStatus::Failed,
            ExecutionStatus::Terminated => RunStatus::Terminated,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiRunStatus {
    Running,
    BuildFailed,
    Finished,
    /// Stopped by an infrastructure or store error; the revision counts as
    /// untested
    Aborted,
}

impl MultiRunStatus {
    /// Whether closing with this status marks the revision as tested
    pub fn is_result(&self) -> bool {
        matches!(self, MultiRunStatus::Finished | MultiRunStatus::BuildFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildConstraints {
    pub runtime_allowance_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunConstraints {
    pub runtime_allowance_secs: Option<f64>,
    pub max_permissible_ram_mib: u64,
}

/// OCI labels of the base image a multirun was built on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub name: String,
    pub source: Option<String>,
    pub revision: Option<String>,
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMultiRun {
    pub submission: String,
    pub revision: Option<String>,
    pub build_constraints: BuildConstraints,
    pub image: Option<ImageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub status: RunStatus,
    pub runtime_secs: f64,
    #[serde(default)]
    pub error_details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunClosure {
    pub status: RunStatus,
    pub runtime_secs: Option<f64>,
    #[serde(default)]
    pub error_details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiRunRecord {
    pub id: MultiRunId,
    pub submission: String,
    pub revision: Option<String>,
    pub status: MultiRunStatus,
    pub build: Option<BuildOutcome>,
    pub build_constraints: BuildConstraints,
    pub image: Option<ImageMetadata>,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: Option<f64>,
    #[serde(default)]
    pub run_ids: Vec<RunId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub multirun_id: MultiRunId,
    pub collection: String,
    pub constraints: RunConstraints,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub runtime_secs: Option<f64>,
    #[serde(default)]
    pub error_details: Option<Value>,
    pub summary: Option<TestSummary>,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
}
