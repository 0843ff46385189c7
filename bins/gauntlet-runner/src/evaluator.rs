/// Result Protocol - judging a container's stdout
///
/// **Core Responsibility:**
/// Parse the newline-delimited JSON a guest prints and turn it into verdicts.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or persistence
/// - Every line is untrusted unless it carries the per-run control key in
///   field `"_"`; only such records can change the execution status or stop
///   the test clock
/// - Malformed lines are skipped, never fatal
///
/// **Judging Rules:**
/// - First answer per testcase id wins, later duplicates are ignored
/// - No `correct_reply` → Indeterminate; equal JSON → Pass; otherwise Fail
/// - Answers after the `time` control message are discarded
/// - Testcases never answered count as NoAnswer

use gauntlet_common::types::{
    ExecutionStatus, TestFailure, TestSummary, TestcaseCollection, TestcaseId, Verdict,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Field carrying the control key on trusted records
pub const CONTROL_FIELD: &str = "_";

/// Exception codes that mean the guest ran out of time or memory
const EXHAUSTION_CODES: [&str; 2] = ["exec_timeout", "exec_oom"];

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Exception { code: String, details: Option<Value> },
    /// The guest stopped its test clock
    Time,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Control(ControlMessage),
    Answer { id: TestcaseId, reply: Value },
}

/// Parse one stdout line. `None` for anything that is neither a trusted
/// control message nor a well-formed answer.
pub fn parse_line(line: &str, control_key: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Ok(Value::Object(mut record)) = serde_json::from_str::<Value>(line) else {
        debug!(line, "Skipping non-JSON-object output line");
        return None;
    };

    if record.get(CONTROL_FIELD).and_then(Value::as_str) == Some(control_key) {
        return parse_control(&mut record);
    }

    let id = record.get("id").and_then(parse_testcase_id)?;
    let reply = record.remove("reply")?;
    Some(Record::Answer { id, reply })
}

fn parse_control(record: &mut Map<String, Value>) -> Option<Record> {
    let kind = record.get("type").and_then(Value::as_str).map(str::to_string);
    let code = record.get("code").and_then(Value::as_str).map(str::to_string);

    match (kind.as_deref(), code) {
        (Some("time"), _) => Some(Record::Control(ControlMessage::Time)),
        (Some("exception"), Some(code)) | (None, Some(code)) => {
            Some(Record::Control(ControlMessage::Exception {
                code,
                details: record.remove("exception"),
            }))
        }
        (Some("exception"), None) => Some(Record::Control(ControlMessage::Exception {
            code: "unknown".to_string(),
            details: record.remove("exception"),
        })),
        _ => {
            warn!(kind = ?kind, "Ignoring unknown control message");
            None
        }
    }
}

fn parse_testcase_id(value: &Value) -> Option<TestcaseId> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}

/// Status after applying a guest-reported exception code
pub fn status_for_exception(code: &str) -> ExecutionStatus {
    if EXHAUSTION_CODES.contains(&code) {
        ExecutionStatus::Terminated
    } else {
        ExecutionStatus::Failed
    }
}

/// Trusted exception state shared by build and run evaluation
#[derive(Debug, Default)]
struct ExceptionTracker {
    first: Option<(String, Option<Value>)>,
}

impl ExceptionTracker {
    fn observe(&mut self, code: String, details: Option<Value>) {
        if self.first.is_none() {
            self.first = Some((code, details));
        } else {
            debug!(code, "Ignoring additional exception message");
        }
    }

    fn resolve(
        self,
        status: ExecutionStatus,
        error_details: Option<Value>,
    ) -> (ExecutionStatus, Option<Value>) {
        match self.first {
            None => (status, error_details),
            Some((code, details)) => {
                // Time exhaustion detected by the host stays Terminated
                let status = match status {
                    ExecutionStatus::Terminated => ExecutionStatus::Terminated,
                    _ => status_for_exception(&code),
                };
                let details = details.unwrap_or_else(|| json!({ "code": code }));
                (status, Some(details))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildEvaluation {
    pub status: ExecutionStatus,
    pub error_details: Option<Value>,
}

/// Build containers only report control messages
pub fn evaluate_build(
    stdout: &str,
    control_key: &str,
    status: ExecutionStatus,
    error_details: Option<Value>,
) -> BuildEvaluation {
    let mut exceptions = ExceptionTracker::default();
    for line in stdout.lines() {
        if let Some(Record::Control(ControlMessage::Exception { code, details })) =
            parse_line(line, control_key)
        {
            exceptions.observe(code, details);
        }
    }
    let (status, error_details) = exceptions.resolve(status, error_details);
    BuildEvaluation {
        status,
        error_details,
    }
}

#[derive(Debug, Clone)]
pub struct RunEvaluation {
    pub status: ExecutionStatus,
    pub error_details: Option<Value>,
    pub summary: TestSummary,
    /// First `failure_sample_size` Fail and Indeterminate cases each
    pub failures: Vec<TestFailure>,
    /// Accepted replies by testcase id
    pub replies: BTreeMap<TestcaseId, Value>,
}

/// Stateful judge for one run of one collection
pub struct TestEvaluator<'a> {
    collection: &'a TestcaseCollection,
    control_key: &'a str,
    sample_size: usize,
    summary: TestSummary,
    failures: Vec<TestFailure>,
    replies: BTreeMap<TestcaseId, Value>,
    exceptions: ExceptionTracker,
    time_stopped: bool,
}

impl<'a> TestEvaluator<'a> {
    pub fn new(collection: &'a TestcaseCollection, control_key: &'a str, sample_size: usize) -> Self {
        Self {
            collection,
            control_key,
            sample_size,
            summary: TestSummary::default(),
            failures: Vec::new(),
            replies: BTreeMap::new(),
            exceptions: ExceptionTracker::default(),
            time_stopped: false,
        }
    }

    pub fn feed(&mut self, stdout: &str) {
        for line in stdout.lines() {
            self.feed_line(line);
        }
    }

    pub fn feed_line(&mut self, line: &str) {
        match parse_line(line, self.control_key) {
            Some(Record::Control(ControlMessage::Time)) => {
                self.time_stopped = true;
            }
            Some(Record::Control(ControlMessage::Exception { code, details })) => {
                self.exceptions.observe(code, details);
            }
            Some(Record::Answer { id, reply }) => self.judge(id, reply),
            None => {}
        }
    }

    fn judge(&mut self, id: TestcaseId, reply: Value) {
        if self.time_stopped {
            debug!(testcase_id = id, "Discarding answer received after time stop");
            return;
        }
        let Some(testcase) = self.collection.get(id) else {
            warn!(testcase_id = id, collection = %self.collection.name(), "Answer for unknown testcase");
            return;
        };
        if self.replies.contains_key(&id) {
            debug!(testcase_id = id, "Ignoring duplicate answer");
            return;
        }

        let verdict = match &testcase.correct_reply {
            None => Verdict::Indeterminate,
            Some(expected) if *expected == reply => Verdict::Pass,
            Some(_) => Verdict::Fail,
        };
        self.summary.add(verdict, 1);

        if verdict != Verdict::Pass && self.summary.count(verdict) <= self.sample_size {
            self.failures.push(TestFailure {
                testcase_id: id,
                verdict,
                action: testcase.action.clone(),
                arguments: testcase.arguments.clone(),
                expected_reply: testcase.correct_reply.clone(),
                received_reply: reply.clone(),
            });
        }
        self.replies.insert(id, reply);
    }

    pub fn finish(self, status: ExecutionStatus, error_details: Option<Value>) -> RunEvaluation {
        let mut summary = self.summary;
        let judged = summary.total();
        summary.add(Verdict::NoAnswer, self.collection.len().saturating_sub(judged));

        let (status, error_details) = self.exceptions.resolve(status, error_details);
        RunEvaluation {
            status,
            error_details,
            summary,
            failures: self.failures,
            replies: self.replies,
        }
    }
}
