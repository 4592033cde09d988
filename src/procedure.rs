//! Automated test procedures.
//!
//! A [`TestProcedure`] is an ordered list of telecommand invocations, each
//! paired with an [`Expectation`] over the response. [`run_procedure`]
//! executes the steps strictly one after another on a single transport
//! session, applies the procedure's abort policy, and produces an immutable
//! [`ProcedureReport`].
//!
//! Expectations are data, not control flow: a failed or even panicking
//! custom predicate marks the step `Failed` and never takes the
//! orchestrator down.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::TcmdId;
use crate::command::ArgValue;
use crate::session::{CancelToken, ResponseRecord, SerialChannel, TransportSession};

/// What to do with the remaining steps after a step does not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortPolicy {
    /// Run every step regardless and report all results.
    ContinueOnFailure,
    /// Stop at the first non-passing step; the rest are recorded `Skipped`.
    AbortOnFailure,
}

/// How a step refers to its telecommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcmdRef {
    ById(TcmdId),
    ByName(String),
}

impl fmt::Display for TcmdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcmdRef::ById(id) => write!(f, "{id}"),
            TcmdRef::ByName(name) => write!(f, "{name}"),
        }
    }
}

/// Assertion over the step's [`ResponseRecord`].
#[derive(Clone)]
pub enum Expectation {
    /// The response is a success; fields are not inspected.
    Success,
    /// The response is a success with exactly these fields.
    FieldsEqual(Vec<ArgValue>),
    /// The response is a success with this many fields.
    FieldCount(usize),
    /// The remote rejects the command with this status code.
    RejectedWithCode(u8),
    /// The remote never answers (all retries exhausted).
    Unresponsive,
    /// Arbitrary predicate over the record. Evaluated inside
    /// `catch_unwind`: a panic counts as a failed assertion.
    Custom(Arc<dyn Fn(&ResponseRecord) -> bool + Send + Sync>),
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Success => write!(f, "Success"),
            Expectation::FieldsEqual(fields) => f.debug_tuple("FieldsEqual").field(fields).finish(),
            Expectation::FieldCount(n) => f.debug_tuple("FieldCount").field(n).finish(),
            Expectation::RejectedWithCode(code) => {
                f.debug_tuple("RejectedWithCode").field(code).finish()
            }
            Expectation::Unresponsive => write!(f, "Unresponsive"),
            Expectation::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Expectation {
    /// Evaluate against a response record. Never panics outward.
    fn holds(&self, record: &ResponseRecord) -> bool {
        match self {
            Expectation::Success => record.is_success(),
            Expectation::FieldsEqual(expected) => match record {
                ResponseRecord::Success { fields } => fields == expected,
                _ => false,
            },
            Expectation::FieldCount(count) => match record {
                ResponseRecord::Success { fields } => fields.len() == *count,
                _ => false,
            },
            Expectation::RejectedWithCode(code) => {
                matches!(record, ResponseRecord::Rejected { code: got, .. } if got == code)
            }
            Expectation::Unresponsive => {
                matches!(record, ResponseRecord::Unresponsive { .. })
            }
            Expectation::Custom(predicate) => {
                let predicate = Arc::clone(predicate);
                catch_unwind(AssertUnwindSafe(|| predicate(record))).unwrap_or(false)
            }
        }
    }
}

/// One step: which telecommand, with which arguments, expecting what.
#[derive(Debug, Clone)]
pub struct TestStep {
    pub name: String,
    pub target: TcmdRef,
    pub args: Vec<ArgValue>,
    pub expect: Expectation,
}

impl TestStep {
    pub fn new(name: impl Into<String>, target: TcmdRef, args: Vec<ArgValue>) -> Self {
        Self {
            name: name.into(),
            target,
            args,
            expect: Expectation::Success,
        }
    }

    pub fn expecting(mut self, expect: Expectation) -> Self {
        self.expect = expect;
        self
    }
}

/// An ordered, assertion-bearing sequence of invocations.
#[derive(Debug, Clone)]
pub struct TestProcedure {
    pub name: String,
    pub policy: AbortPolicy,
    pub steps: Vec<TestStep>,
}

impl TestProcedure {
    pub fn new(name: impl Into<String>, policy: AbortPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: TestStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// Terminal state of one executed (or skipped) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// Outcome of one step, including the response for post-mortem inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    /// The invocation outcome, when the step actually ran.
    pub response: Option<ResponseRecord>,
    /// Human-readable failure detail.
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// Immutable aggregate of one procedure run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureReport {
    pub procedure: String,
    pub results: Vec<StepResult>,
    pub passed: usize,
    /// Index of the first non-passing step, if any.
    pub first_failure: Option<usize>,
    pub duration_ms: u64,
}

impl ProcedureReport {
    pub fn all_passed(&self) -> bool {
        self.first_failure.is_none()
    }
}

/// Execute a procedure's steps sequentially over one transport session.
///
/// The orchestrator is purely a consumer of `invoke`: it never touches the
/// catalog or the session configuration. Cancellation marks the running
/// step `Failed` and the remainder `Skipped`.
pub async fn run_procedure<C: SerialChannel>(
    procedure: &TestProcedure,
    session: &TransportSession<C>,
    cancel: &CancelToken,
) -> ProcedureReport {
    info!(
        procedure = %procedure.name,
        steps = procedure.steps.len(),
        policy = ?procedure.policy,
        "starting procedure"
    );
    let started = Instant::now();
    let mut results = Vec::with_capacity(procedure.steps.len());
    let mut aborted = false;

    for step in &procedure.steps {
        if aborted {
            results.push(StepResult {
                name: step.name.clone(),
                status: StepStatus::Skipped,
                response: None,
                detail: None,
                duration_ms: 0,
            });
            continue;
        }

        let result = run_step(step, session, cancel).await;
        let stop_here = result.status != StepStatus::Passed
            && (procedure.policy == AbortPolicy::AbortOnFailure
                || matches!(result.response, Some(ResponseRecord::Cancelled)));
        if result.status == StepStatus::Passed {
            debug!(step = %step.name, "step passed");
        } else {
            warn!(step = %step.name, status = ?result.status, "step did not pass");
        }
        results.push(result);
        if stop_here {
            aborted = true;
        }
    }

    let passed = results
        .iter()
        .filter(|r| r.status == StepStatus::Passed)
        .count();
    let first_failure = results.iter().position(|r| r.status != StepStatus::Passed);
    let report = ProcedureReport {
        procedure: procedure.name.clone(),
        results,
        passed,
        first_failure,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        procedure = %report.procedure,
        passed = report.passed,
        total = report.results.len(),
        "procedure finished"
    );
    report
}

async fn run_step<C: SerialChannel>(
    step: &TestStep,
    session: &TransportSession<C>,
    cancel: &CancelToken,
) -> StepResult {
    let started = Instant::now();
    let outcome = match &step.target {
        TcmdRef::ById(id) => session.invoke(*id, &step.args, cancel).await,
        TcmdRef::ByName(name) => session.invoke_by_name(name, &step.args, cancel).await,
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(record) => {
            let (status, detail) = if step.expect.holds(&record) {
                (StepStatus::Passed, None)
            } else if matches!(record, ResponseRecord::Unresponsive { .. }) {
                (
                    StepStatus::TimedOut,
                    Some(format!("{} did not respond", step.target)),
                )
            } else {
                (
                    StepStatus::Failed,
                    Some(format!("expectation {:?} not met", step.expect)),
                )
            };
            StepResult {
                name: step.name.clone(),
                status,
                response: Some(record),
                detail,
                duration_ms,
            }
        }
        // Caller errors (bad arguments, unknown telecommand) fail the step,
        // never the orchestrator.
        Err(err) => StepResult {
            name: step.name.clone(),
            status: StepStatus::Failed,
            response: None,
            detail: Some(err.to_string()),
            duration_ms,
        },
    }
}
