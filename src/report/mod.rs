//! Result translation.
//!
//! Turns engine outcomes into protocol [`TestResult`]s: status mapping,
//! exception and backtrace extraction, runtime, location and the
//! human-readable failure block.

mod stack;

pub use stack::clean_stack;

use crate::engine::{Failure, TestOutcome};
use crate::suite::{TestIdentity, TestStatus};
use gridrun_proto::{Location, Nanoseconds, TestCase, TestResult, TestResultStatus};
use serde_json::{Map, Value, json};
use std::time::Duration;

/// Reported when a duration was never measured.
pub const ESTIMATED_RUNTIME_NANOS: Nanoseconds = 99_999_999;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub elide_internal_frames: bool,
}

/// Per-test status as a reporter sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionStatus {
    Passed,
    Failed,
    Pending,
    Skipped,
    Todo,
    Disabled,
}

impl AssertionStatus {
    pub fn of(outcome: &TestOutcome) -> Self {
        match outcome.status {
            TestStatus::Skip => AssertionStatus::Pending,
            TestStatus::Todo => AssertionStatus::Todo,
            TestStatus::Done if outcome.errors.is_empty() => AssertionStatus::Passed,
            TestStatus::Done => AssertionStatus::Failed,
        }
    }
}

/// Map a reporter status and its errors to the wire status.
///
/// Failures become `error` instead of `failure` when any of the errors
/// originated outside test execution.
pub fn translate_status(
    status: AssertionStatus,
    errors: &[Failure],
    options: ReportOptions,
) -> TestResultStatus {
    match status {
        AssertionStatus::Passed => TestResultStatus::Success,
        AssertionStatus::Pending => TestResultStatus::Pending,
        AssertionStatus::Skipped | AssertionStatus::Disabled => TestResultStatus::Skipped,
        AssertionStatus::Todo => TestResultStatus::Todo,
        AssertionStatus::Failed => {
            let exception = (!errors.is_empty()).then(|| {
                errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            let backtrace = Some(backtrace(errors, options));
            if errors.iter().any(|e| e.origin.is_outside_execution()) {
                TestResultStatus::Error {
                    backtrace,
                    exception,
                }
            } else {
                TestResultStatus::Failure {
                    backtrace,
                    exception,
                }
            }
        }
    }
}

/// Cleaned stack lines of every error, with a `"\n"` entry between errors.
pub fn backtrace(errors: &[Failure], options: ReportOptions) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, error) in errors.iter().enumerate() {
        if i > 0 {
            lines.push("\n".to_string());
        }
        lines.extend(clean_stack(&error.stack, options.elide_internal_frames));
    }
    lines
}

pub fn runtime_nanos(duration: Option<Duration>) -> Nanoseconds {
    match duration.map(|d| d.as_nanos()) {
        Some(0) | None => ESTIMATED_RUNTIME_NANOS,
        Some(nanos) => Nanoseconds::try_from(nanos).unwrap_or(Nanoseconds::MAX),
    }
}

/// `● a › b` header followed by each error's indented message and stack.
pub fn format_failure_output(titles: &[String], errors: &[Failure], options: ReportOptions) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let mut out = format!("● {}\n", titles.join(" › "));
    for error in errors {
        out.push('\n');
        for line in error.message.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        let stack = clean_stack(&error.stack, options.elide_internal_frames);
        if !stack.is_empty() {
            out.push('\n');
            for line in stack {
                out.push_str("      ");
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out
}

pub fn to_test_result(
    outcome: &TestOutcome,
    identity: &TestIdentity,
    options: ReportOptions,
) -> TestResult {
    let status = translate_status(AssertionStatus::of(outcome), &outcome.errors, options);
    let mut titles = outcome.ancestors.clone();
    titles.push(outcome.name.clone());

    let output = match status {
        TestResultStatus::Failure { .. } | TestResultStatus::Error { .. } => {
            format_failure_output(&titles, &outcome.errors, options)
        }
        _ => String::new(),
    };

    let mut meta = Map::new();
    if !outcome.retry_reasons.is_empty() {
        let reasons: Vec<Value> = outcome
            .retry_reasons
            .iter()
            .map(|r| Value::String(r.message.clone()))
            .collect();
        meta.insert("retry_reasons".to_string(), Value::Array(reasons));
    }
    if outcome.invocations > 1 {
        meta.insert("invocations".to_string(), json!(outcome.invocations));
    }

    TestResult {
        id: outcome.id.clone(),
        display_name: titles.join(" "),
        lineage: outcome.ancestors.clone(),
        location: Some(Location {
            file: identity.relative_file(&outcome.file),
            line: Some(outcome.callsite.line),
            column: Some(outcome.callsite.column),
        }),
        status,
        output,
        runtime: runtime_nanos(outcome.duration),
        meta,
    }
}

/// The single result sent for a test file that failed before any of its
/// tests could run.
pub fn file_error_result(test_case: &TestCase, failure: &Failure, options: ReportOptions) -> TestResult {
    let file_name = test_case.meta.file_name.clone();
    let errors = std::slice::from_ref(failure);
    TestResult {
        id: test_case.id.clone(),
        display_name: file_name.clone(),
        lineage: Vec::new(),
        location: Some(Location {
            file: file_name.clone(),
            line: None,
            column: None,
        }),
        status: TestResultStatus::Error {
            backtrace: Some(backtrace(errors, options)),
            exception: Some(failure.message.clone()),
        },
        output: format_failure_output(&[file_name], errors, options),
        runtime: ESTIMATED_RUNTIME_NANOS,
        meta: Map::new(),
    }
}
