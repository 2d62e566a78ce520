//! Recorded errors.

use crate::errors::StructuralError;
use crate::suite::{Callsite, HookKind};
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::time::Duration;

/// Where a recorded error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    TestBody,
    Timeout,
    Hook(HookKind),
    Structural,
    /// The test file itself failed to load or define its suite.
    Load,
}

impl FailureOrigin {
    /// Failures that happened outside of test execution proper.
    pub fn is_outside_execution(&self) -> bool {
        matches!(self, FailureOrigin::Load)
    }
}

/// One error attached to a test or recorded as unhandled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    /// Raw stack lines, untrimmed.
    pub stack: Vec<String>,
    pub origin: FailureOrigin,
}

impl Failure {
    pub fn new(message: impl Into<String>, origin: FailureOrigin) -> Self {
        Self {
            message: message.into(),
            stack: Vec::new(),
            origin,
        }
    }

    pub fn at(mut self, callsite: Callsite) -> Self {
        self.stack.push(format!("    at {}", callsite));
        self
    }

    /// Build from an error returned by a body. The cause chain and any
    /// captured backtrace become stack lines.
    pub fn from_error(err: &anyhow::Error, origin: FailureOrigin, callsite: Callsite) -> Self {
        let mut stack: Vec<String> = err
            .chain()
            .skip(1)
            .map(|cause| format!("Caused by: {}", cause))
            .collect();
        stack.push(format!("    at {}", callsite));

        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            stack.extend(backtrace.to_string().lines().map(str::to_string));
        }

        Self {
            message: err.to_string(),
            stack,
            origin,
        }
    }

    /// Build from a panic payload caught at a task boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>, origin: FailureOrigin, callsite: Callsite) -> Self {
        Self::new(panic_message(payload.as_ref()), origin).at(callsite)
    }

    pub fn timeout(limit: Duration, is_hook: bool, callsite: Callsite) -> Self {
        let message = format!(
            "Exceeded timeout of {} ms for a {}.\nAdd a timeout value to this test to increase the timeout, if this is a long-running test.",
            limit.as_millis(),
            if is_hook { "hook" } else { "test" }
        );
        Self::new(message, FailureOrigin::Timeout).at(callsite)
    }

    pub fn structural(err: &StructuralError, callsite: Callsite) -> Self {
        Self::new(err.to_string(), FailureOrigin::Structural).at(callsite)
    }

    pub fn failing_test_passed(callsite: Callsite) -> Self {
        Self::new(
            "Failing test passed even though it was supposed to fail. Remove `.failing` to remove error.",
            FailureOrigin::TestBody,
        )
        .at(callsite)
    }
}

/// Best-effort text for a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn here() -> Callsite {
        Callsite {
            file: "tests/a.rs",
            line: 3,
            column: 9,
        }
    }

    #[test]
    fn test_from_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("writing fixture");
        let failure = Failure::from_error(&err, FailureOrigin::TestBody, here());
        assert_eq!(failure.message, "writing fixture");
        assert_eq!(failure.stack[0], "Caused by: disk full");
        assert_eq!(failure.stack[1], "    at tests/a.rs:3:9");
    }

    #[test]
    fn test_stack_gets_captured_backtrace_frames_only() {
        let err = anyhow::anyhow!("expected 3, got 4");
        let failure = Failure::from_error(&err, FailureOrigin::TestBody, here());
        assert_eq!(failure.stack[0], "    at tests/a.rs:3:9");

        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            let frames = backtrace.to_string();
            assert_eq!(failure.stack.len(), 1 + frames.lines().count());
        } else {
            assert_eq!(failure.stack.len(), 1);
        }
        assert!(!failure.stack.iter().any(|line| line.contains("Stack backtrace:")));
    }

    #[test]
    fn test_panic_payloads() {
        let failure = Failure::from_panic(Box::new("boom"), FailureOrigin::TestBody, here());
        assert_eq!(failure.message, "boom");
        let failure =
            Failure::from_panic(Box::new(String::from("owned boom")), FailureOrigin::TestBody, here());
        assert_eq!(failure.message, "owned boom");
        let failure = Failure::from_panic(Box::new(7u8), FailureOrigin::TestBody, here());
        assert!(failure.message.contains("non-string"));
    }

    #[test]
    fn test_timeout_message() {
        let failure = Failure::timeout(Duration::from_millis(250), false, here());
        assert!(failure.message.starts_with("Exceeded timeout of 250 ms for a test."));
        assert_eq!(failure.origin, FailureOrigin::Timeout);
        let failure = Failure::timeout(Duration::from_millis(5), true, here());
        assert!(failure.message.starts_with("Exceeded timeout of 5 ms for a hook."));
    }

    #[test]
    fn test_only_load_failures_are_outside_execution() {
        assert!(FailureOrigin::Load.is_outside_execution());
        assert!(!FailureOrigin::Hook(HookKind::AfterAll).is_outside_execution());
        assert!(!FailureOrigin::Timeout.is_outside_execution());
    }
}
