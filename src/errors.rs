//! Typed error hierarchy for gridrun.
//!
//! - `StructuralError` — suite-shape violations, recorded on a test or as a
//!   run-level unhandled error rather than returned
//! - `SuiteLoadError` — a test file could not be turned into a suite
//! - `BridgeError` — fatal failures of a coordinator session
//!
//! Wire-level failures live in [`gridrun_proto::ProtocolError`].

use crate::suite::HookKind;
use gridrun_proto::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// A test, describe block or hook registered where it is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error(
        "Tests cannot be nested. Test \"{test}\" cannot run because it is nested within \"{parent}\"."
    )]
    NestedTest { test: String, parent: String },

    #[error("Hooks cannot be defined inside tests. Hook of type \"{kind}\" is nested within \"{parent}\".")]
    HookInsideTest { kind: HookKind, parent: String },

    #[error(
        "Cannot nest a describe inside a test. Describe block \"{describe}\" cannot run because it is nested within \"{parent}\"."
    )]
    NestedDescribe { describe: String, parent: String },

    #[error("Cannot add a test after tests have started running. Tests must be defined synchronously.")]
    TestAfterStart,

    #[error("Cannot add a hook after tests have started running. Hooks must be defined synchronously.")]
    HookAfterStart,

    #[error(
        "Cannot add a describe block after tests have started running. Describe blocks must be defined synchronously."
    )]
    DescribeAfterStart,

    #[error("Invalid: {kind}() may not be used in a describe block containing no tests.")]
    HookWithoutTests { kind: HookKind },
}

/// A test file that could not be collected.
#[derive(Debug, Error)]
pub enum SuiteLoadError {
    #[error("No suite definition registered for {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Suite definition for {} panicked: {message}", .path.display())]
    Panicked { path: PathBuf, message: String },
}

/// Errors that end a coordinator session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to connect to coordinator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No socket address configured (set GRIDRUN_SOCKET or pass --socket)")]
    MissingSocket,

    #[error("Test case {test_case} names unknown test file {file_name}")]
    UnknownTestFile { test_case: String, file_name: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_messages_match_runner_wording() {
        let err = StructuralError::NestedTest {
            test: "inner".to_string(),
            parent: "outer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Tests cannot be nested. Test \"inner\" cannot run because it is nested within \"outer\"."
        );

        let err = StructuralError::HookInsideTest {
            kind: HookKind::BeforeEach,
            parent: "outer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Hooks cannot be defined inside tests. Hook of type \"beforeEach\" is nested within \"outer\"."
        );
    }

    #[test]
    fn test_bridge_error_wraps_protocol_error() {
        let err: BridgeError = ProtocolError::ConnectionClosed {
            during: "a test case was in flight",
        }
        .into();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(err.to_string().contains("in flight"));
    }

    #[test]
    fn test_unknown_test_file_names_both() {
        let err = BridgeError::UnknownTestFile {
            test_case: "t#0:0".to_string(),
            file_name: "missing.rs".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("t#0:0"));
        assert!(msg.contains("missing.rs"));
    }
}
