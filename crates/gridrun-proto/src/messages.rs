//! Protocol message types.
//!
//! Runner → coordinator messages are grouped in [`RunnerMessage`], coordinator
//! → runner messages in [`CoordinatorMessage`]. Both directions decode through
//! [`WireMessage::from_value`], which inspects the distinguishing field of a
//! JSON object and refuses anything it cannot classify.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Durations on the wire are integral nanoseconds.
pub type Nanoseconds = u64;

/// A message type that can be classified from a decoded JSON payload.
pub trait WireMessage: Sized {
    /// Classify and convert a decoded JSON value.
    fn from_value(value: Value) -> Result<Self, ProtocolError>;

    /// Parse a raw frame payload.
    fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(value)
    }
}

impl WireMessage for Value {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(value)
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// First message on every connection: identifies the adapter and framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "native_runner_spawned", rename_all = "camelCase")]
pub struct NativeRunnerSpawned {
    pub adapter_name: String,
    pub adapter_version: String,
    pub test_framework: String,
    pub test_framework_version: String,
}

/// Coordinator init request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default)]
    pub init_meta: Map<String, Value>,
    /// When set, the runner must close the socket without doing any work.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fast_exit: bool,
}

/// Runner acknowledgement of [`InitMessage`]; serialises as `{}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitSuccessMessage {}

// =============================================================================
// Manifest
// =============================================================================

/// Metadata attached to a test: at minimum the file it lives in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestMeta {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestMeta {
    pub fn for_file(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            extra: Map::new(),
        }
    }
}

/// A group of manifest members (one `describe` block).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub name: String,
    #[serde(default)]
    pub members: Vec<ManifestMember>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// A single dispatchable test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTest {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub meta: TestMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManifestMember {
    Group(ManifestGroup),
    Test(ManifestTest),
}

impl ManifestMember {
    /// The key used to order members in a snapshot: a group's name or a
    /// test's id.
    pub fn sort_key(&self) -> &str {
        match self {
            ManifestMember::Group(g) => &g.name,
            ManifestMember::Test(t) => &t.id,
        }
    }

    /// Number of tests at or below this member.
    pub fn test_count(&self) -> usize {
        match self {
            ManifestMember::Group(g) => g.members.iter().map(ManifestMember::test_count).sum(),
            ManifestMember::Test(_) => 1,
        }
    }

    fn sorted(&self) -> ManifestMember {
        match self {
            ManifestMember::Group(g) => {
                let mut members: Vec<ManifestMember> =
                    g.members.iter().map(ManifestMember::sorted).collect();
                members.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
                ManifestMember::Group(ManifestGroup {
                    members,
                    ..g.clone()
                })
            }
            ManifestMember::Test(_) => self.clone(),
        }
    }
}

/// The full enumerated tree of tests for a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub members: Vec<ManifestMember>,
    #[serde(default)]
    pub init_meta: Map<String, Value>,
}

impl Manifest {
    /// Total number of tests in the manifest.
    pub fn test_count(&self) -> usize {
        self.members.iter().map(ManifestMember::test_count).sum()
    }

    /// A copy with every level ordered lexicographically by name-or-id.
    pub fn sorted(&self) -> Manifest {
        let mut members: Vec<ManifestMember> =
            self.members.iter().map(ManifestMember::sorted).collect();
        members.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        Manifest {
            members,
            init_meta: self.init_meta.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMessage {
    pub manifest: Manifest,
}

// =============================================================================
// Dispatch
// =============================================================================

/// Restricts a dispatched file to the named test ids.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Focus {
    #[serde(default)]
    pub test_ids: Vec<String>,
}

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub meta: TestMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<Focus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseMessage {
    pub test_case: TestCase,
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Terminal status of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestResultStatus {
    Success,
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backtrace: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
    },
    /// A failure that happened outside normal test execution.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backtrace: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
    },
    Pending,
    Skipped,
    Todo,
}

impl TestResultStatus {
    /// Whether this status counts against the run.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TestResultStatus::Failure { .. } | TestResultStatus::Error { .. }
        )
    }

    pub fn exception(&self) -> Option<&str> {
        match self {
            TestResultStatus::Failure { exception, .. } | TestResultStatus::Error { exception, .. } => {
                exception.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub lineage: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub status: TestResultStatus,
    #[serde(default)]
    pub output: String,
    pub runtime: Nanoseconds,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// The four result delivery shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    /// `{test_result}`
    Single(TestResult),
    /// `{test_results}`
    Many(Vec<TestResult>),
    /// `{type: "incremental_result", one_test_result}`
    Incremental(TestResult),
    /// `{type: "incremental_result_done", last_test_result?}`
    IncrementalDone(Option<TestResult>),
}

impl ResultMessage {
    /// Whether this message completes the result set for the in-flight test
    /// case.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultMessage::Incremental(_))
    }

    /// The results carried by this message, in order.
    pub fn results(&self) -> Vec<&TestResult> {
        match self {
            ResultMessage::Single(r) | ResultMessage::Incremental(r) => vec![r],
            ResultMessage::Many(rs) => rs.iter().collect(),
            ResultMessage::IncrementalDone(r) => r.iter().collect(),
        }
    }

    pub fn into_results(self) -> Vec<TestResult> {
        match self {
            ResultMessage::Single(r) | ResultMessage::Incremental(r) => vec![r],
            ResultMessage::Many(rs) => rs,
            ResultMessage::IncrementalDone(r) => r.into_iter().collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IncrementalWire<'a> {
    IncrementalResult {
        one_test_result: &'a TestResult,
    },
    IncrementalResultDone {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_test_result: Option<&'a TestResult>,
    },
}

#[derive(Serialize)]
struct SingleWire<'a> {
    test_result: &'a TestResult,
}

#[derive(Serialize)]
struct ManyWire<'a> {
    test_results: &'a [TestResult],
}

impl Serialize for ResultMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ResultMessage::Single(r) => SingleWire { test_result: r }.serialize(serializer),
            ResultMessage::Many(rs) => ManyWire { test_results: rs }.serialize(serializer),
            ResultMessage::Incremental(r) => {
                IncrementalWire::IncrementalResult { one_test_result: r }.serialize(serializer)
            }
            ResultMessage::IncrementalDone(r) => IncrementalWire::IncrementalResultDone {
                last_test_result: r.as_ref(),
            }
            .serialize(serializer),
        }
    }
}

// =============================================================================
// Direction enums
// =============================================================================

/// Everything the runner may send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunnerMessage {
    Spawned(NativeRunnerSpawned),
    Manifest(ManifestMessage),
    InitSuccess(InitSuccessMessage),
    Result(ResultMessage),
}

impl RunnerMessage {
    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerMessage::Spawned(_) => "native_runner_spawned",
            RunnerMessage::Manifest(_) => "manifest",
            RunnerMessage::InitSuccess(_) => "init_success",
            RunnerMessage::Result(ResultMessage::Single(_)) => "test_result",
            RunnerMessage::Result(ResultMessage::Many(_)) => "test_results",
            RunnerMessage::Result(ResultMessage::Incremental(_)) => "incremental_result",
            RunnerMessage::Result(ResultMessage::IncrementalDone(_)) => "incremental_result_done",
        }
    }
}

/// Everything the coordinator may send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CoordinatorMessage {
    Init(InitMessage),
    TestCase(TestCaseMessage),
}

impl CoordinatorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorMessage::Init(_) => "init",
            CoordinatorMessage::TestCase(_) => "test_case",
        }
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, ProtocolError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::UnrecognizedMessage(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn describe_keys(map: &Map<String, Value>) -> String {
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    format!("object with keys [{}]", keys.join(", "))
}

fn field<T: serde::de::DeserializeOwned>(
    map: &mut Map<String, Value>,
    name: &str,
) -> Result<T, ProtocolError> {
    let value = map.remove(name).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

impl WireMessage for RunnerMessage {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut map = into_object(value)?;

        if let Some(tag) = map.get("type").and_then(Value::as_str) {
            return match tag {
                "native_runner_spawned" => Ok(RunnerMessage::Spawned(serde_json::from_value(
                    Value::Object(map),
                )?)),
                "incremental_result" => Ok(RunnerMessage::Result(ResultMessage::Incremental(
                    field(&mut map, "one_test_result")?,
                ))),
                "incremental_result_done" => Ok(RunnerMessage::Result(
                    ResultMessage::IncrementalDone(field(&mut map, "last_test_result")?),
                )),
                other => Err(ProtocolError::UnrecognizedMessage(format!(
                    "unknown message type '{}'",
                    other
                ))),
            };
        }

        if map.contains_key("test_result") {
            Ok(RunnerMessage::Result(ResultMessage::Single(field(
                &mut map,
                "test_result",
            )?)))
        } else if map.contains_key("test_results") {
            Ok(RunnerMessage::Result(ResultMessage::Many(field(
                &mut map,
                "test_results",
            )?)))
        } else if map.contains_key("manifest") {
            Ok(RunnerMessage::Manifest(ManifestMessage {
                manifest: field(&mut map, "manifest")?,
            }))
        } else if map.is_empty() {
            Ok(RunnerMessage::InitSuccess(InitSuccessMessage {}))
        } else {
            Err(ProtocolError::UnrecognizedMessage(describe_keys(&map)))
        }
    }
}

impl WireMessage for CoordinatorMessage {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut map = into_object(value)?;

        if map.contains_key("init_meta") {
            Ok(CoordinatorMessage::Init(serde_json::from_value(
                Value::Object(map),
            )?))
        } else if map.contains_key("test_case") {
            Ok(CoordinatorMessage::TestCase(TestCaseMessage {
                test_case: field(&mut map, "test_case")?,
            }))
        } else {
            Err(ProtocolError::UnrecognizedMessage(describe_keys(&map)))
        }
    }
}
