//! Runner side of the coordinator protocol.
//!
//! [`RunnerSession`] owns the framed socket and enforces message ordering:
//! spawn announcement first, then either a manifest or the init handshake,
//! then one test case at a time. Any violation is a fatal
//! [`ProtocolError`].

use futures::{SinkExt, StreamExt};
use gridrun_proto::{
    CoordinatorMessage, FrameCodec, InitMessage, InitSuccessMessage, Manifest, ManifestMessage,
    NativeRunnerSpawned, ProtocolError, ResultMessage, RunnerMessage, TestCase,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitSpawnAnnouncement,
    AwaitInitOrManifestRequest,
    ManifestOnly,
    Dispatch { in_flight: Option<String> },
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::AwaitSpawnAnnouncement => "spawn announcement",
            SessionState::AwaitInitOrManifestRequest => "init or manifest request",
            SessionState::ManifestOnly => "manifest-only session",
            SessionState::Dispatch { .. } => "dispatch",
            SessionState::Closed => "closed session",
        }
    }
}

pub struct RunnerSession<T> {
    framed: Framed<T, FrameCodec<CoordinatorMessage>>,
    state: SessionState,
}

impl<T> RunnerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
            state: SessionState::AwaitSpawnAnnouncement,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Id of the test case awaiting its terminal result, if any.
    pub fn in_flight(&self) -> Option<&str> {
        match &self.state {
            SessionState::Dispatch { in_flight } => in_flight.as_deref(),
            _ => None,
        }
    }

    pub async fn announce(&mut self, spawned: NativeRunnerSpawned) -> Result<(), ProtocolError> {
        self.require(SessionState::AwaitSpawnAnnouncement, "native_runner_spawned")?;
        self.framed.send(RunnerMessage::Spawned(spawned)).await?;
        self.state = SessionState::AwaitInitOrManifestRequest;
        tracing::debug!("sent spawn announcement");
        Ok(())
    }

    pub async fn send_manifest(&mut self, manifest: Manifest) -> Result<(), ProtocolError> {
        self.require(SessionState::AwaitInitOrManifestRequest, "manifest")?;
        let tests = manifest.test_count();
        self.framed
            .send(RunnerMessage::Manifest(ManifestMessage { manifest }))
            .await?;
        self.state = SessionState::ManifestOnly;
        tracing::info!(tests, "sent manifest");
        Ok(())
    }

    /// After a manifest the coordinator has nothing more to say; wait for it
    /// to hang up.
    pub async fn wait_for_close(&mut self) -> Result<(), ProtocolError> {
        match self.framed.next().await {
            None => {
                self.state = SessionState::Closed;
                Ok(())
            }
            Some(Ok(message)) => Err(ProtocolError::Unexpected {
                expected: "connection close",
                received: message.kind().to_string(),
            }),
            Some(Err(e)) => Err(e),
        }
    }

    pub async fn receive_init(&mut self) -> Result<InitMessage, ProtocolError> {
        self.require(SessionState::AwaitInitOrManifestRequest, "init")?;
        match self.framed.next().await {
            Some(Ok(CoordinatorMessage::Init(init))) => {
                tracing::debug!(fast_exit = init.fast_exit, "received init");
                Ok(init)
            }
            Some(Ok(other)) => Err(ProtocolError::Unexpected {
                expected: "init",
                received: other.kind().to_string(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::ConnectionClosed {
                during: "awaiting init",
            }),
        }
    }

    pub async fn ack_init(&mut self) -> Result<(), ProtocolError> {
        self.require(SessionState::AwaitInitOrManifestRequest, "init_success")?;
        self.framed
            .send(RunnerMessage::InitSuccess(InitSuccessMessage {}))
            .await?;
        self.state = SessionState::Dispatch { in_flight: None };
        Ok(())
    }

    /// Next dispatched test case, or `None` once the coordinator closes
    /// cleanly while idle.
    pub async fn next_test_case(&mut self) -> Result<Option<TestCase>, ProtocolError> {
        let in_flight = match &self.state {
            SessionState::Dispatch { in_flight } => in_flight.clone(),
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "dispatch",
                    received: format!("test case request in {}", other.name()),
                });
            }
        };

        match self.framed.next().await {
            Some(Ok(CoordinatorMessage::TestCase(message))) => {
                let test_case = message.test_case;
                if let Some(in_flight) = in_flight {
                    return Err(ProtocolError::TestCaseInFlight {
                        in_flight,
                        received: test_case.id,
                    });
                }
                tracing::debug!(id = %test_case.id, file = %test_case.meta.file_name, "received test case");
                self.state = SessionState::Dispatch {
                    in_flight: Some(test_case.id.clone()),
                };
                Ok(Some(test_case))
            }
            Some(Ok(other)) => Err(ProtocolError::Unexpected {
                expected: "test_case",
                received: other.kind().to_string(),
            }),
            Some(Err(e)) => Err(e),
            None if in_flight.is_some() => Err(ProtocolError::ConnectionClosed {
                during: "a test case was in flight",
            }),
            None => {
                self.state = SessionState::Closed;
                Ok(None)
            }
        }
    }

    /// Send results for the in-flight test case. A terminal message frees
    /// the session for the next one.
    pub async fn send_result(&mut self, message: ResultMessage) -> Result<(), ProtocolError> {
        match &self.state {
            SessionState::Dispatch { in_flight: Some(_) } => {}
            SessionState::Dispatch { in_flight: None } => {
                return Err(ProtocolError::Unexpected {
                    expected: "test case in flight",
                    received: "result".to_string(),
                });
            }
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "dispatch",
                    received: format!("result in {}", other.name()),
                });
            }
        }
        if message.is_terminal() {
            self.state = SessionState::Dispatch { in_flight: None };
        }
        self.framed.send(RunnerMessage::Result(message)).await
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<RunnerMessage>::close(&mut self.framed).await?;
        self.state = SessionState::Closed;
        tracing::debug!("session closed");
        Ok(())
    }

    fn require(&self, expected: SessionState, action: &str) -> Result<(), ProtocolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::Unexpected {
                expected: expected.name(),
                received: format!("{} in {}", action, self.state.name()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrun_proto::{TestCaseMessage, TestMeta, TestResult, TestResultStatus};
    use serde_json::{Map, Value};
    use tokio::io::DuplexStream;

    type Coordinator = Framed<DuplexStream, FrameCodec<Value>>;

    fn pair() -> (RunnerSession<DuplexStream>, Coordinator) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (RunnerSession::new(a), Framed::new(b, FrameCodec::new()))
    }

    fn spawned() -> NativeRunnerSpawned {
        NativeRunnerSpawned {
            adapter_name: "gridrun".to_string(),
            adapter_version: "0.1.0".to_string(),
            test_framework: "gridrun".to_string(),
            test_framework_version: "0.1.0".to_string(),
        }
    }

    fn test_case(id: &str) -> CoordinatorMessage {
        CoordinatorMessage::TestCase(TestCaseMessage {
            test_case: TestCase {
                id: id.to_string(),
                meta: TestMeta::for_file("tests/a.rs"),
                focus: None,
            },
        })
    }

    fn result(id: &str) -> TestResult {
        TestResult {
            id: id.to_string(),
            display_name: id.to_string(),
            lineage: Vec::new(),
            location: None,
            status: TestResultStatus::Success,
            output: String::new(),
            runtime: 1,
            meta: Map::new(),
        }
    }

    async fn handshake(runner: &mut RunnerSession<DuplexStream>, coord: &mut Coordinator) {
        runner.announce(spawned()).await.unwrap();
        let announced = coord.next().await.unwrap().unwrap();
        assert_eq!(announced["type"], "native_runner_spawned");
        assert_eq!(announced["adapterName"], "gridrun");

        coord
            .send(CoordinatorMessage::Init(InitMessage::default()))
            .await
            .unwrap();
        let init = runner.receive_init().await.unwrap();
        assert!(!init.fast_exit);
        runner.ack_init().await.unwrap();
        let ack = coord.next().await.unwrap().unwrap();
        assert_eq!(ack, Value::Object(Map::new()));
    }

    // =========================================
    // Handshake
    // =========================================

    #[tokio::test]
    async fn test_handshake_reaches_dispatch() {
        let (mut runner, mut coord) = pair();
        handshake(&mut runner, &mut coord).await;
        assert_eq!(runner.state(), &SessionState::Dispatch { in_flight: None });
    }

    #[tokio::test]
    async fn test_announce_must_come_first() {
        let (mut runner, _coord) = pair();
        let err = runner.ack_init().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected { .. }));
    }

    #[tokio::test]
    async fn test_close_before_init_is_fatal() {
        let (mut runner, coord) = pair();
        runner.announce(spawned()).await.unwrap();
        drop(coord);
        let err = runner.receive_init().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_manifest_then_close() {
        let (mut runner, mut coord) = pair();
        runner.announce(spawned()).await.unwrap();
        runner.send_manifest(Manifest::default()).await.unwrap();
        let _ = coord.next().await.unwrap().unwrap();
        let manifest = coord.next().await.unwrap().unwrap();
        assert!(manifest.get("manifest").is_some());
        drop(coord);
        runner.wait_for_close().await.unwrap();
        assert_eq!(runner.state(), &SessionState::Closed);
    }

    // =========================================
    // Dispatch
    // =========================================

    #[tokio::test]
    async fn test_one_case_at_a_time() {
        let (mut runner, mut coord) = pair();
        handshake(&mut runner, &mut coord).await;

        coord.send(test_case("a")).await.unwrap();
        let case = runner.next_test_case().await.unwrap().unwrap();
        assert_eq!(case.id, "a");
        assert_eq!(runner.in_flight(), Some("a"));

        runner
            .send_result(ResultMessage::Incremental(result("a#0:0")))
            .await
            .unwrap();
        assert_eq!(runner.in_flight(), Some("a"));
        runner
            .send_result(ResultMessage::IncrementalDone(None))
            .await
            .unwrap();
        assert_eq!(runner.in_flight(), None);

        let first = coord.next().await.unwrap().unwrap();
        assert_eq!(first["type"], "incremental_result");
        let done = coord.next().await.unwrap().unwrap();
        assert_eq!(done["type"], "incremental_result_done");

        drop(coord);
        assert!(runner.next_test_case().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipelined_test_case_is_rejected() {
        let (mut runner, mut coord) = pair();
        handshake(&mut runner, &mut coord).await;

        coord.send(test_case("a")).await.unwrap();
        coord.send(test_case("b")).await.unwrap();
        runner.next_test_case().await.unwrap();
        match runner.next_test_case().await.unwrap_err() {
            ProtocolError::TestCaseInFlight {
                in_flight,
                received,
            } => {
                assert_eq!(in_flight, "a");
                assert_eq!(received, "b");
            }
            other => panic!("Expected TestCaseInFlight, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_with_case_in_flight_is_fatal() {
        let (mut runner, mut coord) = pair();
        handshake(&mut runner, &mut coord).await;
        coord.send(test_case("a")).await.unwrap();
        runner.next_test_case().await.unwrap();
        drop(coord);
        let err = runner.next_test_case().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_result_without_case_is_rejected() {
        let (mut runner, mut coord) = pair();
        handshake(&mut runner, &mut coord).await;
        let err = runner
            .send_result(ResultMessage::Single(result("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected { .. }));
    }
}
