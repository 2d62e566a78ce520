//! Coordinator side of the protocol.
//!
//! [`CoordinatorSession`] speaks the server half of the handshake and
//! collects result sets in either delivery shape. [`ScriptedCoordinator`]
//! drives one runner through a fixed queue of test cases, which is what the
//! `coordinate` command and the end-to-end tests use.

use futures::{SinkExt, StreamExt};
use gridrun_proto::{
    CoordinatorMessage, FrameCodec, InitMessage, Manifest, NativeRunnerSpawned, ProtocolError,
    ResultMessage, RunnerMessage, TestCase, TestCaseMessage, TestResult,
};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

pub struct CoordinatorSession<T> {
    framed: Framed<T, FrameCodec<RunnerMessage>>,
    in_flight: Option<String>,
}

impl<T> CoordinatorSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
            in_flight: None,
        }
    }

    async fn receive(&mut self, during: &'static str) -> Result<RunnerMessage, ProtocolError> {
        match self.framed.next().await {
            Some(message) => message,
            None => Err(ProtocolError::ConnectionClosed { during }),
        }
    }

    pub async fn expect_spawned(&mut self) -> Result<NativeRunnerSpawned, ProtocolError> {
        match self.receive("awaiting spawn announcement").await? {
            RunnerMessage::Spawned(spawned) => Ok(spawned),
            other => Err(unexpected("native_runner_spawned", &other)),
        }
    }

    pub async fn expect_manifest(&mut self) -> Result<Manifest, ProtocolError> {
        match self.receive("awaiting manifest").await? {
            RunnerMessage::Manifest(message) => Ok(message.manifest),
            other => Err(unexpected("manifest", &other)),
        }
    }

    pub async fn send_init(&mut self, init: InitMessage) -> Result<(), ProtocolError> {
        self.framed.send(CoordinatorMessage::Init(init)).await
    }

    pub async fn expect_init_success(&mut self) -> Result<(), ProtocolError> {
        match self.receive("awaiting init acknowledgement").await? {
            RunnerMessage::InitSuccess(_) => Ok(()),
            other => Err(unexpected("init_success", &other)),
        }
    }

    /// Dispatch one test case. Only one may be outstanding at a time.
    pub async fn send_test_case(&mut self, test_case: TestCase) -> Result<(), ProtocolError> {
        if let Some(in_flight) = &self.in_flight {
            return Err(ProtocolError::TestCaseInFlight {
                in_flight: in_flight.clone(),
                received: test_case.id,
            });
        }
        self.in_flight = Some(test_case.id.clone());
        self.framed
            .send(CoordinatorMessage::TestCase(TestCaseMessage { test_case }))
            .await
    }

    /// Read results until the in-flight test case's set is complete.
    pub async fn collect_results(&mut self) -> Result<Vec<TestResult>, ProtocolError> {
        if self.in_flight.is_none() {
            return Err(ProtocolError::Unexpected {
                expected: "a dispatched test case",
                received: "request to collect results".to_string(),
            });
        }

        let mut results = Vec::new();
        loop {
            match self.receive("a test case was in flight").await? {
                RunnerMessage::Result(message) => {
                    let terminal = message.is_terminal();
                    results.extend(message.into_results());
                    if terminal {
                        self.in_flight = None;
                        return Ok(results);
                    }
                }
                other => return Err(unexpected("test results", &other)),
            }
        }
    }

    /// After a fast exit the runner must hang up without another message.
    pub async fn expect_close(&mut self) -> Result<(), ProtocolError> {
        match self.framed.next().await {
            None => Ok(()),
            Some(Ok(other)) => Err(unexpected("connection close", &other)),
            Some(Err(e)) => Err(e),
        }
    }

    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<CoordinatorMessage>::close(&mut self.framed).await
    }
}

fn unexpected(expected: &'static str, received: &RunnerMessage) -> ProtocolError {
    ProtocolError::Unexpected {
        expected,
        received: received.kind().to_string(),
    }
}

/// The results one test case produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub test_case: TestCase,
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorReport {
    pub spawned: NativeRunnerSpawned,
    pub result_sets: Vec<ResultSet>,
}

impl CoordinatorReport {
    pub fn results(&self) -> impl Iterator<Item = &TestResult> {
        self.result_sets.iter().flat_map(|set| set.results.iter())
    }

    pub fn failed_count(&self) -> usize {
        self.results().filter(|r| r.status.is_failed()).count()
    }
}

/// Hands a fixed queue of test cases to one runner, one at a time.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCoordinator {
    test_cases: VecDeque<TestCase>,
    init_meta: Map<String, Value>,
    fast_exit: bool,
}

impl ScriptedCoordinator {
    pub fn new(test_cases: impl IntoIterator<Item = TestCase>) -> Self {
        Self {
            test_cases: test_cases.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_init_meta(mut self, init_meta: Map<String, Value>) -> Self {
        self.init_meta = init_meta;
        self
    }

    pub fn with_fast_exit(mut self, fast_exit: bool) -> Self {
        self.fast_exit = fast_exit;
        self
    }

    /// Run the whole script over `io`, then close the connection.
    pub async fn serve<T>(mut self, io: T) -> Result<CoordinatorReport, ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = CoordinatorSession::new(io);
        let spawned = session.expect_spawned().await?;
        tracing::debug!(adapter = %spawned.adapter_name, "runner announced itself");

        session
            .send_init(InitMessage {
                init_meta: self.init_meta.clone(),
                fast_exit: self.fast_exit,
            })
            .await?;

        let mut result_sets = Vec::new();
        if self.fast_exit {
            session.expect_close().await?;
            return Ok(CoordinatorReport {
                spawned,
                result_sets,
            });
        }
        session.expect_init_success().await?;

        while let Some(test_case) = self.test_cases.pop_front() {
            session.send_test_case(test_case.clone()).await?;
            let results = session.collect_results().await?;
            tracing::debug!(id = %test_case.id, results = results.len(), "result set complete");
            result_sets.push(ResultSet { test_case, results });
        }

        session.close().await?;
        Ok(CoordinatorReport {
            spawned,
            result_sets,
        })
    }

    /// Accept a manifest-only session: read the manifest, then hang up.
    pub async fn serve_manifest_request<T>(io: T) -> Result<(NativeRunnerSpawned, Manifest), ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = CoordinatorSession::new(io);
        let spawned = session.expect_spawned().await?;
        let manifest = session.expect_manifest().await?;
        session.close().await?;
        Ok((spawned, manifest))
    }
}
