//! Orchestrator bridge.
//!
//! Connects the coordinator protocol to the execution engine: one
//! [`RunnerSession`] per connection, one suite run per dispatched test case,
//! results streamed back as the engine reports them.

use crate::config::{BridgeConfig, ResultDelivery};
use crate::engine::{EngineConfig, Failure, FailureOrigin, ResultSink, SuiteRun, TestOutcome};
use crate::errors::BridgeError;
use crate::output::suppress_if;
use crate::report::{ReportOptions, file_error_result, to_test_result};
use crate::session::RunnerSession;
use crate::source::TestSource;
use crate::suite::{TestIdentity, build_manifest};
use async_trait::async_trait;
use gridrun_proto::{
    Manifest, NativeRunnerSpawned, ProtocolError, ResultMessage, TestCase, TestResult,
};
use serde_json::Map;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

pub const ADAPTER_NAME: &str = "gridrun";
pub const TEST_FRAMEWORK: &str = "gridrun";

/// The announcement sent as the first message of every session.
pub fn spawn_announcement() -> NativeRunnerSpawned {
    NativeRunnerSpawned {
        adapter_name: ADAPTER_NAME.to_string(),
        adapter_version: env!("CARGO_PKG_VERSION").to_string(),
        test_framework: TEST_FRAMEWORK.to_string(),
        test_framework_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// What one session did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub test_cases: usize,
    pub results_sent: usize,
    pub failed: usize,
    pub load_errors: usize,
    pub unhandled_errors: usize,
    /// Set when the session only produced a manifest.
    pub manifest_tests: Option<usize>,
    pub fast_exit: bool,
    pub cancelled: bool,
}

impl SessionSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unhandled_errors == 0 && !self.cancelled
    }
}

pub struct Bridge<S> {
    config: BridgeConfig,
    source: S,
    cancel: CancellationToken,
}

impl<S: TestSource> Bridge<S> {
    pub fn new(config: BridgeConfig, source: S) -> Self {
        Self {
            config,
            source,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop dispatching tests once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Manifest of every test file the source knows. Files whose definition
    /// fails to load are left out.
    pub fn manifest(&self) -> Manifest {
        let identity = self.config.identity();
        let suites: Vec<_> = self
            .source
            .test_files()
            .into_iter()
            .filter_map(|path| match self.source.load(&path) {
                Ok(suite) => Some(suite),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping file in manifest");
                    None
                }
            })
            .collect();
        build_manifest(&suites, &identity, Map::new())
    }

    /// Connect to the configured socket and serve until the coordinator
    /// closes it.
    pub async fn run(&self) -> Result<SessionSummary, BridgeError> {
        let addr = self.config.socket.clone().ok_or(BridgeError::MissingSocket)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| BridgeError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(%addr, "connected to coordinator");

        let _guard = suppress_if(self.config.hide_native_output)?;
        self.serve(stream).await
    }

    /// Serve one session over an established transport.
    pub async fn serve<T>(&self, io: T) -> Result<SessionSummary, BridgeError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = RunnerSession::new(io);
        let mut summary = SessionSummary::default();
        session.announce(spawn_announcement()).await?;

        if self.config.generate_manifest {
            let manifest = self.manifest();
            summary.manifest_tests = Some(manifest.test_count());
            session.send_manifest(manifest).await?;
            session.wait_for_close().await?;
            return Ok(summary);
        }

        let init = session.receive_init().await?;
        if init.fast_exit {
            info!("coordinator requested fast exit");
            session.close().await?;
            summary.fast_exit = true;
            return Ok(summary);
        }
        session.ack_init().await?;

        let engine = self.config.engine_config()?;
        while let Some(test_case) = session.next_test_case().await? {
            let span = info_span!("test_case", id = %test_case.id, file = %test_case.meta.file_name);
            self.run_test_case(&mut session, &engine, test_case, &mut summary)
                .instrument(span)
                .await?;
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                session.close().await?;
                break;
            }
        }

        info!(
            test_cases = summary.test_cases,
            results = summary.results_sent,
            failed = summary.failed,
            "session finished"
        );
        Ok(summary)
    }

    async fn run_test_case<T>(
        &self,
        session: &mut RunnerSession<T>,
        engine: &EngineConfig,
        test_case: TestCase,
        summary: &mut SessionSummary,
    ) -> Result<(), BridgeError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        summary.test_cases += 1;
        let path = self
            .source
            .resolve(&test_case.meta.file_name)
            .ok_or_else(|| BridgeError::UnknownTestFile {
                test_case: test_case.id.clone(),
                file_name: test_case.meta.file_name.clone(),
            })?;

        let options = self.config.report_options();
        let suite = match self.source.load(&path) {
            Ok(suite) => suite,
            Err(err) => {
                warn!(error = %err, "test file failed to load");
                let failure = Failure::new(err.to_string(), FailureOrigin::Load);
                let result = file_error_result(&test_case, &failure, options);
                let message = match self.config.result_delivery {
                    ResultDelivery::Incremental => ResultMessage::IncrementalDone(Some(result)),
                    ResultDelivery::Consolidated => ResultMessage::Single(result),
                };
                session.send_result(message).await?;
                summary.load_errors += 1;
                summary.results_sent += 1;
                summary.failed += 1;
                return Ok(());
            }
        };

        let focus = test_case
            .focus
            .map(|focus| focus.test_ids)
            .unwrap_or_default();
        let mut sink = SessionSink {
            session,
            identity: &engine.identity,
            options,
            delivery: self.config.result_delivery,
            buffered: Vec::new(),
            sent: 0,
            failed: 0,
        };

        let run = SuiteRun::new(suite, engine, &mut sink)
            .with_focus(&focus)
            .with_cancellation(self.cancel.clone())
            .run()
            .await
            .map_err(into_bridge_error)?;

        for error in &run.unhandled_errors {
            warn!(error = %error.message, "unhandled error outside any test");
        }
        let (sent, failed) = sink.finish().await?;
        debug!(sent, failed, "test case finished");

        summary.results_sent += sent;
        summary.failed += failed;
        summary.unhandled_errors += run.unhandled_errors.len();
        summary.cancelled |= run.cancelled;
        Ok(())
    }
}

fn into_bridge_error(err: anyhow::Error) -> BridgeError {
    match err.downcast::<ProtocolError>() {
        Ok(protocol) => BridgeError::Protocol(protocol),
        Err(other) => BridgeError::Other(other),
    }
}

/// Forwards engine outcomes to the session in the configured shape.
struct SessionSink<'s, T> {
    session: &'s mut RunnerSession<T>,
    identity: &'s TestIdentity,
    options: ReportOptions,
    delivery: ResultDelivery,
    buffered: Vec<TestResult>,
    sent: usize,
    failed: usize,
}

impl<'s, T> SessionSink<'s, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send whatever completes the result set. Returns results sent and how
    /// many of them failed.
    async fn finish(self) -> Result<(usize, usize), ProtocolError> {
        let message = match self.delivery {
            ResultDelivery::Incremental => ResultMessage::IncrementalDone(None),
            ResultDelivery::Consolidated => ResultMessage::Many(self.buffered),
        };
        self.session.send_result(message).await?;
        Ok((self.sent, self.failed))
    }
}

#[async_trait]
impl<'s, T> ResultSink for SessionSink<'s, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn test_finished(&mut self, outcome: &TestOutcome) -> anyhow::Result<()> {
        let result = to_test_result(outcome, self.identity, self.options);
        self.sent += 1;
        if result.status.is_failed() {
            self.failed += 1;
        }
        match self.delivery {
            ResultDelivery::Incremental => {
                self.session
                    .send_result(ResultMessage::Incremental(result))
                    .await?
            }
            ResultDelivery::Consolidated => self.buffered.push(result),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SuiteCatalog;
    use futures::{SinkExt, StreamExt};
    use gridrun_proto::{
        CoordinatorMessage, FrameCodec, InitMessage, TestCaseMessage, TestMeta,
    };
    use serde_json::Value;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    type Coordinator = Framed<DuplexStream, FrameCodec<Value>>;

    fn catalog() -> SuiteCatalog {
        SuiteCatalog::new("/repo")
            .with_file("tests/math.rs", |s| {
                s.describe("math", |s| {
                    s.test("adds", |_| async { Ok(()) });
                    s.test("fails", |_| async { anyhow::bail!("expected 3, got 4") });
                });
            })
            .with_file("tests/broken.rs", |_| panic!("fixture missing"))
    }

    fn test_case(id: &str, file: &str) -> CoordinatorMessage {
        CoordinatorMessage::TestCase(TestCaseMessage {
            test_case: TestCase {
                id: id.to_string(),
                meta: TestMeta::for_file(file),
                focus: None,
            },
        })
    }

    async fn init(coord: &mut Coordinator, fast_exit: bool) {
        let spawned = coord.next().await.unwrap().unwrap();
        assert_eq!(spawned["adapterName"], ADAPTER_NAME);
        coord
            .send(CoordinatorMessage::Init(InitMessage {
                init_meta: Map::new(),
                fast_exit,
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_incremental_session() {
        let (runner_io, coord_io) = tokio::io::duplex(64 * 1024);
        let bridge = Bridge::new(BridgeConfig::new("/repo"), catalog());

        let coordinator = tokio::spawn(async move {
            let mut coord: Coordinator = Framed::new(coord_io, FrameCodec::new());
            init(&mut coord, false).await;
            assert_eq!(coord.next().await.unwrap().unwrap(), Value::Object(Map::new()));
            coord.send(test_case("case-1", "tests/math.rs")).await.unwrap();

            let mut frames = Vec::new();
            loop {
                let frame = coord.next().await.unwrap().unwrap();
                let done = frame["type"] == "incremental_result_done";
                frames.push(frame);
                if done {
                    break;
                }
            }
            frames
        });

        let summary = bridge.serve(runner_io).await.unwrap();
        let frames = coordinator.await.unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["one_test_result"]["id"], "tests/math.rs#0:0:0");
        assert_eq!(frames[0]["one_test_result"]["status"]["type"], "success");
        assert_eq!(frames[1]["one_test_result"]["status"]["type"], "failure");
        assert_eq!(
            frames[1]["one_test_result"]["status"]["exception"],
            "expected 3, got 4"
        );
        assert_eq!(summary.test_cases, 1);
        assert_eq!(summary.results_sent, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_load_error_sends_single_error_result() {
        let (runner_io, coord_io) = tokio::io::duplex(64 * 1024);
        let mut config = BridgeConfig::new("/repo");
        config.result_delivery = ResultDelivery::Consolidated;
        let bridge = Bridge::new(config, catalog());

        let coordinator = tokio::spawn(async move {
            let mut coord: Coordinator = Framed::new(coord_io, FrameCodec::new());
            init(&mut coord, false).await;
            let _ack = coord.next().await.unwrap().unwrap();
            coord.send(test_case("case-9", "tests/broken.rs")).await.unwrap();
            coord.next().await.unwrap().unwrap()
        });

        let summary = bridge.serve(runner_io).await.unwrap();
        let frame = coordinator.await.unwrap();
        let result = &frame["test_result"];
        assert_eq!(result["id"], "case-9");
        assert_eq!(result["display_name"], "tests/broken.rs");
        assert_eq!(result["status"]["type"], "error");
        assert_eq!(result["runtime"], 99_999_999);
        assert_eq!(summary.load_errors, 1);
    }

    #[tokio::test]
    async fn test_fast_exit_closes_without_ack() {
        let (runner_io, coord_io) = tokio::io::duplex(64 * 1024);
        let bridge = Bridge::new(BridgeConfig::new("/repo"), catalog());

        let coordinator = tokio::spawn(async move {
            let mut coord: Coordinator = Framed::new(coord_io, FrameCodec::new());
            init(&mut coord, true).await;
            coord.next().await.is_none()
        });

        let summary = bridge.serve(runner_io).await.unwrap();
        assert!(summary.fast_exit);
        assert!(coordinator.await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_file_is_fatal() {
        let (runner_io, coord_io) = tokio::io::duplex(64 * 1024);
        let bridge = Bridge::new(BridgeConfig::new("/repo"), catalog());

        let coordinator = tokio::spawn(async move {
            let mut coord: Coordinator = Framed::new(coord_io, FrameCodec::new());
            init(&mut coord, false).await;
            let _ack = coord.next().await.unwrap().unwrap();
            coord.send(test_case("case-1", "tests/nope.rs")).await.unwrap();
            coord
        });

        let err = bridge.serve(runner_io).await.unwrap_err();
        match err {
            BridgeError::UnknownTestFile {
                test_case,
                file_name,
            } => {
                assert_eq!(test_case, "case-1");
                assert_eq!(file_name, "tests/nope.rs");
            }
            other => panic!("Expected UnknownTestFile, got {:?}", other),
        }
        drop(coordinator.await.unwrap());
    }

    #[test]
    fn test_manifest_skips_broken_files() {
        let bridge = Bridge::new(BridgeConfig::new("/repo"), catalog());
        let manifest = bridge.manifest();
        assert_eq!(manifest.members.len(), 1);
        assert_eq!(manifest.test_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let bridge = Bridge::new(BridgeConfig::new("/repo"), catalog());
        assert!(matches!(
            bridge.run().await.unwrap_err(),
            BridgeError::MissingSocket
        ));
    }
}
