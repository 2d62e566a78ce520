//! Suite execution engine.
//!
//! A [`SuiteRun`] walks one suite tree:
//! - `beforeAll` hooks, children in declaration order, deferred retries,
//!   then `afterAll` hooks for every describe block
//! - concurrent tests started eagerly on a bounded pool when the root block
//!   is entered, awaited when traversal reaches them
//! - one terminal status per test, pushed to a [`ResultSink`] as soon as it
//!   is known
//!
//! All bookkeeping goes through [`RunState::apply`].

mod failure;
mod invoke;
mod state;


pub use failure::{Failure, FailureOrigin, panic_message};
pub use state::{Event, RunState, TestOutcome};

use crate::suite::{
    BlockId, Child, Hook, HookKind, LateRegistration, Mode, Suite, TestContext, TestIdentity,
    TestRef,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use invoke::{BodyHandle, Invocation, await_body, invoke};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Run-wide engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub test_timeout: Duration,
    pub max_concurrency: usize,
    pub retry_times: u32,
    pub log_errors_before_retry: bool,
    pub test_name_pattern: Option<Regex>,
    pub identity: TestIdentity,
}

impl EngineConfig {
    pub fn new(identity: TestIdentity) -> Self {
        Self {
            test_timeout: DEFAULT_TEST_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry_times: 0,
            log_errors_before_retry: false,
            test_name_pattern: None,
            identity,
        }
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_retry_times(mut self, times: u32) -> Self {
        self.retry_times = times;
        self
    }

    pub fn with_log_errors_before_retry(mut self, log: bool) -> Self {
        self.log_errors_before_retry = log;
        self
    }

    /// Only run tests whose full name matches `pattern`, case-insensitively.
    pub fn with_test_name_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.test_name_pattern = Some(RegexBuilder::new(pattern).case_insensitive(true).build()?);
        Ok(self)
    }
}

/// Receives each reportable terminal outcome, in dispatch order.
#[async_trait]
pub trait ResultSink: Send {
    async fn test_finished(&mut self, outcome: &TestOutcome) -> anyhow::Result<()>;
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub path: PathBuf,
    /// Reported outcomes in dispatch order.
    pub outcomes: Vec<TestOutcome>,
    /// Errors not attributable to a delivered test.
    pub unhandled_errors: Vec<Failure>,
    pub cancelled: bool,
}

impl RunResult {
    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.failed()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0 && self.unhandled_errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    /// The attempt failed and its report is held back for a retry.
    held: bool,
}

/// One execution of one suite.
pub struct SuiteRun<'a> {
    state: RunState,
    config: &'a EngineConfig,
    sink: &'a mut dyn ResultSink,
    cancel: CancellationToken,
    registrations_tx: mpsc::UnboundedSender<LateRegistration>,
    registrations_rx: mpsc::UnboundedReceiver<LateRegistration>,
    concurrent: HashMap<TestRef, BodyHandle>,
    background: Vec<BodyHandle>,
    outcomes: Vec<TestOutcome>,
}

impl<'a> SuiteRun<'a> {
    pub fn new(suite: Suite, config: &'a EngineConfig, sink: &'a mut dyn ResultSink) -> Self {
        let (registrations_tx, registrations_rx) = mpsc::unbounded_channel();
        Self {
            state: RunState::new(suite, config.log_errors_before_retry),
            config,
            sink,
            cancel: CancellationToken::new(),
            registrations_tx,
            registrations_rx,
            concurrent: HashMap::new(),
            background: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Restrict the run to `ids`. An empty list runs everything.
    pub fn with_focus(mut self, ids: &[String]) -> Self {
        let kept = self.state.suite.filter_by_focus(ids, &self.config.identity);
        if !ids.is_empty() {
            debug!(requested = ids.len(), kept, "focus applied");
        }
        self
    }

    /// Stop dispatching tests once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn run(mut self) -> anyhow::Result<RunResult> {
        let root = self.state.suite.root();
        let path = self.state.suite.path().to_path_buf();
        debug!(
            path = %path.display(),
            tests = self.state.suite.test_count(),
            focused = self.state.suite.has_focused_tests(),
            "suite run starting"
        );

        self.state.apply(Event::RunStart);
        let traversal = self.run_describe(root).await;
        self.state.apply(Event::RunFinish);
        self.teardown();
        traversal?;

        for failure in self.state.unhandled_errors() {
            warn!(path = %path.display(), error = %failure.message, "unhandled error");
        }

        Ok(RunResult {
            path,
            outcomes: self.outcomes,
            unhandled_errors: self.state.unhandled_errors,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    fn run_describe(&mut self, block: BlockId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.state.apply(Event::DescribeStart(block));
            let is_root = block == self.state.suite.root();
            let skipped = self.state.suite.block(block).mode == Some(Mode::Skip)
                || self.cancel.is_cancelled();

            if !skipped {
                let before_all = self.state.suite.block(block).hooks_of(HookKind::BeforeAll);
                for hook in &before_all {
                    self.call_hook(hook, block, None).await;
                }
            }

            if is_root {
                self.start_concurrent_tests();
            }

            let children = self.state.suite.block(block).children.clone();
            let mut deferred = Vec::new();
            for child in children {
                match child {
                    Child::Block(inner) => self.run_describe(inner).await?,
                    Child::Test(test) => {
                        let retryable = self.config.retry_times > 0
                            && !self.state.has_errors(test)
                            && !self.state.suite.test(test).concurrent;
                        if self.run_test(test, skipped, retryable).await?.held {
                            deferred.push(test);
                        }
                    }
                }
            }

            for test in deferred {
                self.retry(test, skipped).await?;
            }

            if !skipped {
                let after_all = self.state.suite.block(block).hooks_of(HookKind::AfterAll);
                for hook in &after_all {
                    self.call_hook(hook, block, None).await;
                }
            }

            self.state.apply(Event::DescribeFinish(block));
            Ok(())
        })
    }

    async fn retry(&mut self, test: TestRef, parent_skipped: bool) -> anyhow::Result<()> {
        let mut remaining = self.config.retry_times;
        while remaining > 0 && self.state.has_errors(test) && !self.cancel.is_cancelled() {
            debug!(test = %self.state.suite.test(test).name, remaining, "retrying test");
            self.state.apply(Event::TestRetry(test));
            remaining -= 1;
            if !self.run_test(test, parent_skipped, remaining > 0).await?.held {
                return Ok(());
            }
        }
        // Cancelled between attempts: the last failure still has to go out.
        self.report(test).await
    }

    async fn run_test(
        &mut self,
        test: TestRef,
        parent_skipped: bool,
        hold_on_failure: bool,
    ) -> anyhow::Result<Attempt> {
        self.state.apply(Event::TestStart(test));

        if parent_skipped || self.should_skip(test) {
            let reportable = self.state.apply(Event::TestSkip(test));
            self.notify(reportable).await?;
            return Ok(Attempt { held: false });
        }

        if self.state.suite.test(test).mode == Some(Mode::Todo) {
            let reportable = self.state.apply(Event::TestTodo(test));
            self.notify(reportable).await?;
            return Ok(Attempt { held: false });
        }

        let parent = self.state.suite.test(test).parent;
        let (before_each, after_each) = self.state.suite.each_hooks_for(test);
        for hook in &before_each {
            if self.state.has_errors(test) {
                break;
            }
            self.call_hook(hook, parent, Some(test)).await;
        }

        self.call_test_fn(test).await;

        for hook in &after_each {
            self.call_hook(hook, parent, Some(test)).await;
        }

        let held = hold_on_failure && self.state.has_errors(test);
        let reportable = self.state.apply(Event::TestDone {
            test,
            report: !held,
        });
        self.notify(reportable).await?;
        Ok(Attempt { held })
    }

    fn should_skip(&self, test: TestRef) -> bool {
        let entry = self.state.suite.test(test);
        entry.mode == Some(Mode::Skip)
            || entry.filtered
            || (self.state.suite.has_focused_tests() && entry.mode.is_none())
            || !self.matches_name_pattern(test)
            || self.cancel.is_cancelled()
    }

    fn matches_name_pattern(&self, test: TestRef) -> bool {
        self.config
            .test_name_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&self.state.suite.full_name(test)))
    }

    async fn call_test_fn(&mut self, test: TestRef) {
        self.state.apply(Event::TestFnStart(test));
        let started = self.concurrent.remove(&test);

        if self.state.has_errors(test) {
            if let Some(handle) = started {
                self.background.push(handle);
            }
            return;
        }

        let entry = self.state.suite.test(test);
        let invocation = Invocation {
            origin: FailureOrigin::TestBody,
            is_hook: false,
            limit: entry.timeout.unwrap_or(self.config.test_timeout),
            callsite: entry.callsite,
        };
        let failing = entry.failing;
        let body = entry.body.clone();

        let result = match (started, body) {
            (Some(handle), _) => await_body(handle, invocation, &mut self.background).await,
            (None, Some(body)) => {
                let ctx = self.context_for(Some(test));
                invoke(&body, ctx, invocation, &mut self.background).await
            }
            (None, None) => Ok(()),
        };

        let event = match (result, failing) {
            (Ok(()), false) | (Err(_), true) => Event::TestFnSuccess(test),
            (Ok(()), true) => {
                Event::TestFnFailure(test, Failure::failing_test_passed(invocation.callsite))
            }
            (Err(failure), false) => Event::TestFnFailure(test, failure),
        };
        self.state.apply(event);
        self.drain_registrations();
    }

    async fn call_hook(&mut self, hook: &Hook, block: BlockId, test: Option<TestRef>) {
        self.state.apply(Event::HookStart(hook.kind));
        let invocation = Invocation {
            origin: FailureOrigin::Hook(hook.kind),
            is_hook: true,
            limit: hook.timeout.unwrap_or(self.config.test_timeout),
            callsite: hook.callsite,
        };
        let ctx = self.context_for(test);
        let event = match invoke(&hook.body, ctx, invocation, &mut self.background).await {
            Ok(()) => Event::HookSuccess(hook.kind),
            Err(failure) => Event::HookFailure {
                kind: hook.kind,
                block,
                test,
                failure,
            },
        };
        self.state.apply(event);
        self.drain_registrations();
    }

    fn start_concurrent_tests(&mut self) {
        let mut candidates = Vec::new();
        self.collect_concurrent(self.state.suite.root(), &mut candidates);
        if candidates.is_empty() {
            return;
        }
        debug!(
            count = candidates.len(),
            max_concurrency = self.config.max_concurrency,
            "starting concurrent tests"
        );

        let pool = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        for test in candidates {
            let Some(body) = self.state.suite.test(test).body.clone() else {
                continue;
            };
            let ctx = self.context_for(Some(test));
            let pool = Arc::clone(&pool);
            let handle = tokio::spawn(async move {
                let _permit = pool.acquire_owned().await;
                body(ctx).await
            });
            self.concurrent.insert(test, handle);
        }
    }

    fn collect_concurrent(&self, block: BlockId, out: &mut Vec<TestRef>) {
        let suite = &self.state.suite;
        if suite.block(block).mode == Some(Mode::Skip) {
            return;
        }
        for child in &suite.block(block).children {
            match *child {
                Child::Block(inner) => self.collect_concurrent(inner, out),
                Child::Test(test) => {
                    let entry = suite.test(test);
                    let eligible = entry.concurrent
                        && !matches!(entry.mode, Some(Mode::Skip | Mode::Todo))
                        && !entry.filtered
                        && !(suite.has_focused_tests() && entry.mode != Some(Mode::Only))
                        && self.matches_name_pattern(test);
                    if eligible {
                        out.push(test);
                    }
                }
            }
        }
    }

    fn context_for(&self, test: Option<TestRef>) -> TestContext {
        TestContext::new(
            test,
            test.map(|t| self.state.suite.test(t).name.clone()),
            self.registrations_tx.clone(),
        )
    }

    fn drain_registrations(&mut self) {
        while let Ok(registration) = self.registrations_rx.try_recv() {
            self.state.apply(Event::Registration(registration));
        }
    }

    async fn notify(&mut self, reportable: Option<TestRef>) -> anyhow::Result<()> {
        match reportable {
            Some(test) => self.report(test).await,
            None => Ok(()),
        }
    }

    async fn report(&mut self, test: TestRef) -> anyhow::Result<()> {
        let id = self.config.identity.id_of(&self.state.suite, test);
        let outcome = self.state.outcome(test, id);
        debug!(
            id = %outcome.id,
            status = ?outcome.status,
            errors = outcome.errors.len(),
            "test finished"
        );
        self.sink.test_finished(&outcome).await?;
        self.outcomes.push(outcome);
        Ok(())
    }

    fn teardown(&mut self) {
        let leftover = self.background.len() + self.concurrent.len();
        if leftover > 0 {
            debug!(leftover, "aborting background bodies");
        }
        for handle in self
            .background
            .drain(..)
            .chain(self.concurrent.drain().map(|(_, handle)| handle))
        {
            handle.abort();
        }
    }
}

/// Run `suite` to completion with default focus and no cancellation.
pub async fn run_suite(
    suite: Suite,
    config: &EngineConfig,
    sink: &mut dyn ResultSink,
) -> anyhow::Result<RunResult> {
    SuiteRun::new(suite, config, sink).run().await
}
