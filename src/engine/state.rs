//! Run state and its transition function.
//!
//! Every change the engine makes to a suite during a run goes through
//! [`RunState::apply`]. The function returns the test whose terminal status
//! should be reported, if any, so the caller decides when to talk to the
//! protocol layer.

use super::failure::Failure;
use crate::errors::StructuralError;
use crate::suite::{
    BlockId, Callsite, HookKind, LateRegistration, RegistrationAttempt, Suite, TestRef, TestStatus,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Engine events, in the order a run produces them.
#[derive(Debug)]
pub enum Event {
    RunStart,
    RunFinish,
    DescribeStart(BlockId),
    DescribeFinish(BlockId),
    TestStart(TestRef),
    TestSkip(TestRef),
    TestTodo(TestRef),
    /// `report` is false while a failed attempt is held back for retry.
    TestDone {
        test: TestRef,
        report: bool,
    },
    TestFnStart(TestRef),
    TestFnSuccess(TestRef),
    TestFnFailure(TestRef, Failure),
    HookStart(HookKind),
    HookSuccess(HookKind),
    HookFailure {
        kind: HookKind,
        block: BlockId,
        test: Option<TestRef>,
        failure: Failure,
    },
    TestRetry(TestRef),
    Registration(LateRegistration),
}

/// Snapshot of a finished test handed to result sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub id: String,
    pub name: String,
    pub ancestors: Vec<String>,
    pub file: PathBuf,
    pub status: TestStatus,
    pub errors: Vec<Failure>,
    pub retry_reasons: Vec<Failure>,
    pub duration: Option<Duration>,
    pub invocations: u32,
    pub callsite: Callsite,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Done && self.errors.is_empty()
    }

    pub fn failed(&self) -> bool {
        self.status == TestStatus::Done && !self.errors.is_empty()
    }

    /// Ancestor titles and the test name joined by spaces.
    pub fn full_name(&self) -> String {
        let mut titles = self.ancestors.clone();
        titles.push(self.name.clone());
        titles.join(" ")
    }
}

#[derive(Debug)]
pub struct RunState {
    pub(crate) suite: Suite,
    pub(crate) unhandled_errors: Vec<Failure>,
    has_started: bool,
    currently_running: Option<TestRef>,
    log_errors_before_retry: bool,
}

impl RunState {
    pub fn new(suite: Suite, log_errors_before_retry: bool) -> Self {
        Self {
            suite,
            unhandled_errors: Vec::new(),
            has_started: false,
            currently_running: None,
            log_errors_before_retry,
        }
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    pub fn unhandled_errors(&self) -> &[Failure] {
        &self.unhandled_errors
    }

    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn currently_running(&self) -> Option<TestRef> {
        self.currently_running
    }

    pub fn has_errors(&self, test: TestRef) -> bool {
        !self.suite.test(test).errors.is_empty()
    }

    pub fn apply(&mut self, event: Event) -> Option<TestRef> {
        tracing::trace!(?event, "engine event");
        match event {
            Event::RunStart => {
                self.has_started = true;
                let root = self.suite.block(self.suite.root()).callsite;
                let collected: Vec<Failure> = self
                    .suite
                    .collection_errors()
                    .iter()
                    .map(|err| Failure::structural(err, root))
                    .collect();
                self.unhandled_errors.extend(collected);
                None
            }
            Event::RunFinish => {
                self.currently_running = None;
                None
            }
            Event::DescribeStart(_) | Event::DescribeFinish(_) => None,
            Event::TestStart(test) => {
                self.currently_running = Some(test);
                let entry = self.suite.test_mut(test);
                entry.invocations += 1;
                entry.started_at = Some(Instant::now());
                entry.status = None;
                None
            }
            Event::TestSkip(test) => self.finish(test, TestStatus::Skip, true),
            Event::TestTodo(test) => self.finish(test, TestStatus::Todo, true),
            Event::TestDone { test, report } => self.finish(test, TestStatus::Done, report),
            Event::TestFnStart(_) | Event::TestFnSuccess(_) => None,
            Event::TestFnFailure(test, failure) => {
                self.suite.test_mut(test).errors.push(failure);
                None
            }
            Event::HookStart(_) | Event::HookSuccess(_) => None,
            Event::HookFailure {
                kind,
                block,
                test,
                failure,
            } => {
                match (kind, test) {
                    (HookKind::BeforeAll, _) => {
                        for t in self.suite.tests_under(block) {
                            self.suite.test_mut(t).errors.push(failure.clone());
                        }
                    }
                    (HookKind::AfterAll, _) => {
                        tracing::warn!(message = %failure.message, "afterAll hook failed");
                        self.unhandled_errors.push(failure);
                    }
                    (HookKind::BeforeEach | HookKind::AfterEach, Some(t)) => {
                        self.suite.test_mut(t).errors.push(failure);
                    }
                    (HookKind::BeforeEach | HookKind::AfterEach, None) => {
                        self.unhandled_errors.push(failure);
                    }
                }
                None
            }
            Event::TestRetry(test) => {
                let log = self.log_errors_before_retry;
                let entry = self.suite.test_mut(test);
                let errors = std::mem::take(&mut entry.errors);
                if log {
                    entry.retry_reasons.extend(errors);
                }
                None
            }
            Event::Registration(registration) => {
                self.on_registration(registration);
                None
            }
        }
    }

    fn finish(&mut self, test: TestRef, status: TestStatus, report: bool) -> Option<TestRef> {
        let entry = self.suite.test_mut(test);
        entry.status = Some(status);
        entry.duration = entry.started_at.map(|start| start.elapsed());
        if self.currently_running == Some(test) {
            self.currently_running = None;
        }
        (report && !entry.filtered).then_some(test)
    }

    fn on_registration(&mut self, registration: LateRegistration) {
        let LateRegistration {
            owner,
            attempt,
            callsite,
        } = registration;

        // A body can only be "inside" a test while that test has not yet
        // reached a terminal status.
        let running = owner.filter(|t| self.has_started && self.suite.test(*t).status.is_none());

        let error = match (running, attempt) {
            (Some(t), RegistrationAttempt::Test { name }) => StructuralError::NestedTest {
                test: name,
                parent: self.suite.test(t).name.clone(),
            },
            (Some(t), RegistrationAttempt::Hook { kind }) => StructuralError::HookInsideTest {
                kind,
                parent: self.suite.test(t).name.clone(),
            },
            (Some(t), RegistrationAttempt::Describe { name }) => StructuralError::NestedDescribe {
                describe: name,
                parent: self.suite.test(t).name.clone(),
            },
            (None, RegistrationAttempt::Test { .. }) => StructuralError::TestAfterStart,
            (None, RegistrationAttempt::Hook { .. }) => StructuralError::HookAfterStart,
            (None, RegistrationAttempt::Describe { .. }) => StructuralError::DescribeAfterStart,
        };

        let failure = Failure::structural(&error, callsite);
        match running {
            Some(t) => self.suite.test_mut(t).errors.push(failure),
            None => {
                tracing::warn!(error = %error, "registration after run start");
                self.unhandled_errors.push(failure);
            }
        }
    }

    /// Snapshot `test` for reporting.
    pub fn outcome(&self, test: TestRef, id: String) -> TestOutcome {
        let entry = self.suite.test(test);
        TestOutcome {
            id,
            name: entry.name.clone(),
            ancestors: self.suite.ancestor_titles(test),
            file: self.suite.path().to_path_buf(),
            status: entry.status.unwrap_or(TestStatus::Done),
            errors: entry.errors.clone(),
            retry_reasons: entry.retry_reasons.clone(),
            duration: entry.duration,
            invocations: entry.invocations,
            callsite: entry.callsite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureOrigin;
    use crate::suite::SuiteBuilder;

    fn state_with(define: impl FnOnce(&mut SuiteBuilder)) -> RunState {
        let mut s = SuiteBuilder::new("/r/f.rs");
        define(&mut s);
        RunState::new(s.build(), false)
    }

    fn callsite() -> Callsite {
        Callsite {
            file: "f.rs",
            line: 1,
            column: 1,
        }
    }

    fn first(state: &RunState) -> TestRef {
        state.suite().test_refs().next().unwrap()
    }

    #[test]
    fn test_done_reports_once_and_records_duration() {
        let mut state = state_with(|s| {
            s.test("a", |_| async { Ok(()) });
        });
        let t = first(&state);
        state.apply(Event::RunStart);
        assert_eq!(state.apply(Event::TestStart(t)), None);
        assert_eq!(state.currently_running(), Some(t));
        assert_eq!(state.apply(Event::TestDone { test: t, report: true }), Some(t));
        assert_eq!(state.currently_running(), None);
        assert!(state.suite().test(t).duration.is_some());
        assert_eq!(state.suite().test(t).invocations, 1);
    }

    #[test]
    fn test_filtered_tests_are_never_reported() {
        let mut state = state_with(|s| {
            s.test("a", |_| async { Ok(()) });
        });
        let t = first(&state);
        state.suite.test_mut(t).filtered = true;
        state.apply(Event::TestStart(t));
        assert_eq!(state.apply(Event::TestSkip(t)), None);
        assert_eq!(state.suite().test(t).status, Some(TestStatus::Skip));
    }

    #[test]
    fn test_held_attempt_is_not_reported() {
        let mut state = state_with(|s| {
            s.test("a", |_| async { Ok(()) });
        });
        let t = first(&state);
        state.apply(Event::TestStart(t));
        assert_eq!(state.apply(Event::TestDone { test: t, report: false }), None);
    }

    #[test]
    fn test_before_all_failure_hits_every_test_under_block() {
        let mut state = state_with(|s| {
            s.describe("g", |s| {
                s.test("a", |_| async { Ok(()) });
                s.test("b", |_| async { Ok(()) });
            });
            s.test("outside", |_| async { Ok(()) });
        });
        let block = match state.suite().block(state.suite().root()).children[0] {
            crate::suite::Child::Block(b) => b,
            _ => panic!("Expected block"),
        };
        state.apply(Event::HookFailure {
            kind: HookKind::BeforeAll,
            block,
            test: None,
            failure: Failure::new("setup broke", FailureOrigin::Hook(HookKind::BeforeAll)),
        });
        let errors: Vec<usize> = state
            .suite()
            .test_refs()
            .map(|t| state.suite().test(t).errors.len())
            .collect();
        assert_eq!(errors, vec![1, 1, 0]);
        assert!(state.unhandled_errors().is_empty());
    }

    #[test]
    fn test_after_all_failure_is_unhandled() {
        let mut state = state_with(|s| {
            s.test("a", |_| async { Ok(()) });
        });
        let root = state.suite().root();
        state.apply(Event::HookFailure {
            kind: HookKind::AfterAll,
            block: root,
            test: None,
            failure: Failure::new("teardown broke", FailureOrigin::Hook(HookKind::AfterAll)),
        });
        assert_eq!(state.unhandled_errors().len(), 1);
        assert!(state.suite().test(first(&state)).errors.is_empty());
    }

    #[test]
    fn test_retry_clears_errors_and_optionally_keeps_reasons() {
        for log in [false, true] {
            let mut s = SuiteBuilder::new("/r/f.rs");
            s.test("a", |_| async { Ok(()) });
            let mut state = RunState::new(s.build(), log);
            let t = first(&state);
            state.apply(Event::TestFnFailure(t, Failure::new("nope", FailureOrigin::TestBody)));
            state.apply(Event::TestRetry(t));
            assert!(!state.has_errors(t));
            assert_eq!(state.suite().test(t).retry_reasons.len(), usize::from(log));
        }
    }

    #[test]
    fn test_registration_inside_running_test_attaches_to_it() {
        let mut state = state_with(|s| {
            s.test("outer", |_| async { Ok(()) });
        });
        let t = first(&state);
        state.apply(Event::RunStart);
        state.apply(Event::TestStart(t));
        state.apply(Event::Registration(LateRegistration {
            owner: Some(t),
            attempt: RegistrationAttempt::Test {
                name: "inner".to_string(),
            },
            callsite: callsite(),
        }));
        let errors = &state.suite().test(t).errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Tests cannot be nested. Test \"inner\" cannot run because it is nested within \"outer\"."
        );
    }

    #[test]
    fn test_registration_outside_any_test_is_unhandled() {
        let mut state = state_with(|s| {
            s.test("a", |_| async { Ok(()) });
        });
        state.apply(Event::RunStart);
        state.apply(Event::Registration(LateRegistration {
            owner: None,
            attempt: RegistrationAttempt::Hook {
                kind: HookKind::BeforeEach,
            },
            callsite: callsite(),
        }));
        assert_eq!(
            state.unhandled_errors()[0].message,
            "Cannot add a hook after tests have started running. Hooks must be defined synchronously."
        );
    }

    #[test]
    fn test_collection_errors_surface_at_run_start() {
        let mut state = state_with(|s| {
            s.describe("empty", |s| {
                s.before_all(|_| async { Ok(()) });
            });
        });
        assert!(state.unhandled_errors().is_empty());
        state.apply(Event::RunStart);
        assert!(state.has_started());
        assert_eq!(state.unhandled_errors().len(), 1);
        assert!(state.unhandled_errors()[0].message.starts_with("Invalid: beforeAll()"));
    }
}
