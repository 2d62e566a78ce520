//! Handle passed to every running test and hook body.

use super::tree::{Callsite, HookKind, TestRef};
use tokio::sync::mpsc;

/// What a body tried to register after collection had finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationAttempt {
    Test { name: String },
    Describe { name: String },
    Hook { kind: HookKind },
}

/// A registration attempt together with the test that was running when it
/// happened (if any).
#[derive(Debug, Clone)]
pub struct LateRegistration {
    pub owner: Option<TestRef>,
    pub attempt: RegistrationAttempt,
    pub callsite: Callsite,
}

/// Per-invocation context.
///
/// The suite tree is frozen once the run starts. Calls to [`TestContext::test`],
/// [`TestContext::describe`] or [`TestContext::hook`] do not register
/// anything; they are reported to the engine, which records them as
/// structural errors.
#[derive(Debug, Clone)]
pub struct TestContext {
    owner: Option<TestRef>,
    test_name: Option<String>,
    registrations: mpsc::UnboundedSender<LateRegistration>,
}

impl TestContext {
    pub(crate) fn new(
        owner: Option<TestRef>,
        test_name: Option<String>,
        registrations: mpsc::UnboundedSender<LateRegistration>,
    ) -> Self {
        Self {
            owner,
            test_name,
            registrations,
        }
    }

    /// Name of the test this body belongs to. `None` inside `beforeAll` and
    /// `afterAll` hooks.
    pub fn test_name(&self) -> Option<&str> {
        self.test_name.as_deref()
    }

    #[track_caller]
    pub fn test(&self, name: impl Into<String>) {
        self.report(RegistrationAttempt::Test { name: name.into() });
    }

    #[track_caller]
    pub fn describe(&self, name: impl Into<String>) {
        self.report(RegistrationAttempt::Describe { name: name.into() });
    }

    #[track_caller]
    pub fn hook(&self, kind: HookKind) {
        self.report(RegistrationAttempt::Hook { kind });
    }

    #[track_caller]
    fn report(&self, attempt: RegistrationAttempt) {
        let registration = LateRegistration {
            owner: self.owner,
            attempt,
            callsite: Callsite::from_location(std::panic::Location::caller()),
        };
        // The engine drops its receiver at teardown; bodies still running in
        // the background after that have nobody left to tell.
        let _ = self.registrations.send(registration);
    }
}
