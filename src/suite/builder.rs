//! Synchronous collection phase.

use super::tree::{
    BlockId, Callsite, Child, DescribeBlock, Hook, HookKind, Mode, Suite, TestEntry, TestFn,
    TestRef, test_fn,
};
use super::context::TestContext;
use crate::errors::StructuralError;
use std::future::Future;
use std::panic::Location;
use std::path::PathBuf;
use std::time::Duration;

/// Registers describe blocks, tests and hooks for one test file.
///
/// ```
/// use gridrun::suite::SuiteBuilder;
///
/// let mut s = SuiteBuilder::new("/repo/tests/math.rs");
/// s.describe("math", |s| {
///     s.test("adds", |_| async { Ok(()) });
///     s.test("subtracts", |_| async { Ok(()) }).skip();
/// });
/// let suite = s.build();
/// assert_eq!(suite.test_count(), 2);
/// ```
pub struct SuiteBuilder {
    suite: Suite,
    current: BlockId,
}

impl SuiteBuilder {
    #[track_caller]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let suite = Suite::new(path.into(), Callsite::from_location(Location::caller()));
        let current = suite.root();
        Self { suite, current }
    }

    #[track_caller]
    pub fn describe(
        &mut self,
        name: impl Into<String>,
        define: impl FnOnce(&mut SuiteBuilder),
    ) -> &mut Self {
        self.add_describe(name.into(), None, Location::caller(), define)
    }

    #[track_caller]
    pub fn describe_only(
        &mut self,
        name: impl Into<String>,
        define: impl FnOnce(&mut SuiteBuilder),
    ) -> &mut Self {
        self.add_describe(name.into(), Some(Mode::Only), Location::caller(), define)
    }

    #[track_caller]
    pub fn describe_skip(
        &mut self,
        name: impl Into<String>,
        define: impl FnOnce(&mut SuiteBuilder),
    ) -> &mut Self {
        self.add_describe(name.into(), Some(Mode::Skip), Location::caller(), define)
    }

    #[track_caller]
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> TestDecl<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let test = self.add_test(name.into(), Some(test_fn(body)), None, Location::caller());
        TestDecl {
            suite: &mut self.suite,
            test,
        }
    }

    #[track_caller]
    pub fn test_todo(&mut self, name: impl Into<String>) -> TestDecl<'_> {
        let test = self.add_test(name.into(), None, Some(Mode::Todo), Location::caller());
        TestDecl {
            suite: &mut self.suite,
            test,
        }
    }

    #[track_caller]
    pub fn before_all<F, Fut>(&mut self, body: F) -> HookDecl<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeAll, test_fn(body), Location::caller())
    }

    #[track_caller]
    pub fn before_each<F, Fut>(&mut self, body: F) -> HookDecl<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeEach, test_fn(body), Location::caller())
    }

    #[track_caller]
    pub fn after_each<F, Fut>(&mut self, body: F) -> HookDecl<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterEach, test_fn(body), Location::caller())
    }

    #[track_caller]
    pub fn after_all<F, Fut>(&mut self, body: F) -> HookDecl<'_>
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterAll, test_fn(body), Location::caller())
    }

    /// Finish collection.
    pub fn build(mut self) -> Suite {
        let focused = self.suite.tests.iter().any(|t| {
            t.mode == Some(Mode::Only) && self.suite.block(t.parent).mode != Some(Mode::Skip)
        });
        self.suite.has_focused_tests |= focused;
        self.suite
    }

    fn add_describe(
        &mut self,
        name: String,
        mode: Option<Mode>,
        location: &'static Location<'static>,
        define: impl FnOnce(&mut SuiteBuilder),
    ) -> &mut Self {
        let parent = self.current;
        let inherited = self.suite.block(parent).mode;
        let id = BlockId(self.suite.blocks.len());
        let index_in_parent = self.suite.block(parent).children.len();

        if mode == Some(Mode::Only) {
            self.suite.has_focused_tests = true;
        }

        self.suite.blocks.push(DescribeBlock {
            name,
            mode: mode.or(inherited),
            parent: Some(parent),
            index_in_parent,
            children: Vec::new(),
            hooks: Vec::new(),
            callsite: Callsite::from_location(location),
        });
        self.suite.block_mut(parent).children.push(Child::Block(id));

        self.current = id;
        define(self);
        self.finish_describe(id);
        self.current = parent;
        self
    }

    fn finish_describe(&mut self, id: BlockId) {
        if !self.suite.has_tests(id) {
            let kinds: Vec<HookKind> = self.suite.block(id).hooks.iter().map(|h| h.kind).collect();
            self.suite
                .collection_errors
                .extend(kinds.into_iter().map(|kind| StructuralError::HookWithoutTests { kind }));
        }

        let block = self.suite.block(id);
        let mode = block.mode;
        let has_only_test = block.children.iter().any(|child| match *child {
            Child::Test(t) => self.suite.test(t).mode == Some(Mode::Only),
            Child::Block(_) => false,
        });
        if mode == Some(Mode::Only) && has_only_test {
            return;
        }

        let direct_tests: Vec<TestRef> = block
            .children
            .iter()
            .filter_map(|child| match *child {
                Child::Test(t) => Some(t),
                Child::Block(_) => None,
            })
            .collect();
        for t in direct_tests {
            let test = self.suite.test_mut(t);
            if test.mode.is_none() {
                test.mode = mode;
            }
        }
    }

    fn add_test(
        &mut self,
        name: String,
        body: Option<TestFn>,
        mode: Option<Mode>,
        location: &'static Location<'static>,
    ) -> TestRef {
        let parent = self.current;
        let index_in_parent = self.suite.block(parent).children.len();
        let test = TestRef(self.suite.tests.len());
        self.suite.tests.push(TestEntry {
            name,
            mode,
            concurrent: false,
            failing: false,
            parent,
            index_in_parent,
            timeout: None,
            body,
            callsite: Callsite::from_location(location),
            filtered: false,
            errors: Vec::new(),
            retry_reasons: Vec::new(),
            status: None,
            invocations: 0,
            started_at: None,
            duration: None,
        });
        self.suite.block_mut(parent).children.push(Child::Test(test));
        test
    }

    fn add_hook(
        &mut self,
        kind: HookKind,
        body: TestFn,
        location: &'static Location<'static>,
    ) -> HookDecl<'_> {
        let block = self.current;
        let hooks = &mut self.suite.block_mut(block).hooks;
        hooks.push(Hook {
            kind,
            body,
            timeout: None,
            callsite: Callsite::from_location(location),
        });
        let index = hooks.len() - 1;
        HookDecl {
            hook: &mut hooks[index],
        }
    }
}

/// Modifiers for a freshly registered test.
pub struct TestDecl<'a> {
    suite: &'a mut Suite,
    test: TestRef,
}

impl TestDecl<'_> {
    pub fn only(self) -> Self {
        self.suite.test_mut(self.test).mode = Some(Mode::Only);
        self
    }

    pub fn skip(self) -> Self {
        self.suite.test_mut(self.test).mode = Some(Mode::Skip);
        self
    }

    /// Start the body eagerly on the shared concurrency pool.
    pub fn concurrent(self) -> Self {
        self.suite.test_mut(self.test).concurrent = true;
        self
    }

    /// The body is expected to fail; a passing body fails the test.
    pub fn failing(self) -> Self {
        self.suite.test_mut(self.test).failing = true;
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.suite.test_mut(self.test).timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> TestRef {
        self.test
    }
}

pub struct HookDecl<'a> {
    hook: &'a mut Hook,
}

impl HookDecl<'_> {
    pub fn timeout(self, timeout: Duration) -> Self {
        self.hook.timeout = Some(timeout);
        self
    }
}
