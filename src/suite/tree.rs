//! Arena-backed suite tree.
//!
//! Describe blocks and tests live in two flat vectors and refer to each other
//! through [`BlockId`] / [`TestRef`] indices. The tree is built once by
//! [`SuiteBuilder`](super::SuiteBuilder), then mutated in place by a single
//! engine run and thrown away.

use crate::engine::Failure;
use crate::errors::StructuralError;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::TestContext;

/// Name of the implicit top-level describe block. Never shown in titles.
pub const ROOT_BLOCK_NAME: &str = "ROOT_DESCRIBE_BLOCK";

pub type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A test or hook body.
pub type TestFn = Arc<dyn Fn(TestContext) -> TestFuture + Send + Sync>;

/// Wrap an async closure as a [`TestFn`].
pub fn test_fn<F, Fut>(body: F) -> TestFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(body(ctx)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestRef(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Skip,
    Only,
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeAll,
    BeforeEach,
    AfterEach,
    AfterAll,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
            HookKind::AfterAll => "afterAll",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source position where a block, test or hook was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callsite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Callsite {
    pub fn from_location(location: &'static std::panic::Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for Callsite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Clone)]
pub struct Hook {
    pub kind: HookKind,
    pub body: TestFn,
    pub timeout: Option<Duration>,
    pub callsite: Callsite,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("callsite", &self.callsite)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Block(BlockId),
    Test(TestRef),
}

#[derive(Debug)]
pub struct DescribeBlock {
    pub name: String,
    pub mode: Option<Mode>,
    pub parent: Option<BlockId>,
    pub index_in_parent: usize,
    pub children: Vec<Child>,
    pub hooks: Vec<Hook>,
    pub callsite: Callsite,
}

impl DescribeBlock {
    pub fn hooks_of(&self, kind: HookKind) -> Vec<Hook> {
        self.hooks.iter().filter(|h| h.kind == kind).cloned().collect()
    }
}

/// Terminal status the engine dispatched for a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Skip,
    Todo,
    Done,
}

pub struct TestEntry {
    pub name: String,
    pub mode: Option<Mode>,
    pub concurrent: bool,
    pub failing: bool,
    pub parent: BlockId,
    pub index_in_parent: usize,
    pub timeout: Option<Duration>,
    pub body: Option<TestFn>,
    pub callsite: Callsite,

    /// Excluded by a coordinator focus list.
    pub filtered: bool,
    pub errors: Vec<Failure>,
    pub retry_reasons: Vec<Failure>,
    pub status: Option<TestStatus>,
    pub invocations: u32,
    pub started_at: Option<Instant>,
    pub duration: Option<Duration>,
}

impl fmt::Debug for TestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEntry")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("concurrent", &self.concurrent)
            .field("failing", &self.failing)
            .field("parent", &self.parent)
            .field("index_in_parent", &self.index_in_parent)
            .field("filtered", &self.filtered)
            .field("errors", &self.errors.len())
            .field("status", &self.status)
            .field("invocations", &self.invocations)
            .finish_non_exhaustive()
    }
}

/// One test file's suite tree plus its run state.
#[derive(Debug)]
pub struct Suite {
    pub(crate) path: PathBuf,
    pub(crate) blocks: Vec<DescribeBlock>,
    pub(crate) tests: Vec<TestEntry>,
    pub(crate) has_focused_tests: bool,
    /// Errors found while collecting, reported as unhandled once the run starts.
    pub(crate) collection_errors: Vec<StructuralError>,
}

impl Suite {
    pub(crate) fn new(path: PathBuf, callsite: Callsite) -> Self {
        Self {
            path,
            blocks: vec![DescribeBlock {
                name: ROOT_BLOCK_NAME.to_string(),
                mode: None,
                parent: None,
                index_in_parent: 0,
                children: Vec::new(),
                hooks: Vec::new(),
                callsite,
            }],
            tests: Vec::new(),
            has_focused_tests: false,
            collection_errors: Vec::new(),
        }
    }

    /// Absolute path of the test file this suite was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &DescribeBlock {
        &self.blocks[id.0]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut DescribeBlock {
        &mut self.blocks[id.0]
    }

    pub fn test(&self, id: TestRef) -> &TestEntry {
        &self.tests[id.0]
    }

    pub(crate) fn test_mut(&mut self, id: TestRef) -> &mut TestEntry {
        &mut self.tests[id.0]
    }

    pub fn test_refs(&self) -> impl Iterator<Item = TestRef> + '_ {
        (0..self.tests.len()).map(TestRef)
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn has_focused_tests(&self) -> bool {
        self.has_focused_tests
    }

    pub fn collection_errors(&self) -> &[StructuralError] {
        &self.collection_errors
    }

    /// Titles of the describe blocks enclosing `test`, outermost first,
    /// excluding the root.
    pub fn ancestor_titles(&self, test: TestRef) -> Vec<String> {
        let mut titles = Vec::new();
        let mut block = Some(self.test(test).parent);
        while let Some(id) = block {
            let b = self.block(id);
            if b.parent.is_some() {
                titles.push(b.name.clone());
            }
            block = b.parent;
        }
        titles.reverse();
        titles
    }

    /// Ancestor titles plus the test's own name, joined by spaces.
    pub fn full_name(&self, test: TestRef) -> String {
        let mut titles = self.ancestor_titles(test);
        titles.push(self.test(test).name.clone());
        titles.join(" ")
    }

    /// Whether `test` sits anywhere below `block`.
    pub fn is_within(&self, test: TestRef, block: BlockId) -> bool {
        let mut current = Some(self.test(test).parent);
        while let Some(id) = current {
            if id == block {
                return true;
            }
            current = self.block(id).parent;
        }
        false
    }

    /// Every test below `block`, in declaration order.
    pub fn tests_under(&self, block: BlockId) -> Vec<TestRef> {
        let mut out = Vec::new();
        self.collect_tests(block, &mut out);
        out
    }

    fn collect_tests(&self, block: BlockId, out: &mut Vec<TestRef>) {
        for child in &self.block(block).children {
            match *child {
                Child::Block(b) => self.collect_tests(b, out),
                Child::Test(t) => out.push(t),
            }
        }
    }

    /// `beforeEach` hooks outermost-first and `afterEach` hooks
    /// innermost-first for `test`.
    pub fn each_hooks_for(&self, test: TestRef) -> (Vec<Hook>, Vec<Hook>) {
        let mut before_each: Vec<Hook> = Vec::new();
        let mut after_each = Vec::new();
        let mut block = Some(self.test(test).parent);
        while let Some(id) = block {
            let b = self.block(id);
            let mut before_for_block = b.hooks_of(HookKind::BeforeEach);
            before_for_block.extend(before_each);
            before_each = before_for_block;
            after_each.extend(b.hooks_of(HookKind::AfterEach));
            block = b.parent;
        }
        (before_each, after_each)
    }

    /// Whether `block` contains at least one test at any depth.
    pub fn has_tests(&self, block: BlockId) -> bool {
        self.block(block).children.iter().any(|child| match *child {
            Child::Block(b) => self.has_tests(b),
            Child::Test(_) => true,
        })
    }
}
