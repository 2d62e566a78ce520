//! Suite model and test identity.
//!
//! A test file is described by running its definition against a
//! [`SuiteBuilder`]. The result is a [`Suite`]: an arena of describe blocks
//! and tests that doubles as the mutable run state for one engine run.

mod builder;
mod context;
mod id;
mod manifest;
mod tree;

pub use builder::{HookDecl, SuiteBuilder, TestDecl};
pub use context::{LateRegistration, RegistrationAttempt, TestContext};
pub use id::{IdScheme, TestIdentity, index_chain};
pub use manifest::{build_manifest, file_group};
pub use tree::{
    BlockId, Callsite, Child, DescribeBlock, Hook, HookKind, Mode, ROOT_BLOCK_NAME, Suite,
    TestEntry, TestFn, TestFuture, TestRef, TestStatus, test_fn,
};
