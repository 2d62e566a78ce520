//! Stable test identifiers.

use super::tree::{Suite, TestRef};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How test ids are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// `file#i0:i1:…:0` from sibling indices up to the root.
    #[default]
    IndexChain,
    /// `file:line:column#i0:…:0`, prefixing the chain with the registration
    /// callsite.
    Callsite,
}

/// Computes ids relative to a root directory.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    root_dir: PathBuf,
    scheme: IdScheme,
}

impl TestIdentity {
    pub fn new(root_dir: impl Into<PathBuf>, scheme: IdScheme) -> Self {
        Self {
            root_dir: root_dir.into(),
            scheme,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn scheme(&self) -> IdScheme {
        self.scheme
    }

    /// `path` relative to the root, `/`-separated. Paths outside the root are
    /// kept as given.
    pub fn relative_file(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root_dir).unwrap_or(path);
        relative
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
            .replace("//", "/")
    }

    pub fn id_of(&self, suite: &Suite, test: TestRef) -> String {
        let file = self.relative_file(suite.path());
        let chain = index_chain(suite, test)
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(":");
        match self.scheme {
            IdScheme::IndexChain => format!("{}#{}", file, chain),
            IdScheme::Callsite => {
                let callsite = suite.test(test).callsite;
                format!("{}:{}:{}#{}", file, callsite.line, callsite.column, chain)
            }
        }
    }
}

/// Sibling indices from the test up through every enclosing block, ending
/// with the root's own index (always 0).
pub fn index_chain(suite: &Suite, test: TestRef) -> Vec<usize> {
    let entry = suite.test(test);
    let mut chain = vec![entry.index_in_parent];
    let mut block = Some(entry.parent);
    while let Some(id) = block {
        let b = suite.block(id);
        chain.push(b.index_in_parent);
        block = b.parent;
    }
    chain
}

impl Suite {
    /// Mark every test whose id is not in `ids` as filtered. An empty list
    /// leaves the suite untouched. Returns the number of tests kept.
    pub fn filter_by_focus(&mut self, ids: &[String], identity: &TestIdentity) -> usize {
        if ids.is_empty() {
            return self.test_count();
        }
        let mut kept = 0;
        for test in (0..self.tests.len()).map(TestRef) {
            let id = identity.id_of(self, test);
            let focused = ids.iter().any(|wanted| *wanted == id);
            self.test_mut(test).filtered = !focused;
            kept += usize::from(focused);
        }
        kept
    }
}
