//! Test-file discovery and loading.

use crate::engine::panic_message;
use crate::errors::SuiteLoadError;
use crate::suite::{Suite, SuiteBuilder};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Registers one file's describe blocks, tests and hooks.
pub type SuiteDefinition = Arc<dyn Fn(&mut SuiteBuilder) + Send + Sync>;

/// Where the bridge finds test files and turns them into suites.
pub trait TestSource: Send + Sync {
    /// Directory test file names are relative to.
    fn root_dir(&self) -> &Path;

    /// Absolute paths of every known test file, in a stable order.
    fn test_files(&self) -> Vec<PathBuf>;

    fn load(&self, path: &Path) -> Result<Suite, SuiteLoadError>;

    /// Map a dispatched file name to a known test file. Relative names are
    /// taken from the root directory.
    fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        let name = Path::new(file_name);
        let path = if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.root_dir().join(name)
        };
        let path = without_cur_dir(&path);
        self.test_files()
            .into_iter()
            .find(|known| without_cur_dir(known) == path)
    }
}

/// Drop `.` components, including a leading one.
fn without_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

/// In-process registry of suite definitions keyed by file path.
///
/// ```
/// use gridrun::source::{SuiteCatalog, TestSource};
///
/// let catalog = SuiteCatalog::new("/repo").with_file("tests/math.rs", |s| {
///     s.test("adds", |_| async { Ok(()) });
/// });
/// let path = catalog.resolve("tests/math.rs").unwrap();
/// assert_eq!(catalog.load(&path).unwrap().test_count(), 1);
/// ```
#[derive(Clone)]
pub struct SuiteCatalog {
    root_dir: PathBuf,
    files: BTreeMap<PathBuf, SuiteDefinition>,
}

impl SuiteCatalog {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn add<F>(&mut self, file: impl AsRef<Path>, define: F)
    where
        F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
    {
        let path = self.root_dir.join(file);
        self.files.insert(path, Arc::new(define));
    }

    pub fn with_file<F>(mut self, file: impl AsRef<Path>, define: F) -> Self
    where
        F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
    {
        self.add(file, define);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl TestSource for SuiteCatalog {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn test_files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    fn load(&self, path: &Path) -> Result<Suite, SuiteLoadError> {
        let define = self
            .files
            .get(path)
            .ok_or_else(|| SuiteLoadError::NotFound {
                path: path.to_path_buf(),
            })?;

        catch_unwind(AssertUnwindSafe(|| {
            let mut builder = SuiteBuilder::new(path);
            define(&mut builder);
            builder.build()
        }))
        .map_err(|payload| SuiteLoadError::Panicked {
            path: path.to_path_buf(),
            message: panic_message(&*payload),
        })
    }
}
