//! Layered bridge configuration.
//!
//! Settings are read from an optional `gridrun.toml` in the root directory,
//! then overridden by `GRIDRUN_*` environment variables, then by CLI flags
//! (applied by the `run` command).
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! socket = "127.0.0.1:7777"
//! test_timeout_ms = 5000
//! retry_times = 2
//! log_errors_before_retry = true
//! max_concurrency = 5
//! test_name_pattern = "adds"
//! id_scheme = "index_chain"
//!
//! [report]
//! result_delivery = "incremental"
//! elide_internal_frames = true
//! hide_native_output = false
//! ```

use crate::engine::{DEFAULT_MAX_CONCURRENCY, DEFAULT_TEST_TIMEOUT, EngineConfig};
use crate::report::ReportOptions;
use crate::suite::{IdScheme, TestIdentity};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "gridrun.toml";

pub const ENV_SOCKET: &str = "GRIDRUN_SOCKET";
pub const ENV_GENERATE_MANIFEST: &str = "GRIDRUN_GENERATE_MANIFEST";
pub const ENV_HIDE_NATIVE_OUTPUT: &str = "GRIDRUN_HIDE_NATIVE_OUTPUT";
pub const ENV_TEST_TIMEOUT_MS: &str = "GRIDRUN_TEST_TIMEOUT_MS";
pub const ENV_RETRY_TIMES: &str = "GRIDRUN_RETRY_TIMES";
pub const ENV_MAX_CONCURRENCY: &str = "GRIDRUN_MAX_CONCURRENCY";

/// How a file's results travel back to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResultDelivery {
    /// One `incremental_result` per test, then `incremental_result_done`.
    #[default]
    Incremental,
    /// A single `test_results` message per file.
    Consolidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub log_errors_before_retry: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name_pattern: Option<String>,
    #[serde(default)]
    pub id_scheme: IdScheme,
}

fn default_test_timeout_ms() -> u64 {
    DEFAULT_TEST_TIMEOUT.as_millis() as u64
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            socket: None,
            test_timeout_ms: default_test_timeout_ms(),
            retry_times: 0,
            log_errors_before_retry: false,
            max_concurrency: default_max_concurrency(),
            test_name_pattern: None,
            id_scheme: IdScheme::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSection {
    #[serde(default)]
    pub result_delivery: ResultDelivery,
    #[serde(default)]
    pub elide_internal_frames: bool,
    #[serde(default)]
    pub hide_native_output: bool,
}

/// Contents of `gridrun.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridrunToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub report: ReportSection,
}

impl GridrunToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gridrun.toml")
    }

    /// Load `gridrun.toml` from `root_dir`, or defaults when there is none.
    pub fn load_or_default(root_dir: &Path) -> Result<Self> {
        let path = root_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Fully resolved settings for one bridge process.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub root_dir: PathBuf,
    pub socket: Option<String>,
    pub generate_manifest: bool,
    pub hide_native_output: bool,
    pub test_timeout_ms: u64,
    pub retry_times: u32,
    pub log_errors_before_retry: bool,
    pub max_concurrency: usize,
    pub test_name_pattern: Option<String>,
    pub id_scheme: IdScheme,
    pub result_delivery: ResultDelivery,
    pub elide_internal_frames: bool,
}

impl BridgeConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self::from_toml(root_dir, GridrunToml::default())
    }

    pub fn from_toml(root_dir: impl Into<PathBuf>, file: GridrunToml) -> Self {
        Self {
            root_dir: root_dir.into(),
            socket: file.run.socket,
            generate_manifest: false,
            hide_native_output: file.report.hide_native_output,
            test_timeout_ms: file.run.test_timeout_ms,
            retry_times: file.run.retry_times,
            log_errors_before_retry: file.run.log_errors_before_retry,
            max_concurrency: file.run.max_concurrency,
            test_name_pattern: file.run.test_name_pattern,
            id_scheme: file.run.id_scheme,
            result_delivery: file.report.result_delivery,
            elide_internal_frames: file.report.elide_internal_frames,
        }
    }

    /// File settings from `root_dir`, overridden by the process environment.
    pub fn load(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        let file = GridrunToml::load_or_default(&root_dir)?;
        let mut config = Self::from_toml(root_dir, file);
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `GRIDRUN_*` overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.is_empty()) {
            self.socket = Some(socket);
        }
        if let Some(value) = lookup(ENV_GENERATE_MANIFEST) {
            self.generate_manifest = parse_env_bool(ENV_GENERATE_MANIFEST, &value)?;
        }
        if let Some(value) = lookup(ENV_HIDE_NATIVE_OUTPUT) {
            self.hide_native_output = parse_env_bool(ENV_HIDE_NATIVE_OUTPUT, &value)?;
        }
        if let Some(value) = lookup(ENV_TEST_TIMEOUT_MS) {
            self.test_timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_TEST_TIMEOUT_MS, value))?;
        }
        if let Some(value) = lookup(ENV_RETRY_TIMES) {
            self.retry_times = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_RETRY_TIMES, value))?;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_MAX_CONCURRENCY, value))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.max_concurrency == 0 {
            problems.push("max_concurrency must be at least 1".to_string());
        }
        if self.test_timeout_ms == 0 {
            problems.push("test_timeout_ms must be greater than 0".to_string());
        }
        if let Some(ref pattern) = self.test_name_pattern
            && let Err(e) = regex::Regex::new(pattern)
        {
            problems.push(format!("Invalid test_name_pattern '{}': {}", pattern, e));
        }
        if let Some(ref socket) = self.socket
            && !is_valid_socket_addr(socket)
        {
            problems.push(format!(
                "Invalid socket '{}': expected host:port",
                socket
            ));
        }

        problems
    }

    /// The file form of these settings; `generate_manifest` has no file key.
    pub fn to_toml(&self) -> GridrunToml {
        GridrunToml {
            run: RunSection {
                socket: self.socket.clone(),
                test_timeout_ms: self.test_timeout_ms,
                retry_times: self.retry_times,
                log_errors_before_retry: self.log_errors_before_retry,
                max_concurrency: self.max_concurrency,
                test_name_pattern: self.test_name_pattern.clone(),
                id_scheme: self.id_scheme,
            },
            report: ReportSection {
                result_delivery: self.result_delivery,
                elide_internal_frames: self.elide_internal_frames,
                hide_native_output: self.hide_native_output,
            },
        }
    }

    pub fn identity(&self) -> TestIdentity {
        TestIdentity::new(self.root_dir.clone(), self.id_scheme)
    }

    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            elide_internal_frames: self.elide_internal_frames,
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::new(self.identity())
            .with_test_timeout(Duration::from_millis(self.test_timeout_ms))
            .with_max_concurrency(self.max_concurrency)
            .with_retry_times(self.retry_times)
            .with_log_errors_before_retry(self.log_errors_before_retry);
        if let Some(ref pattern) = self.test_name_pattern {
            config = config
                .with_test_name_pattern(pattern)
                .with_context(|| format!("Invalid test name pattern '{}'", pattern))?;
        }
        Ok(config)
    }
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        other => bail!("Invalid {}: '{}' (expected true or false)", key, other),
    }
}

fn is_valid_socket_addr(socket: &str) -> bool {
    match socket.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
