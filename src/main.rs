use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gridrun::config::{BridgeConfig, ResultDelivery};
use gridrun::logging::{LogFormat, init_logging};
use gridrun::suite::IdScheme;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gridrun")]
#[command(version, about = "Run test suites on behalf of a remote coordinator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    /// Directory test file names are relative to (defaults to the current
    /// directory)
    #[arg(long, env = "GRIDRUN_ROOT_DIR", global = true)]
    pub root_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to a coordinator and run the test cases it dispatches
    Run(RunArgs),
    /// Print the manifest of every known test as JSON
    Manifest {
        /// Order every level by name or id
        #[arg(long)]
        sorted: bool,
    },
    /// Listen for one runner and hand it every test file
    Coordinate {
        /// Port to listen on (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Test files to dispatch, relative to the root directory (defaults
        /// to every known file)
        files: Vec<String>,

        /// Launch `gridrun run` against the listener
        #[arg(long)]
        spawn_runner: bool,

        /// Ask the runner to exit without running anything
        #[arg(long)]
        fast_exit: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Overrides layered on top of `gridrun.toml` and the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Coordinator address as host:port
    #[arg(long)]
    pub socket: Option<String>,

    /// Send a manifest instead of running tests
    #[arg(long)]
    pub generate_manifest: bool,

    /// Redirect stdout/stderr to the null device while serving
    #[arg(long)]
    pub hide_native_output: bool,

    #[arg(long)]
    pub retry_times: Option<u32>,

    /// Keep errors from failed attempts on retried tests
    #[arg(long)]
    pub log_errors_before_retry: bool,

    #[arg(long)]
    pub test_timeout_ms: Option<u64>,

    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Only run tests whose full name matches this regex (case-insensitive)
    #[arg(short = 't', long)]
    pub test_name_pattern: Option<String>,

    #[arg(long, value_enum)]
    pub id_scheme: Option<IdScheme>,

    #[arg(long, value_enum)]
    pub result_delivery: Option<ResultDelivery>,

    /// Drop runtime and engine frames from reported backtraces
    #[arg(long)]
    pub elide_internal_frames: bool,
}

impl RunArgs {
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ref socket) = self.socket {
            config.socket = Some(socket.clone());
        }
        config.generate_manifest |= self.generate_manifest;
        config.hide_native_output |= self.hide_native_output;
        config.log_errors_before_retry |= self.log_errors_before_retry;
        config.elide_internal_frames |= self.elide_internal_frames;
        if let Some(times) = self.retry_times {
            config.retry_times = times;
        }
        if let Some(ms) = self.test_timeout_ms {
            config.test_timeout_ms = ms;
        }
        if let Some(max) = self.max_concurrency {
            config.max_concurrency = max;
        }
        if let Some(ref pattern) = self.test_name_pattern {
            config.test_name_pattern = Some(pattern.clone());
        }
        if let Some(scheme) = self.id_scheme {
            config.id_scheme = scheme;
        }
        if let Some(delivery) = self.result_delivery {
            config.result_delivery = delivery;
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    let root_dir = match cli.root_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&root_dir, args).await?,
        Commands::Manifest { sorted } => cmd::cmd_manifest(&root_dir, *sorted)?,
        Commands::Coordinate {
            port,
            files,
            spawn_runner,
            fast_exit,
        } => cmd::cmd_coordinate(&root_dir, *port, files, *spawn_runner, *fast_exit).await?,
        Commands::Config { command } => cmd::cmd_config(&root_dir, command.clone())?,
    }

    Ok(())
}
