//! Runner commands: `gridrun run` and `gridrun manifest`.

use super::demo;
use crate::RunArgs;
use anyhow::{Result, bail};
use gridrun::{Bridge, BridgeConfig};
use gridrun_proto::ManifestMessage;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn cmd_run(root_dir: &Path, args: &RunArgs) -> Result<()> {
    let mut config = BridgeConfig::load(root_dir)?;
    args.apply(&mut config);

    let problems = config.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing the current test and stopping");
            on_signal.cancel();
        }
    });

    let bridge = Bridge::new(config, demo::catalog(root_dir)).with_cancellation(cancel);
    let summary = bridge.run().await?;
    info!(
        test_cases = summary.test_cases,
        results = summary.results_sent,
        failed = summary.failed,
        load_errors = summary.load_errors,
        unhandled = summary.unhandled_errors,
        "runner finished"
    );
    Ok(())
}

pub fn cmd_manifest(root_dir: &Path, sorted: bool) -> Result<()> {
    let config = BridgeConfig::load(root_dir)?;
    let bridge = Bridge::new(config, demo::catalog(root_dir));
    let manifest = bridge.manifest();
    let manifest = if sorted { manifest.sorted() } else { manifest };
    println!(
        "{}",
        serde_json::to_string_pretty(&ManifestMessage { manifest })?
    );
    Ok(())
}
