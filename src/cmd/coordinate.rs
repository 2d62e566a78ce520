//! `gridrun coordinate`: a one-runner coordinator for local use.

use super::demo;
use anyhow::{Context, Result, bail};
use console::style;
use gridrun::TestSource;
use gridrun::coordinator::{CoordinatorReport, ScriptedCoordinator};
use gridrun::suite::{IdScheme, TestIdentity};
use gridrun_proto::{TestCase, TestMeta, TestResult, TestResultStatus};
use std::path::Path;
use std::process::Stdio;
use tokio::net::TcpListener;
use tokio::process::Command;

pub async fn cmd_coordinate(
    root_dir: &Path,
    port: u16,
    files: &[String],
    spawn_runner: bool,
    fast_exit: bool,
) -> Result<()> {
    let test_cases = test_cases(root_dir, files)?;

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to listen on port {}", port))?;
    let addr = listener.local_addr()?;
    eprintln!("Listening on {} ({} test files)", addr, test_cases.len());

    let mut runner = if spawn_runner {
        let exe = std::env::current_exe().context("Failed to locate gridrun executable")?;
        let child = Command::new(exe)
            .arg("--root-dir")
            .arg(root_dir)
            .arg("run")
            .env("GRIDRUN_SOCKET", addr.to_string())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to launch runner")?;
        Some(child)
    } else {
        eprintln!("Start a runner with GRIDRUN_SOCKET={} gridrun run", addr);
        None
    };

    let accepted = match runner.as_mut() {
        Some(child) => tokio::select! {
            accepted = listener.accept() => accepted,
            status = child.wait() => {
                let status = status.context("Failed to wait for runner")?;
                bail!("Runner exited before connecting ({})", status);
            }
        },
        None => listener.accept().await,
    };
    let (stream, peer) = accepted.context("Failed to accept runner")?;
    tracing::info!(%peer, "runner connected");

    let report = ScriptedCoordinator::new(test_cases)
        .with_fast_exit(fast_exit)
        .serve(stream)
        .await?;

    if let Some(ref mut child) = runner {
        let status = child.wait().await.context("Failed to wait for runner")?;
        if !status.success() {
            bail!("Runner exited with {}", status);
        }
    }

    print_report(&report);
    Ok(())
}

/// One test case per file, id'd by its relative path.
fn test_cases(root_dir: &Path, files: &[String]) -> Result<Vec<TestCase>> {
    let names: Vec<String> = if files.is_empty() {
        let catalog = demo::catalog(root_dir);
        let identity = TestIdentity::new(root_dir, IdScheme::default());
        catalog
            .test_files()
            .iter()
            .map(|path| identity.relative_file(path))
            .collect()
    } else {
        files.to_vec()
    };

    if names.is_empty() {
        bail!("No test files to dispatch");
    }

    Ok(names
        .into_iter()
        .map(|name| TestCase {
            id: name.clone(),
            meta: TestMeta::for_file(name),
            focus: None,
        })
        .collect())
}

fn print_report(report: &CoordinatorReport) {
    println!(
        "{} {} {}",
        style("Runner:").bold(),
        report.spawned.adapter_name,
        report.spawned.adapter_version
    );

    let (mut passed, mut failed, mut other) = (0, 0, 0);
    for set in &report.result_sets {
        println!();
        println!("{}", style(&set.test_case.meta.file_name).bold().cyan());
        for result in &set.results {
            match result.status {
                TestResultStatus::Success => passed += 1,
                TestResultStatus::Failure { .. } | TestResultStatus::Error { .. } => failed += 1,
                _ => other += 1,
            }
            print_result(result);
        }
    }

    println!();
    println!(
        "{} {}, {}, {}",
        style("Tests:").bold(),
        style(format!("{} passed", passed)).green(),
        style(format!("{} failed", failed)).red(),
        style(format!("{} not run", other)).yellow()
    );
}

fn print_result(result: &TestResult) {
    let marker = match result.status {
        TestResultStatus::Success => style("✓").green(),
        TestResultStatus::Failure { .. } | TestResultStatus::Error { .. } => style("✗").red(),
        TestResultStatus::Todo => style("✎").cyan(),
        TestResultStatus::Pending | TestResultStatus::Skipped => style("○").yellow(),
    };
    let millis = result.runtime as f64 / 1_000_000.0;
    println!(
        "  {} {} {}",
        marker,
        result.display_name,
        style(format!("({:.1} ms)", millis)).dim()
    );
    for line in result.output.lines() {
        println!("      {}", line);
    }
}
