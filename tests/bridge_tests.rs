//! End-to-end bridge tests.
//!
//! Each test starts a scripted coordinator on a real TCP listener, points a
//! bridge at it and checks what the coordinator received.

use gridrun::config::ResultDelivery;
use gridrun::coordinator::{CoordinatorReport, ScriptedCoordinator};
use gridrun::{Bridge, BridgeConfig, SessionSummary, SuiteCatalog};
use gridrun_proto::{Focus, ManifestMember, TestCase, TestMeta, TestResult, TestResultStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;

const ROOT: &str = "/repo";

async fn run_session(
    catalog: SuiteCatalog,
    mut config: BridgeConfig,
    script: ScriptedCoordinator,
) -> (SessionSummary, CoordinatorReport) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.socket = Some(listener.local_addr().unwrap().to_string());

    let coordinator = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script.serve(stream).await.unwrap()
    });

    let summary = Bridge::new(config, catalog).run().await.unwrap();
    (summary, coordinator.await.unwrap())
}

fn case(file: &str) -> TestCase {
    TestCase {
        id: file.to_string(),
        meta: TestMeta::for_file(file),
        focus: None,
    }
}

fn ids(results: &[TestResult]) -> Vec<&str> {
    results.iter().map(|r| r.id.as_str()).collect()
}

fn status_types(results: &[TestResult]) -> Vec<&'static str> {
    results
        .iter()
        .map(|r| match r.status {
            TestResultStatus::Success => "success",
            TestResultStatus::Failure { .. } => "failure",
            TestResultStatus::Error { .. } => "error",
            TestResultStatus::Pending => "pending",
            TestResultStatus::Skipped => "skipped",
            TestResultStatus::Todo => "todo",
        })
        .collect()
}

fn five_tests() -> SuiteCatalog {
    SuiteCatalog::new(ROOT).with_file("tests/five.rs", |s| {
        for n in 0..5 {
            s.test(format!("test {}", n), |_| async { Ok(()) });
        }
    })
}

fn flaky_catalog() -> SuiteCatalog {
    SuiteCatalog::new(ROOT).with_file("tests/flaky.rs", |s| {
        let attempts = Arc::new(AtomicUsize::new(0));
        s.test("eventually passes", move |_| {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(n >= 2, "attempt {} failed", n + 1);
                Ok(())
            }
        });
    })
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_dispatch_with_one_throwing_test() {
    let catalog = SuiteCatalog::new(ROOT).with_file("tests/math.rs", |s| {
        s.describe("math", |s| {
            s.test("adds", |_| async { Ok(()) });
            s.test("divides", |_| async { anyhow::bail!("division by zero") });
            s.test("subtracts", |_| async { Ok(()) });
        });
    });

    let (summary, report) = run_session(
        catalog,
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/math.rs")]),
    )
    .await;

    assert_eq!(report.spawned.adapter_name, "gridrun");
    assert_eq!(report.result_sets.len(), 1);
    let results = &report.result_sets[0].results;
    assert_eq!(
        ids(results),
        vec![
            "tests/math.rs#0:0:0",
            "tests/math.rs#1:0:0",
            "tests/math.rs#2:0:0"
        ]
    );
    assert_eq!(status_types(results), vec!["success", "failure", "success"]);
    assert_eq!(results[1].status.exception(), Some("division by zero"));
    assert_eq!(results[1].display_name, "math divides");
    assert_eq!(results[1].lineage, vec!["math"]);
    assert!(results[1].output.starts_with("● math › divides"));
    assert_eq!(summary.results_sent, 3);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_files_are_dispatched_one_at_a_time_in_order() {
    let catalog = SuiteCatalog::new(ROOT)
        .with_file("tests/a.rs", |s| {
            s.test("a", |_| async { Ok(()) });
        })
        .with_file("tests/b.rs", |s| {
            s.test("b1", |_| async { Ok(()) });
            s.test("b2", |_| async { Ok(()) });
        });

    let (summary, report) = run_session(
        catalog,
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/b.rs"), case("tests/a.rs")]),
    )
    .await;

    let files: Vec<&str> = report
        .result_sets
        .iter()
        .map(|set| set.test_case.id.as_str())
        .collect();
    assert_eq!(files, vec!["tests/b.rs", "tests/a.rs"]);
    assert_eq!(report.result_sets[0].results.len(), 2);
    assert_eq!(report.result_sets[1].results.len(), 1);
    assert_eq!(summary.test_cases, 2);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_consolidated_delivery() {
    let mut config = BridgeConfig::new(ROOT);
    config.result_delivery = ResultDelivery::Consolidated;

    let (_, report) = run_session(
        five_tests(),
        config,
        ScriptedCoordinator::new([case("tests/five.rs")]),
    )
    .await;

    assert_eq!(report.result_sets[0].results.len(), 5);
    assert_eq!(report.failed_count(), 0);
}

#[tokio::test]
async fn test_broken_file_yields_single_error_result() {
    let catalog = five_tests().with_file("tests/broken.rs", |_| panic!("fixtures missing"));

    let (summary, report) = run_session(
        catalog,
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/broken.rs"), case("tests/five.rs")]),
    )
    .await;

    let broken = &report.result_sets[0].results;
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].id, "tests/broken.rs");
    assert_eq!(status_types(broken), vec!["error"]);
    assert!(
        broken[0]
            .status
            .exception()
            .unwrap()
            .contains("fixtures missing")
    );
    assert_eq!(report.result_sets[1].results.len(), 5);
    assert_eq!(summary.load_errors, 1);
}

// =============================================================================
// Focus
// =============================================================================

#[tokio::test]
async fn test_focus_narrows_results() {
    let focused = vec![
        "tests/five.rs#0:0".to_string(),
        "tests/five.rs#2:0".to_string(),
        "tests/five.rs#4:0".to_string(),
    ];
    let mut test_case = case("tests/five.rs");
    test_case.focus = Some(Focus {
        test_ids: focused.clone(),
    });

    let (_, report) = run_session(
        five_tests(),
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([test_case]),
    )
    .await;

    let results = &report.result_sets[0].results;
    assert_eq!(results.len(), 3);
    assert_eq!(ids(results), focused.iter().map(String::as_str).collect::<Vec<_>>());
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test]
async fn test_before_all_failure_fails_every_test_in_group() {
    let catalog = SuiteCatalog::new(ROOT).with_file("tests/db.rs", |s| {
        s.describe("db", |s| {
            s.before_all(|_| async { anyhow::bail!("database unavailable") });
            s.test("reads", |_| async { Ok(()) });
            s.test("writes", |_| async { Ok(()) });
        });
    });

    let (summary, report) = run_session(
        catalog,
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/db.rs")]),
    )
    .await;

    let results = &report.result_sets[0].results;
    assert_eq!(status_types(results), vec!["failure", "failure"]);
    for result in results {
        assert_eq!(result.status.exception(), Some("database unavailable"));
    }
    assert_eq!(summary.failed, 2);
}

#[tokio::test]
async fn test_after_all_failure_is_unhandled() {
    let catalog = SuiteCatalog::new(ROOT).with_file("tests/cleanup.rs", |s| {
        s.describe("cleanup", |s| {
            s.after_all(|_| async { anyhow::bail!("cleanup failed") });
            s.test("one", |_| async { Ok(()) });
            s.test("two", |_| async { Ok(()) });
        });
    });

    let (summary, report) = run_session(
        catalog,
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/cleanup.rs")]),
    )
    .await;

    let results = &report.result_sets[0].results;
    assert_eq!(status_types(results), vec!["success", "success"]);
    assert_eq!(summary.unhandled_errors, 1);
    assert!(!summary.is_success());
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retry_until_pass() {
    let mut config = BridgeConfig::new(ROOT);
    config.retry_times = 3;

    let (_, report) = run_session(
        flaky_catalog(),
        config,
        ScriptedCoordinator::new([case("tests/flaky.rs")]),
    )
    .await;

    let results = &report.result_sets[0].results;
    assert_eq!(status_types(results), vec!["success"]);
    assert_eq!(results[0].meta["invocations"], 3);
}

#[tokio::test]
async fn test_retry_exhausted() {
    let mut config = BridgeConfig::new(ROOT);
    config.retry_times = 1;

    let (_, report) = run_session(
        flaky_catalog(),
        config,
        ScriptedCoordinator::new([case("tests/flaky.rs")]),
    )
    .await;

    let results = &report.result_sets[0].results;
    assert_eq!(status_types(results), vec!["failure"]);
    assert_eq!(results[0].status.exception(), Some("attempt 2 failed"));
}

// =============================================================================
// Manifest
// =============================================================================

#[tokio::test]
async fn test_manifest_generation() {
    let catalog = five_tests().with_file("tests/nested.rs", |s| {
        s.describe("outer", |s| {
            s.test("first", |_| async { Ok(()) });
            s.describe("inner", |s| {
                s.test("second", |_| async { Ok(()) });
            });
        });
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = BridgeConfig::new(ROOT);
    config.socket = Some(listener.local_addr().unwrap().to_string());
    config.generate_manifest = true;

    let coordinator = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        ScriptedCoordinator::serve_manifest_request(stream)
            .await
            .unwrap()
    });

    let summary = Bridge::new(config, catalog).run().await.unwrap();
    let (spawned, manifest) = coordinator.await.unwrap();

    assert_eq!(spawned.test_framework, "gridrun");
    assert_eq!(summary.manifest_tests, Some(7));
    assert_eq!(manifest.test_count(), 7);

    let names: Vec<&str> = manifest.members.iter().map(|m| m.sort_key()).collect();
    assert_eq!(names, vec!["tests/five.rs", "tests/nested.rs"]);

    let ManifestMember::Group(nested) = &manifest.members[1] else {
        panic!("Expected a file group");
    };
    let ManifestMember::Group(outer) = &nested.members[0] else {
        panic!("Expected the outer describe group");
    };
    assert_eq!(outer.name, "outer");
    match &outer.members[0] {
        ManifestMember::Test(test) => {
            assert_eq!(test.id, "tests/nested.rs#0:0:0");
            assert_eq!(test.meta.file_name, "tests/nested.rs");
        }
        other => panic!("Expected a test, got {:?}", other),
    }
}

// =============================================================================
// Fast exit
// =============================================================================

#[tokio::test]
async fn test_fast_exit_runs_nothing() {
    let (summary, report) = run_session(
        five_tests(),
        BridgeConfig::new(ROOT),
        ScriptedCoordinator::new([case("tests/five.rs")]).with_fast_exit(true),
    )
    .await;

    assert!(summary.fast_exit);
    assert_eq!(summary.test_cases, 0);
    assert!(report.result_sets.is_empty());
}
