//! Built-in demo catalog served by `run` and listed by `manifest`.

use gridrun::SuiteCatalog;
use gridrun::suite::TestContext;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn catalog(root_dir: &Path) -> SuiteCatalog {
    SuiteCatalog::new(root_dir)
        .with_file("tests/sum.rs", |s| {
            s.describe("sum", |s| {
                s.test("adds", |_| async {
                    anyhow::ensure!(1 + 2 == 3, "1 + 2 should be 3");
                    Ok(())
                });
                s.test("handles negatives", |_| async {
                    anyhow::ensure!(-1 + -2 == -3, "-1 + -2 should be -3");
                    Ok(())
                });
            });
        })
        .with_file("tests/looped.rs", |s| {
            for n in 0..3u32 {
                s.test(format!("squares {}", n), move |_| async move {
                    anyhow::ensure!(n.pow(2) == n * n, "square of {} is wrong", n);
                    Ok(())
                });
            }
        })
        .with_file("tests/failing.rs", |s| {
            s.test("throws", |_| async {
                anyhow::bail!("expected 3, got 4")
            });
            s.test("is known to fail", |_| async {
                anyhow::bail!("tracked upstream")
            })
            .failing();
            s.test("is too slow", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .timeout(Duration::from_millis(20));
        })
        .with_file("tests/skip.rs", |s| {
            s.test("runs", |_| async { Ok(()) });
            s.test("is skipped", |_| async { Ok(()) }).skip();
            s.describe_skip("skipped group", |s| {
                s.test("never runs", |_| async { Ok(()) });
            });
        })
        .with_file("tests/todo.rs", |s| {
            s.test_todo("supports exponents");
            s.test("supports addition", |_| async { Ok(()) });
        })
        .with_file("tests/hooks.rs", |s| {
            let setups = Arc::new(AtomicUsize::new(0));
            s.describe("hooks", |s| {
                let counter = Arc::clone(&setups);
                s.before_each(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                let counter = Arc::clone(&setups);
                s.test("sees one setup", move |ctx: TestContext| {
                    let counter = Arc::clone(&counter);
                    async move {
                        let seen = counter.load(Ordering::SeqCst);
                        anyhow::ensure!(seen >= 1, "{:?} ran before any setup", ctx.test_name());
                        Ok(())
                    }
                });
                s.test("runs concurrently", |_| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                })
                .concurrent();
            });
        })
}
