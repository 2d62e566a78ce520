//! Stack line cleanup.

/// Frames whose symbol contains one of these belong to the runtime or the
/// engine rather than to test code.
const INTERNAL_FRAME_MARKERS: &[&str] = &[
    "gridrun::engine",
    "tokio::",
    "futures_util::",
    "core::ops::function",
    "core::future::",
    "core::panic",
    "std::panicking",
    "std::panic::",
    "std::rt::",
    "std::sys::",
    "std::backtrace",
    "anyhow::",
    "__rust_",
    "<core::pin::Pin",
];

/// Trim leading whitespace and drop blank lines. With `elide_internal`,
/// numbered backtrace frames from [`INTERNAL_FRAME_MARKERS`] are removed
/// together with the `at` line directly after them.
pub fn clean_stack(lines: &[String], elide_internal: bool) -> Vec<String> {
    let mut cleaned = Vec::new();
    let mut after_internal_frame = false;

    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }

        if elide_internal {
            let continues_internal = after_internal_frame && trimmed.starts_with("at ");
            after_internal_frame = false;
            if continues_internal {
                continue;
            }
            if let Some(symbol) = frame_symbol(trimmed)
                && INTERNAL_FRAME_MARKERS.iter().any(|m| symbol.contains(m))
            {
                after_internal_frame = true;
                continue;
            }
        }

        cleaned.push(trimmed.to_string());
    }

    cleaned
}

/// `"12: some::symbol"` → `Some("some::symbol")`.
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(rest.trim_start())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_trims_and_drops_blanks() {
        let cleaned = clean_stack(&lines(&["    at tests/a.rs:1:2", "", "   ", "Caused by: x"]), false);
        assert_eq!(cleaned, vec!["at tests/a.rs:1:2", "Caused by: x"]);
    }

    #[test]
    fn test_elides_internal_frames_with_their_locations() {
        let raw = lines(&[
            "   0: tokio::runtime::task::harness::poll",
            "             at /cargo/tokio/src/runtime/task/harness.rs:10:5",
            "   1: my_tests::adds",
            "             at tests/math.rs:7:9",
            "   2: std::panicking::try",
            "             at /rustc/library/std/src/panicking.rs:1:1",
            "    at tests/math.rs:5:5",
        ]);
        assert_eq!(
            clean_stack(&raw, true),
            vec![
                "1: my_tests::adds",
                "at tests/math.rs:7:9",
                "at tests/math.rs:5:5"
            ]
        );
        assert_eq!(clean_stack(&raw, false).len(), 7);
    }

    #[test]
    fn test_non_frame_lines_reset_internal_state() {
        let raw = lines(&[
            "   0: tokio::spawn",
            "Caused by: disk full",
            "    at tests/io.rs:3:1",
        ]);
        assert_eq!(
            clean_stack(&raw, true),
            vec!["Caused by: disk full", "at tests/io.rs:3:1"]
        );
    }

    #[test]
    fn test_only_the_next_location_belongs_to_an_internal_frame() {
        let raw = lines(&[
            "   0: tokio::runtime::park",
            "             at /cargo/tokio/src/runtime/park.rs:2:2",
            "    at tests/cart.rs:14:5",
            "    at tests/cart.rs:20:1",
        ]);
        assert_eq!(
            clean_stack(&raw, true),
            vec!["at tests/cart.rs:14:5", "at tests/cart.rs:20:1"]
        );
    }
}
