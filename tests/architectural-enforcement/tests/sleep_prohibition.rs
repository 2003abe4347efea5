//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Waiting happens on
//! I/O, channels, timers owned by a session, or `tokio::time::interval`.
//! **Exception**: request pacing in `store/pacing.rs`, the one place that
//! deliberately delays a request.

use architectural_enforcement::{production_files, report, SourceFile, Violation};

/// Files allowed to sleep
const PACING_FILES: &[&str] = &["store/pacing.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<Violation> = production_files().iter().flat_map(sleep_violations).collect();

    report(
        "Sleep calls found in production code!",
        &violations,
        &[
            "✅ ACCEPTABLE: request pacing in store/pacing.rs, tokio::time::interval,",
            "   session timers built on sleep_until, test code",
            "❌ FORBIDDEN: sleep in polling loops or as poor man's synchronization",
        ],
    );
}

fn sleep_violations(file: &SourceFile) -> Vec<Violation> {
    if PACING_FILES.iter().any(|allowed| file.is(allowed)) {
        return Vec::new();
    }

    file.production_lines()
        .filter(|(_, code)| code.contains("::sleep(") || code.contains(".sleep("))
        .filter(|(idx, _)| !is_interval_pattern(file, *idx))
        .map(|(idx, _)| file.violation(idx, "sleep call"))
        .collect()
}

/// Periodic work driven by `tokio::time::interval` is fine
fn is_interval_pattern(file: &SourceFile, idx: usize) -> bool {
    file.nearby(idx, 20, 5, "tokio::time::interval") || file.nearby(idx, 20, 5, ".tick()")
}

#[test]
fn test_detector_flags_sleep() {
    let file = SourceFile::parse(
        "parley/core/src/store/mod.rs".into(),
        "async fn wait() {\n    tokio::time::sleep(Duration::from_millis(10)).await;\n}\n",
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_pacing_and_timers() {
    let pacing = SourceFile::parse(
        "parley/core/src/store/pacing.rs".into(),
        "async fn settle() {\n    tokio::time::sleep(pause).await;\n}\n",
    );
    assert!(sleep_violations(&pacing).is_empty());

    let timer = SourceFile::parse(
        "parley/core/src/streaming/timer.rs".into(),
        "async fn fired(&self) {\n    tokio::time::sleep_until(deadline).await;\n}\n",
    );
    assert!(sleep_violations(&timer).is_empty());
}
