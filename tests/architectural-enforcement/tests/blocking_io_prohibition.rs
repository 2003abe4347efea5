//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async production code MUST NOT use blocking I/O.
//! **Required**: `tokio::fs` and `reqwest` async calls, not `std::fs`,
//! `std::net` or `reqwest::blocking`.
//! **Acceptable**: blocking calls in plain `fn`s that run before or outside
//! the runtime (configuration loading), and test code.

use architectural_enforcement::{
    production_files, report, FnKind, SourceFile, Violation,
};

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<Violation> = production_files().iter().flat_map(blocking_io_violations).collect();

    report(
        "Blocking I/O calls found in production code!",
        &violations,
        &[
            "❌ FORBIDDEN in async fns: std::fs, std::net, std::process::Command,",
            "   reqwest::blocking, std::io::stdin()/stdout()",
            "✅ REQUIRED: tokio::fs, reqwest async client",
            "✅ ACCEPTABLE: non-async functions, test code",
        ],
    );
}

fn blocking_io_violations(file: &SourceFile) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (idx, code) in file.production_lines() {
        if code.contains("reqwest::blocking") {
            violations.push(file.violation(idx, "Blocking HTTP client"));
            continue;
        }

        let in_sync_fn = file.enclosing_fn(idx) == Some(FnKind::Sync);
        if in_sync_fn {
            continue;
        }

        if code.contains("std::fs::") || code.contains("use std::fs") {
            violations.push(file.violation(idx, "Blocking file I/O"));
        }
        if code.contains("std::net::") || code.contains("use std::net") {
            violations.push(file.violation(idx, "Blocking network I/O"));
        }
        if code.contains("std::process::Command") {
            violations.push(file.violation(idx, "Blocking process I/O"));
        }
        if file.enclosing_fn(idx) == Some(FnKind::Async)
            && (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
        {
            violations.push(file.violation(idx, "Blocking stdin/stdout in async"));
        }
    }

    violations
}

#[test]
fn test_detector_flags_fs_in_async_fn() {
    let file = SourceFile::parse(
        "parley/core/src/persist.rs".into(),
        "pub async fn load(&self) {\n    let s = std::fs::read_to_string(&self.path);\n}\n",
    );
    assert_eq!(blocking_io_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_fs_in_sync_fn() {
    let file = SourceFile::parse(
        "parley/core/src/config/mod.rs".into(),
        "pub fn load_config_from_path(path: &Path) {\n    let s = std::fs::read_to_string(path);\n}\n",
    );
    assert!(blocking_io_violations(&file).is_empty());
}

#[test]
fn test_detector_skips_inline_tests() {
    let file = SourceFile::parse(
        "parley/core/src/persist.rs".into(),
        "fn real() {}\n\n#[cfg(test)]\nmod tests {\n    async fn t() { std::fs::write(\"x\", \"y\"); }\n}\n",
    );
    assert!(blocking_io_violations(&file).is_empty());
}
