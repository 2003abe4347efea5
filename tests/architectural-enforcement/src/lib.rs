//! Architectural Enforcement Integration Tests
//!
//! Source scanning shared by the tests in `tests/`, which enforce:
//! - No sleep() calls in production code outside request pacing
//! - No blocking I/O inside async functions
//!
//! The scanner is line based. It understands enough Rust to skip comments,
//! inline `#[cfg(test)]` modules and to find the function enclosing a line.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["parley/core/src", "parley/cli/src"];

/// Workspace root, resolved from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Kind of function enclosing a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnKind {
    /// `fn`
    Sync,
    /// `async fn`
    Async,
}

/// Function kind declared on `line`, if it starts a function
#[must_use]
pub fn fn_kind(line: &str) -> Option<FnKind> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }
    if rest.starts_with("async fn ") {
        Some(FnKind::Async)
    } else if rest.starts_with("fn ") {
        Some(FnKind::Sync)
    } else {
        None
    }
}

/// The part of `line` before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// One finding
#[derive(Clone, Debug)]
pub struct Violation {
    /// File the finding is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.message)
    }
}

/// A loaded source file
pub struct SourceFile {
    /// Path on disk
    pub path: PathBuf,
    /// Raw lines
    pub lines: Vec<String>,
    /// Index of the `#[cfg(test)]` line opening an inline test module
    test_module_start: Option<usize>,
}

impl SourceFile {
    /// Load `path`, or `None` if it cannot be read
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(path.to_path_buf(), &content))
    }

    /// Build from in-memory content
    #[must_use]
    pub fn parse(path: PathBuf, content: &str) -> Self {
        let lines: Vec<String> = content.lines().map(String::from).collect();
        let test_module_start = lines.iter().enumerate().find_map(|(idx, line)| {
            if line.trim() != "#[cfg(test)]" {
                return None;
            }
            let next = lines[idx + 1..].iter().find(|l| !l.trim().is_empty())?;
            (next.trim_start().starts_with("mod ") && next.trim_end().ends_with('{')).then_some(idx)
        });
        Self {
            path,
            lines,
            test_module_start,
        }
    }

    /// Whether `path` ends with `suffix` (workspace-relative)
    #[must_use]
    pub fn is(&self, suffix: &str) -> bool {
        self.path.ends_with(suffix)
    }

    /// `(index, code)` of every production line, comments stripped
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        let end = self.test_module_start.unwrap_or(self.lines.len());
        self.lines[..end]
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx, code_part(line)))
    }

    /// Kind of the closest function declared at or above `idx`
    #[must_use]
    pub fn enclosing_fn(&self, idx: usize) -> Option<FnKind> {
        self.lines[..=idx].iter().rev().find_map(|line| fn_kind(line))
    }

    /// Whether any of the `before` lines above `idx` (or `after` below)
    /// contains `needle`
    #[must_use]
    pub fn nearby(&self, idx: usize, before: usize, after: usize, needle: &str) -> bool {
        let start = idx.saturating_sub(before);
        let end = (idx + after + 1).min(self.lines.len());
        self.lines[start..end].iter().any(|l| l.contains(needle))
    }

    /// Record a violation at `idx`
    pub fn violation(&self, idx: usize, message: impl Into<String>) -> Violation {
        Violation {
            path: self.path.clone(),
            line: idx + 1,
            message: format!("{}: {}", message.into(), self.lines[idx].trim()),
        }
    }
}

/// Every `.rs` file under the production trees
#[must_use]
pub fn production_files() -> Vec<SourceFile> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .filter_map(|e| SourceFile::load(e.path()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Print `violations` and fail the test if there are any
///
/// # Panics
///
/// When `violations` is not empty.
pub fn report(title: &str, violations: &[Violation], guidance: &[&str]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ CRITICAL: {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in guidance {
        eprintln!("  {line}");
    }
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_kind_handles_visibility() {
        assert_eq!(fn_kind("    pub async fn load(&self) {"), Some(FnKind::Async));
        assert_eq!(fn_kind("pub(crate) fn emit(&self)"), Some(FnKind::Sync));
        assert_eq!(fn_kind("    let f = fn_kind(line);"), None);
    }

    #[test]
    fn test_inline_test_module_is_skipped() {
        let file = SourceFile::parse(
            PathBuf::from("x.rs"),
            "fn real() {}\n\n#[cfg(test)]\nmod tests {\n    fn helper() {}\n}\n",
        );
        assert_eq!(file.production_lines().count(), 2);
    }

    #[test]
    fn test_out_of_line_test_module_is_not_skipped() {
        let file = SourceFile::parse(
            PathBuf::from("x.rs"),
            "#[cfg(test)]\nmod tests;\n\nfn real() {}\n",
        );
        assert_eq!(file.production_lines().count(), 4);
    }

    #[test]
    fn test_enclosing_fn() {
        let file = SourceFile::parse(
            PathBuf::from("x.rs"),
            "pub fn load() {\n    read();\n}\n\nasync fn run() {\n    read();\n}\n",
        );
        assert_eq!(file.enclosing_fn(1), Some(FnKind::Sync));
        assert_eq!(file.enclosing_fn(5), Some(FnKind::Async));
    }
}
