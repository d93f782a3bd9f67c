//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No blocking sleeps in production code
//! - No `unwrap()`/`expect()` outside tests
//! - The core crate stays transport-agnostic (no WebSocket or subscriber setup)
//!
//! The helpers here walk the workspace sources; the checks live in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A source line that broke a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root (two levels above this package)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// All `.rs` files under `<workspace>/<relative>/src`
#[must_use]
pub fn production_sources(relative: &str) -> Vec<PathBuf> {
    let src = workspace_root().join(relative).join("src");
    WalkDir::new(src)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

/// The part of a source file before its `#[cfg(test)]` module
#[must_use]
pub fn non_test_part(source: &str) -> &str {
    source
        .find("#[cfg(test)]")
        .map_or(source, |idx| &source[..idx])
}

/// Find non-comment production lines containing any of `needles`
#[must_use]
pub fn find_in_production(relative: &str, needles: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in production_sources(relative) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in non_test_part(&source).lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            if needles.iter().any(|n| trimmed.contains(n)) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: trimmed.to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_test_part_stops_at_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        assert_eq!(non_test_part(source), "fn a() {}\n");
    }

    #[test]
    fn test_non_test_part_without_tests() {
        assert_eq!(non_test_part("fn a() {}"), "fn a() {}");
    }
}
