use regex::Regex;
use std::sync::LazyLock;

/// Directory prefixes artifacts are allowed to target.
const ALLOWED_ROOTS: &[&str] = &["src/", "tests/", "docs/", "config/"];

/// Maximum artifact content size in bytes.
const MAX_CONTENT_BYTES: usize = 512 * 1024;

static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"(?i)\b(api[_-]?key|secret|password|token)\b\s*[:=]\s*["'][^"']{8,}["']"#)
        .expect("static pattern")
});

static DYNAMIC_EVAL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\beval\s*\(|new\s+Function\s*\(").expect("static pattern")
});

/// Why a path or content was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardrailViolation {
    /// The path is empty.
    #[error("path is empty")]
    EmptyPath,
    /// Absolute paths are never writable.
    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),
    /// The path contains a `..` component.
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    /// The path is outside every allowed root.
    #[error("path is outside the allowed roots: {0}")]
    OutsideRoots(String),
    /// The content exceeds the size cap.
    #[error("content exceeds {MAX_CONTENT_BYTES} bytes ({0})")]
    Oversized(usize),
    /// The content matches a dangerous textual pattern.
    #[error("content contains a dangerous pattern: {0}")]
    DangerousPattern(&'static str),
}

/// Validate a proposed artifact path.
///
/// Rejects absolute paths, `..` traversal, and anything outside the
/// allowed-root allowlist. Pure function with no side effects.
pub fn validate_file_path(path: &str) -> Result<(), GuardrailViolation> {
    if path.is_empty() {
        return Err(GuardrailViolation::EmptyPath);
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(GuardrailViolation::AbsolutePath(path.to_string()));
    }
    if path.split(['/', '\\']).any(|part| part == "..") {
        return Err(GuardrailViolation::Traversal(path.to_string()));
    }
    if !ALLOWED_ROOTS.iter().any(|root| path.starts_with(root)) {
        return Err(GuardrailViolation::OutsideRoots(path.to_string()));
    }
    Ok(())
}

/// Validate proposed artifact content.
///
/// Rejects oversized content, in-code secret assignment, and dynamic
/// code evaluation. Pure function with no side effects.
pub fn validate_content(content: &str) -> Result<(), GuardrailViolation> {
    if content.len() > MAX_CONTENT_BYTES {
        return Err(GuardrailViolation::Oversized(content.len()));
    }
    if SECRET_ASSIGNMENT.is_match(content) {
        return Err(GuardrailViolation::DangerousPattern("secret assignment"));
    }
    if DYNAMIC_EVAL.is_match(content) {
        return Err(GuardrailViolation::DangerousPattern("dynamic evaluation"));
    }
    Ok(())
}
