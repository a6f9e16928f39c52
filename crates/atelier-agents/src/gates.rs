//! Deterministic quality gates applied to generated code artifacts.
//!
//! Three gates — syntax, lint, security — each produce a 0–100 score and
//! a findings list. The validator blends their average with the
//! completion-service review score; a security finding caps the blend
//! below the validity threshold so dangerous code can never pass on
//! style points alone.

use atelier_core::Artifact;
use regex::Regex;
use std::sync::LazyLock;

/// Maximum line length tolerated by the lint gate.
const MAX_LINE_LEN: usize = 120;

/// Validity threshold used by the validator and the executor.
pub const PASSING_SCORE: f64 = 60.0;

/// Ceiling applied to the blended score when the security gate fails.
const SECURITY_FAIL_CAP: f64 = 40.0;

static HARDCODED_CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"(?i)\b(api[_-]?key|secret|password|token)\b\s*[:=]\s*["'][^"']{8,}["']"#)
        .expect("static pattern")
});

static EMPTY_CATCH: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"catch\s*(\([^)]*\))?\s*\{\s*\}").expect("static pattern")
});

static DYNAMIC_EVAL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\beval\s*\(|new\s+Function\s*\(").expect("static pattern")
});

static DYNAMIC_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"\brequire\s*\(\s*[^"'\s)]"#).expect("static pattern")
});

static UNSANITIZED_EXEC: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"\b(exec|execSync|spawn)\s*\(\s*[^"'\s)]"#).expect("static pattern")
});

static DEBUG_PRINT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"console\.log\s*\(|\bdbg!\s*\(|\bprintln!\s*\(").expect("static pattern")
});

static HTML_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"innerHTML\s*=|document\.write\s*\(|dangerouslySetInnerHTML")
        .expect("static pattern")
});

static ENV_LEAK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(console\.log|println!|info!|debug!|print)\s*[!(].*(process\.env|env::var)")
        .expect("static pattern")
});

/// Outcome of one deterministic gate.
#[derive(Debug, Clone)]
pub struct GateReport {
    /// Gate name: `syntax`, `lint` or `security`.
    pub name: &'static str,
    /// Whether the gate found nothing.
    pub passed: bool,
    /// 0–100 gate score.
    pub score: f64,
    /// Human-readable findings.
    pub findings: Vec<String>,
}

impl GateReport {
    fn from_findings(name: &'static str, findings: Vec<String>, per_finding: f64) -> Self {
        let score = (100.0 - per_finding * findings.len() as f64).max(0.0);
        Self {
            name,
            passed: findings.is_empty(),
            score,
            findings,
        }
    }
}

/// Gate 1: lightweight syntax scan — bracket balance and dangling
/// import/export lines. The external typecheck result is merged in by
/// the validator, not here.
pub fn syntax_gate(artifacts: &[Artifact]) -> GateReport {
    let mut findings = Vec::new();
    for artifact in artifacts {
        for (open, close, label) in [('{', '}', "braces"), ('(', ')', "parens"), ('[', ']', "brackets")] {
            let opens = artifact.content.matches(open).count();
            let closes = artifact.content.matches(close).count();
            if opens != closes {
                findings.push(format!(
                    "{}: unbalanced {label} ({opens} open, {closes} close)",
                    artifact.name
                ));
            }
        }
        for (line_no, line) in artifact.content.lines().enumerate() {
            let trimmed = line.trim();
            let looks_like_import = trimmed.starts_with("import ")
                || trimmed.starts_with("export ")
                || trimmed.starts_with("use ");
            if looks_like_import
                && !trimmed.ends_with(';')
                && !trimmed.ends_with('{')
                && !trimmed.ends_with(',')
            {
                findings.push(format!(
                    "{}:{}: incomplete import/export line",
                    artifact.name,
                    line_no + 1
                ));
            }
        }
    }
    GateReport::from_findings("syntax", findings, 25.0)
}

/// Gate 2: lint scan with per-file scoring. Flags banned constructs,
/// hardcoded credentials, over-long lines and debug prints.
pub fn lint_gate(artifacts: &[Artifact]) -> GateReport {
    let mut findings = Vec::new();
    let mut file_scores = Vec::new();
    for artifact in artifacts {
        let mut deductions = 0.0;
        if DYNAMIC_EVAL.is_match(&artifact.content) {
            findings.push(format!("{}: dynamic evaluation", artifact.name));
            deductions += 20.0;
        }
        if HTML_INJECTION.is_match(&artifact.content) {
            findings.push(format!("{}: unsanitized HTML injection", artifact.name));
            deductions += 20.0;
        }
        if EMPTY_CATCH.is_match(&artifact.content) {
            findings.push(format!("{}: empty catch block", artifact.name));
            deductions += 15.0;
        }
        if HARDCODED_CREDENTIAL.is_match(&artifact.content) {
            findings.push(format!("{}: hardcoded credential", artifact.name));
            deductions += 25.0;
        }
        let long_lines = artifact
            .content
            .lines()
            .filter(|l| l.len() > MAX_LINE_LEN)
            .count();
        if long_lines > 0 {
            findings.push(format!("{}: {long_lines} over-long lines", artifact.name));
            deductions += (2.0 * long_lines as f64).min(10.0);
        }
        let debug_prints = DEBUG_PRINT.find_iter(&artifact.content).count();
        if debug_prints > 0 {
            findings.push(format!("{}: {debug_prints} debug prints", artifact.name));
            deductions += (5.0 * debug_prints as f64).min(15.0);
        }
        file_scores.push((100.0 - deductions).max(0.0));
    }
    let score = if file_scores.is_empty() {
        100.0
    } else {
        file_scores.iter().sum::<f64>() / file_scores.len() as f64
    };
    GateReport {
        name: "lint",
        passed: findings.is_empty(),
        score,
        findings,
    }
}

/// Gate 3: security scan — dynamic evaluation, dynamically constructed
/// module loading, unsanitized process execution, environment leakage
/// into logs.
pub fn security_gate(artifacts: &[Artifact]) -> GateReport {
    let mut findings = Vec::new();
    for artifact in artifacts {
        if DYNAMIC_EVAL.is_match(&artifact.content) {
            findings.push(format!("{}: dynamic evaluation", artifact.name));
        }
        if DYNAMIC_REQUIRE.is_match(&artifact.content) {
            findings.push(format!("{}: dynamically constructed module load", artifact.name));
        }
        if UNSANITIZED_EXEC.is_match(&artifact.content) {
            findings.push(format!("{}: unsanitized process execution", artifact.name));
        }
        if ENV_LEAK.is_match(&artifact.content) {
            findings.push(format!("{}: environment variable leaked into logs", artifact.name));
        }
    }
    GateReport::from_findings("security", findings, 40.0)
}

/// Blend the completion-service review score with the deterministic
/// gate average. A failed security gate caps the result below
/// [`PASSING_SCORE`]: no qualitative score can validate dangerous code.
pub fn blend_score(review_score: f64, gates: &[GateReport]) -> f64 {
    let deterministic = if gates.is_empty() {
        0.0
    } else {
        gates.iter().map(|g| g.score).sum::<f64>() / gates.len() as f64
    };
    let mut blended = 0.5 * review_score.clamp(0.0, 100.0) + 0.5 * deterministic;
    if gates.iter().any(|g| g.name == "security" && !g.passed) {
        blended = blended.min(SECURITY_FAIL_CAP);
    }
    blended.clamp(0.0, 100.0)
}
