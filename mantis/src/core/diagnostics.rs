//! Heuristics over harness failure text.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ErrorKind;

static ASSERT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"assert\s+(.+?)\s*==\s*(.+)").expect("assert regex"));
static E_ASSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^E\s+(?:AssertionError:\s*)?assert\s+(.+?)\s*==\s*(.+?)\s*$")
        .expect("E-line assert regex")
});
static EXPECTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)expected[:\s]+([^\n]+)").expect("expected regex"));
static ACTUAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)actual[:\s]+([^\n]+)").expect("actual regex"));
static HARNESS_TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:E\s+)?Failed: Timeout >\s*\d").expect("harness timeout regex")
});
static RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)response(?:\s+body)?\s*[:=]\s*([^\n]+)").expect("response regex")
});

/// Assertion details scraped from a diagnostic; every field is best effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssertionDetails {
    pub assertion: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Keyword classification of diagnostic text.
pub fn classify_error(text: &str) -> ErrorKind {
    if text.contains("AssertionError") {
        ErrorKind::Assertion
    } else if ["SyntaxError", "NameError", "ImportError"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        ErrorKind::Syntax
    } else if text.contains("Connection") {
        ErrorKind::Connection
    } else if text.contains("Timeout") {
        ErrorKind::Timeout
    } else {
        ErrorKind::Unknown
    }
}

/// True when the harness itself stopped the test at its per-test timeout
/// (`Failed: Timeout >120.0s` from pytest-timeout), as opposed to a request
/// timing out inside the test.
pub fn is_harness_timeout(text: &str) -> bool {
    HARNESS_TIMEOUT_RE.is_match(text)
}

/// Pull `assertion`, `expected` and `actual` out of an assertion failure.
///
/// Explicit `expected:`/`actual:` markers win. Otherwise a pytest `E assert a == b`
/// line is read as `actual == expected`.
pub fn extract_assertion_details(text: &str) -> AssertionDetails {
    let mut details = AssertionDetails {
        assertion: ASSERT_RE
            .captures(text)
            .map(|c| format!("assert {} == {}", c[1].trim(), c[2].trim())),
        expected: capture_trimmed(&EXPECTED_RE, text),
        actual: capture_trimmed(&ACTUAL_RE, text),
    };

    if let Some(c) = E_ASSERT_RE.captures(text) {
        if details.actual.is_none() {
            details.actual = Some(c[1].trim().to_string());
        }
        if details.expected.is_none() {
            details.expected = Some(c[2].trim().to_string());
        }
    }
    details
}

/// First `<file>:<line>` reference in the text.
pub fn extract_line_number(text: &str, file: &str) -> Option<u32> {
    if file.is_empty() {
        return None;
    }
    let pattern = format!(r"{}:(\d+)", regex::escape(file));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text).and_then(|c| c[1].parse().ok())
}

/// A `response: ...` or `response body = ...` line, if the test printed one.
pub fn extract_response_body(text: &str) -> Option<String> {
    capture_trimmed(&RESPONSE_RE, text)
}

/// First line mentioning an error or an assertion, else the first non-empty line.
pub fn summary_line(text: &str) -> String {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.clone().next();
    lines
        .find(|l| l.contains("Error") || l.to_ascii_lowercase().contains("assert"))
        .or(first)
        .unwrap_or("Unknown error")
        .to_string()
}

fn capture_trimmed(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}
