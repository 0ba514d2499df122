//! Pure verdicts over executed test results.

use serde::{Deserialize, Serialize};

use crate::core::types::{ErrorKind, HealingKind, TestCaseResult, TestMode, TestStatus};

/// Decision for one test result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: TestStatus,
    pub need_healing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing_kind: Option<HealingKind>,
    pub is_bug: bool,
    pub detail: String,
}

impl Verdict {
    fn settled(status: TestStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            need_healing: false,
            healing_kind: None,
            is_bug: false,
            detail: detail.into(),
        }
    }

    fn heal(status: TestStatus, kind: HealingKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            need_healing: true,
            healing_kind: Some(kind),
            is_bug: false,
            detail: detail.into(),
        }
    }
}

/// Decide whether `result` should be healed, accepted, or recorded as a bug.
///
/// Rules are applied in order: passing, timed-out and skipped tests are never
/// healed; the attempt cap stops healing regardless of error kind; syntax and
/// unknown failures get a syntax repair; connection and timeout diagnostics are
/// environment problems; assertion failures need business rules to tell a bad
/// test from a real defect, and without them are recorded as bugs.
pub fn judge(result: &TestCaseResult, mode: TestMode, max_attempts: u32) -> Verdict {
    let status = result.status;
    match status {
        TestStatus::Pass => return Verdict::settled(status, "test passed"),
        TestStatus::Timeout => return Verdict::settled(status, "test timed out; not retried"),
        TestStatus::Skip => return Verdict::settled(status, "test skipped"),
        TestStatus::Fail | TestStatus::Error => {}
    }

    if result.healing_attempts >= max_attempts {
        return Verdict::settled(
            status,
            format!("healing attempts exhausted ({}/{max_attempts})", result.healing_attempts),
        );
    }

    let Some(error) = &result.error_info else {
        return Verdict::settled(status, "no diagnostic available");
    };

    match error.kind {
        ErrorKind::Syntax => Verdict::heal(status, HealingKind::Syntax, "syntax or runtime error in test code"),
        ErrorKind::Unknown => Verdict::heal(status, HealingKind::Syntax, "unclassified error; attempting script repair"),
        ErrorKind::Connection => Verdict::settled(status, "connection error; environment issue"),
        ErrorKind::Timeout => Verdict::settled(status, "request timed out; environment issue"),
        ErrorKind::Assertion if mode.has_business_rules() => Verdict::heal(
            status,
            HealingKind::Logic,
            "assertion failed; checking against business rules",
        ),
        ErrorKind::Assertion => Verdict {
            is_bug: true,
            ..Verdict::settled(status, "assertion failed without business rules; recorded as bug")
        },
    }
}

/// Outcome of a logic-repair call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicVerdict {
    /// The agent concluded the API misbehaves; the test is left as is.
    Bug,
    /// The agent adjusted the test script.
    ScriptFixed,
}

/// Keyword match over the agent's reply to a logic-repair prompt.
pub fn parse_logic_verdict(text: &str) -> LogicVerdict {
    let compact: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.contains("\"verdict\": \"BUG_FOUND\"")
        || (compact.contains("\"verdict\":") && text.to_uppercase().contains("BUG"))
    {
        LogicVerdict::Bug
    } else {
        LogicVerdict::ScriptFixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorInfo;

    fn failing(kind: ErrorKind, attempts: u32) -> TestCaseResult {
        TestCaseResult {
            testcase_id: "TC-001".to_string(),
            function_name: "test_create_order".to_string(),
            file_path: "tests/test_orders.py".to_string(),
            status: TestStatus::Fail,
            duration: 0.2,
            error_info: Some(ErrorInfo {
                kind,
                ..ErrorInfo::default()
            }),
            healing_attempts: attempts,
            healed: false,
        }
    }

    /// Verifies assertion failures become logic repairs when rules are loaded.
    #[test]
    fn assertion_with_rules_needs_logic_healing() {
        let verdict = judge(&failing(ErrorKind::Assertion, 0), TestMode::Business, 3);
        assert!(verdict.need_healing);
        assert_eq!(verdict.healing_kind, Some(HealingKind::Logic));
        assert!(!verdict.is_bug);
    }

    /// Verifies assertion failures are bugs when no rules are loaded.
    #[test]
    fn assertion_without_rules_is_bug() {
        let verdict = judge(&failing(ErrorKind::Assertion, 0), TestMode::Interface, 3);
        assert!(!verdict.need_healing);
        assert!(verdict.is_bug);
    }

    /// Verifies the attempt cap wins over every error kind.
    #[test]
    fn attempt_cap_stops_healing() {
        for kind in [ErrorKind::Syntax, ErrorKind::Unknown, ErrorKind::Assertion] {
            let verdict = judge(&failing(kind, 3), TestMode::Complete, 3);
            assert!(!verdict.need_healing, "{kind:?}");
            assert!(!verdict.is_bug, "{kind:?}");
        }
    }

    /// Verifies syntax and unknown errors get a syntax repair.
    #[test]
    fn syntax_and_unknown_need_syntax_healing() {
        for kind in [ErrorKind::Syntax, ErrorKind::Unknown] {
            let verdict = judge(&failing(kind, 1), TestMode::Interface, 3);
            assert_eq!(verdict.healing_kind, Some(HealingKind::Syntax), "{kind:?}");
        }
    }

    /// Verifies environment failures are never healed.
    #[test]
    fn environment_failures_are_settled() {
        for kind in [ErrorKind::Connection, ErrorKind::Timeout] {
            let verdict = judge(&failing(kind, 0), TestMode::Complete, 3);
            assert!(!verdict.need_healing, "{kind:?}");
        }

        let mut timed_out = failing(ErrorKind::Syntax, 0);
        timed_out.status = TestStatus::Timeout;
        assert!(!judge(&timed_out, TestMode::Complete, 3).need_healing);

        let mut skipped = failing(ErrorKind::Syntax, 0);
        skipped.status = TestStatus::Skip;
        assert!(!judge(&skipped, TestMode::Complete, 3).need_healing);
    }

    /// Verifies a failure without diagnostics is not healed.
    #[test]
    fn missing_error_info_is_settled() {
        let mut result = failing(ErrorKind::Syntax, 0);
        result.error_info = None;
        assert!(!judge(&result, TestMode::Complete, 3).need_healing);
    }

    /// Verifies identical inputs yield identical verdicts.
    #[test]
    fn judge_is_deterministic() {
        let result = failing(ErrorKind::Assertion, 1);
        let first = judge(&result, TestMode::Business, 3);
        for _ in 0..10 {
            assert_eq!(judge(&result, TestMode::Business, 3), first);
        }
    }

    /// Verifies verdict keyword matching.
    #[test]
    fn logic_verdict_keywords() {
        assert_eq!(
            parse_logic_verdict("{\"verdict\": \"BUG_FOUND\", \"reason\": \"500\"}"),
            LogicVerdict::Bug
        );
        assert_eq!(
            parse_logic_verdict("{\"verdict\":   \"api_bug\"}"),
            LogicVerdict::Bug
        );
        assert_eq!(
            parse_logic_verdict("{\"verdict\": \"SCRIPT_FIXED\"}"),
            LogicVerdict::ScriptFixed
        );
        assert_eq!(
            parse_logic_verdict("fixed the BUG in the test"),
            LogicVerdict::ScriptFixed
        );
    }
}
