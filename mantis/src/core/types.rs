//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the analyzer, judge, harness and
//! workflow. They carry no I/O and serialize to the JSON artifacts written at
//! phase boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of one executed test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Timeout,
    Skip,
}

/// Heuristic classification of a failure diagnostic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Syntax, name or import errors, and other runtime faults in the test code.
    Syntax,
    Assertion,
    Connection,
    Timeout,
    #[default]
    Unknown,
}

/// Failure details attached to a non-passing test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub file: String,
    pub function: String,
    pub testcase_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    pub raw_diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// Testcase id used when no `# TestCase:` comment precedes the function.
pub const UNKNOWN_TESTCASE_ID: &str = "UNKNOWN";

/// Per-test result, mutated only by the workflow during the execute/heal loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub testcase_id: String,
    pub function_name: String,
    pub file_path: String,
    pub status: TestStatus,
    /// Wall-clock duration in seconds as reported by the harness.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default)]
    pub healing_attempts: u32,
    #[serde(default)]
    pub healed: bool,
}

impl TestCaseResult {
    /// Stable identity of a test across harness re-runs.
    pub fn key(&self) -> (String, String) {
        (self.file_path.clone(), self.function_name.clone())
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

/// Kind of repair requested from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealingKind {
    Syntax,
    Logic,
}

impl HealingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Logic => "logic",
        }
    }
}

/// Which inputs a task was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Schema only.
    Interface,
    /// Schema plus business requirements.
    Business,
    /// Schema, business requirements and test data.
    Complete,
}

impl TestMode {
    pub fn from_inputs(has_requirements: bool, has_test_data: bool) -> Self {
        match (has_requirements, has_test_data) {
            (true, true) => Self::Complete,
            (true, false) => Self::Business,
            (false, _) => Self::Interface,
        }
    }

    /// True when business rules are available to disambiguate assertion failures.
    pub fn has_business_rules(self) -> bool {
        matches!(self, Self::Business | Self::Complete)
    }
}

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Init,
    Planning,
    Generating,
    Executing,
    Healing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transitions, except the bounded executing/healing cycle.
    ///
    /// Any non-terminal state may move to `Failed` or `Cancelled`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkflowState as S;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, S::Failed | S::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (S::Init, S::Planning)
                | (S::Planning, S::Generating)
                | (S::Generating, S::Executing)
                | (S::Executing, S::Healing)
                | (S::Healing, S::Executing)
                | (S::Executing, S::Finalizing)
                | (S::Healing, S::Finalizing)
                | (S::Finalizing, S::Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Healing => "healing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies the mode is derived from which optional inputs were supplied.
    #[test]
    fn mode_from_inputs() {
        assert_eq!(TestMode::from_inputs(false, false), TestMode::Interface);
        assert_eq!(TestMode::from_inputs(false, true), TestMode::Interface);
        assert_eq!(TestMode::from_inputs(true, false), TestMode::Business);
        assert_eq!(TestMode::from_inputs(true, true), TestMode::Complete);
        assert!(!TestMode::Interface.has_business_rules());
        assert!(TestMode::Complete.has_business_rules());
    }

    /// Verifies the happy path and the executing/healing cycle are allowed.
    #[test]
    fn forward_transitions_are_allowed() {
        use WorkflowState as S;
        let path = [
            S::Init,
            S::Planning,
            S::Generating,
            S::Executing,
            S::Healing,
            S::Executing,
            S::Finalizing,
            S::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    /// Verifies backwards moves and moves out of terminal states are rejected.
    #[test]
    fn backward_and_terminal_transitions_are_rejected() {
        use WorkflowState as S;
        assert!(!S::Generating.can_transition_to(S::Planning));
        assert!(!S::Executing.can_transition_to(S::Generating));
        assert!(!S::Completed.can_transition_to(S::Failed));
        assert!(!S::Cancelled.can_transition_to(S::Planning));
        assert!(S::Healing.can_transition_to(S::Cancelled));
        assert!(S::Init.can_transition_to(S::Failed));
    }

    /// Verifies the wire names used in reports.
    #[test]
    fn serializes_lowercase_names() {
        let json = serde_json::to_string(&TestStatus::Timeout).expect("serialize");
        assert_eq!(json, "\"timeout\"");
        let json = serde_json::to_string(&HealingKind::Logic).expect("serialize");
        assert_eq!(json, "\"LOGIC\"");
        assert_eq!(WorkflowState::Cancelled.to_string(), "cancelled");
    }
}
