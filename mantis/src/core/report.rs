//! Aggregation of results into bug and final reports.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::design::TestDesign;
use crate::core::types::{
    TestCaseResult, TestMode, TestStatus, UNKNOWN_TESTCASE_ID, WorkflowState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BugSeverity {
    High,
    Medium,
    Low,
}

/// A suspected defect in the API under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugReport {
    pub testcase_id: String,
    pub function_name: String,
    pub file_path: String,
    pub severity: BugSeverity,
    pub title: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl BugReport {
    /// Build a bug entry from a failing result.
    pub fn from_result(result: &TestCaseResult, severity: BugSeverity, detail: impl Into<String>) -> Self {
        let info = result.error_info.as_ref();
        Self {
            testcase_id: result.testcase_id.clone(),
            function_name: result.function_name.clone(),
            file_path: result.file_path.clone(),
            severity,
            title: info
                .map(|i| i.message.clone())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("{} failed", result.function_name)),
            detail: detail.into(),
            expected: info.and_then(|i| i.expected.clone()),
            actual: info.and_then(|i| i.actual.clone()),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.file_path.clone(), self.function_name.clone())
    }
}

/// Contents of `bug_report.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugReportFile {
    pub total: usize,
    pub by_severity: BTreeMap<BugSeverity, usize>,
    pub bugs: Vec<BugReport>,
}

impl BugReportFile {
    pub fn new(bugs: &[BugReport]) -> Self {
        let mut by_severity = BTreeMap::new();
        for bug in bugs {
            *by_severity.entry(bug.severity).or_insert(0) += 1;
        }
        Self {
            total: bugs.len(),
            by_severity,
            bugs: bugs.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub timeouts: usize,
    /// Tests that were repaired and passed afterwards.
    pub healed: usize,
    pub bugs: usize,
    /// Passed over executed (skips excluded), 0.0 when nothing ran.
    pub pass_rate: f64,
}

impl ReportSummary {
    pub fn from_results(results: &[TestCaseResult], bugs: usize) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let passed = count(TestStatus::Pass);
        let skipped = count(TestStatus::Skip);
        let executed = results.len() - skipped;
        Self {
            total: results.len(),
            passed,
            failed: count(TestStatus::Fail),
            errors: count(TestStatus::Error),
            skipped,
            timeouts: count(TestStatus::Timeout),
            healed: results.iter().filter(|r| r.healed && r.passed()).count(),
            bugs,
            pass_rate: if executed == 0 {
                0.0
            } else {
                passed as f64 / executed as f64
            },
        }
    }

    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed + self.skipped == self.total
    }
}

/// Cross-reference between planned and executed testcase ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignCoverage {
    pub designed: usize,
    pub executed: usize,
    /// Designed ids with no executed test.
    pub not_executed: Vec<String>,
    /// Executed tests whose id is not in the design (or could not be resolved).
    pub undocumented: Vec<String>,
}

impl DesignCoverage {
    pub fn compute(design: &TestDesign, results: &[TestCaseResult]) -> Self {
        let executed_ids: HashSet<&str> = results.iter().map(|r| r.testcase_id.as_str()).collect();
        let designed_ids: HashSet<&str> = design.ids().collect();

        let not_executed = design
            .ids()
            .filter(|id| !executed_ids.contains(id))
            .map(str::to_string)
            .collect();
        let undocumented: BTreeSet<String> = results
            .iter()
            .filter(|r| {
                r.testcase_id == UNKNOWN_TESTCASE_ID
                    || !designed_ids.contains(r.testcase_id.as_str())
            })
            .map(|r| {
                if r.testcase_id == UNKNOWN_TESTCASE_ID {
                    format!("{}::{}", r.file_path, r.function_name)
                } else {
                    r.testcase_id.clone()
                }
            })
            .collect();

        Self {
            designed: design.cases.len(),
            executed: results.len(),
            not_executed,
            undocumented: undocumented.into_iter().collect(),
        }
    }
}

/// One agent invocation as recorded in the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCallRecord {
    pub sequence: u32,
    pub phase: String,
    pub success: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `final_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub task_id: String,
    pub state: WorkflowState,
    pub mode: TestMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub results: Vec<TestCaseResult>,
    pub bugs: Vec<BugReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<DesignCoverage>,
    pub agent_calls: Vec<AgentCallRecord>,
    pub total_cost_usd: f64,
    pub output_files: Vec<String>,
}

/// Inputs for [`build_final_report`].
#[derive(Debug, Clone)]
pub struct ReportInputs<'a> {
    pub task_id: &'a str,
    pub mode: TestMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: &'a [TestCaseResult],
    pub bugs: &'a [BugReport],
    pub design: Option<&'a TestDesign>,
    pub agent_calls: &'a [AgentCallRecord],
    pub output_files: Vec<String>,
}

pub fn build_final_report(inputs: ReportInputs<'_>) -> FinalReport {
    let total_cost_usd = inputs.agent_calls.iter().filter_map(|c| c.cost_usd).sum();
    FinalReport {
        task_id: inputs.task_id.to_string(),
        state: WorkflowState::Completed,
        mode: inputs.mode,
        started_at: inputs.started_at,
        finished_at: inputs.finished_at,
        summary: ReportSummary::from_results(inputs.results, inputs.bugs.len()),
        results: inputs.results.to_vec(),
        bugs: inputs.bugs.to_vec(),
        coverage: inputs
            .design
            .map(|design| DesignCoverage::compute(design, inputs.results)),
        agent_calls: inputs.agent_calls.to_vec(),
        total_cost_usd,
        output_files: inputs.output_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::design::DesignedCase;
    use crate::core::types::{ErrorInfo, ErrorKind};

    fn result(id: &str, name: &str, status: TestStatus, healed: bool) -> TestCaseResult {
        TestCaseResult {
            testcase_id: id.to_string(),
            function_name: name.to_string(),
            file_path: "tests/test_orders.py".to_string(),
            status,
            duration: 0.1,
            error_info: None,
            healing_attempts: u32::from(healed),
            healed,
        }
    }

    fn designed(id: &str) -> DesignedCase {
        DesignedCase {
            testcase_id: id.to_string(),
            api: "GET /orders".to_string(),
            title: id.to_string(),
            priority: None,
            steps: Vec::new(),
            expected: "200".to_string(),
        }
    }

    /// Verifies counts, healed accounting and pass rate.
    #[test]
    fn summary_counts() {
        let results = vec![
            result("TC-001", "a", TestStatus::Pass, true),
            result("TC-002", "b", TestStatus::Pass, false),
            result("TC-003", "c", TestStatus::Fail, true),
            result("TC-004", "d", TestStatus::Skip, false),
            result("TC-005", "e", TestStatus::Error, false),
        ];
        let summary = ReportSummary::from_results(&results, 1);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.healed, 1);
        assert!((summary.pass_rate - 0.5).abs() < 1e-9);
        assert!(!summary.all_passed());
        assert_eq!(ReportSummary::from_results(&[], 0).pass_rate, 0.0);
    }

    /// Verifies designed and executed ids are cross-referenced.
    #[test]
    fn coverage_cross_reference() {
        let design = TestDesign {
            cases: vec![designed("TC-001"), designed("TC-002"), designed("TC-003")],
        };
        let results = vec![
            result("TC-001", "a", TestStatus::Pass, false),
            result("TC-009", "z", TestStatus::Pass, false),
            result(UNKNOWN_TESTCASE_ID, "helper_case", TestStatus::Pass, false),
            result("TC-009", "z_retry", TestStatus::Pass, false),
            result(UNKNOWN_TESTCASE_ID, "another_helper", TestStatus::Pass, false),
            result(UNKNOWN_TESTCASE_ID, "helper_case", TestStatus::Fail, false),
        ];
        let coverage = DesignCoverage::compute(&design, &results);
        assert_eq!(coverage.designed, 3);
        assert_eq!(coverage.executed, 6);
        assert_eq!(coverage.not_executed, vec!["TC-002", "TC-003"]);
        assert_eq!(
            coverage.undocumented,
            vec![
                "TC-009",
                "tests/test_orders.py::another_helper",
                "tests/test_orders.py::helper_case",
            ]
        );
    }

    /// Verifies bug entries carry the failure details and severity counts.
    #[test]
    fn bug_report_from_result() {
        let mut failing = result("TC-004", "test_total", TestStatus::Fail, false);
        failing.error_info = Some(ErrorInfo {
            kind: ErrorKind::Assertion,
            message: "AssertionError: assert 20 == 30".to_string(),
            expected: Some("30".to_string()),
            actual: Some("20".to_string()),
            ..ErrorInfo::default()
        });
        let bug = BugReport::from_result(&failing, BugSeverity::High, "total ignores discount");
        assert_eq!(bug.title, "AssertionError: assert 20 == 30");
        assert_eq!(bug.expected.as_deref(), Some("30"));

        let other = BugReport::from_result(
            &result("TC-005", "test_x", TestStatus::Fail, false),
            BugSeverity::Medium,
            "",
        );
        assert_eq!(other.title, "test_x failed");

        let file = BugReportFile::new(&[bug, other]);
        assert_eq!(file.total, 2);
        assert_eq!(file.by_severity.get(&BugSeverity::High), Some(&1));
        let json = serde_json::to_value(&file).expect("serialize");
        assert_eq!(json["by_severity"]["medium"], 1);
    }

    /// Verifies cost is summed over calls that reported one.
    #[test]
    fn final_report_totals_cost() {
        let calls = vec![
            AgentCallRecord {
                sequence: 1,
                phase: "planning".to_string(),
                success: true,
                cancelled: false,
                duration_ms: 10,
                cost_usd: Some(0.25),
                error: None,
            },
            AgentCallRecord {
                sequence: 2,
                phase: "generating".to_string(),
                success: true,
                cancelled: false,
                duration_ms: 10,
                cost_usd: None,
                error: None,
            },
        ];
        let now = Utc::now();
        let report = build_final_report(ReportInputs {
            task_id: "t-1",
            mode: TestMode::Interface,
            started_at: now,
            finished_at: now,
            results: &[],
            bugs: &[],
            design: None,
            agent_calls: &calls,
            output_files: vec!["final_report.json".to_string()],
        });
        assert!((report.total_cost_usd - 0.25).abs() < 1e-9);
        assert_eq!(report.state, WorkflowState::Completed);
        assert!(report.coverage.is_none());
    }
}
