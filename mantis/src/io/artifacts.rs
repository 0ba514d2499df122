//! Output directory layout and atomic artifact writes for one task.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::dependency::DependencyAnalysisResult;
use crate::core::design::{TestDesign, parse_test_design};

/// All canonical paths within a task's output directory.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub root: PathBuf,
    pub tests_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub junit_path: PathBuf,
    pub html_report_path: PathBuf,
    pub harness_log_path: PathBuf,
    pub calls_dir: PathBuf,
    pub design_path: PathBuf,
    pub dependency_path: PathBuf,
    pub final_report_path: PathBuf,
    pub bug_report_path: PathBuf,
    pub exploration_log_path: PathBuf,
    pub explored_data_path: PathBuf,
}

impl TaskPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let reports_dir = root.join("reports");
        Self {
            tests_dir: root.join("tests"),
            junit_path: reports_dir.join("results.xml"),
            html_report_path: reports_dir.join("report.html"),
            harness_log_path: reports_dir.join("harness.log"),
            reports_dir,
            calls_dir: root.join("logs").join("calls"),
            design_path: root.join("test_design.json"),
            dependency_path: root.join("dependency_analysis.json"),
            final_report_path: root.join("final_report.json"),
            bug_report_path: root.join("bug_report.json"),
            exploration_log_path: root.join("exploration_log.json"),
            explored_data_path: root.join("explored_data.json"),
            root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.tests_dir, &self.reports_dir, &self.calls_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Per-call log directory, e.g. `logs/calls/003-healing`.
    pub fn call_paths(&self, sequence: u32, phase: &str) -> CallPaths {
        CallPaths::new(self.calls_dir.join(format!("{sequence:03}-{phase}")))
    }

    /// Path relative to the task root, for reports.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// Files written for one agent call.
#[derive(Debug, Clone)]
pub struct CallPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub stream_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl CallPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            prompt_path: dir.join("prompt.md"),
            stream_path: dir.join("stream.jsonl"),
            stderr_path: dir.join("stderr.log"),
            dir,
        }
    }
}

/// Write via a sibling temp file and rename, creating parent directories.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    debug!(path = %path.display(), "writing json artifact");
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

pub fn read_json_value(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Load and validate the planning artifact.
pub fn load_test_design(path: &Path) -> Result<TestDesign> {
    let value = read_json_value(path)?;
    parse_test_design(&value).with_context(|| format!("validate {}", path.display()))
}

#[derive(Serialize)]
struct DependencySnapshot<'a> {
    generated_by: &'static str,
    resource_count: usize,
    dependency_count: usize,
    #[serde(flatten)]
    result: &'a DependencyAnalysisResult,
}

/// Persist the analysis result with its summary counts.
pub fn write_dependency_snapshot(path: &Path, result: &DependencyAnalysisResult) -> Result<()> {
    write_json(
        path,
        &DependencySnapshot {
            generated_by: "static-analyzer",
            resource_count: result.resources.len(),
            dependency_count: result.dependencies.len(),
            result,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Verifies the task layout and call directories.
    #[test]
    fn task_paths_layout() {
        let paths = TaskPaths::new("/out/task-1");
        assert_eq!(paths.junit_path, PathBuf::from("/out/task-1/reports/results.xml"));
        assert_eq!(paths.relative(&paths.final_report_path), "final_report.json");
        let call = paths.call_paths(3, "healing");
        assert_eq!(
            call.stream_path,
            PathBuf::from("/out/task-1/logs/calls/003-healing/stream.jsonl")
        );
    }

    /// Verifies atomic JSON writes leave no temp file behind.
    #[test]
    fn write_json_is_atomic_and_pretty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a").join("b.json");
        write_json(&path, &json!({"k": 1})).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"k\": 1"));
        assert!(!temp.path().join("a").join("b.json.tmp").exists());
        assert_eq!(read_json_value(&path).expect("read"), json!({"k": 1}));
    }

    /// Verifies the dependency snapshot carries counts next to the result.
    #[test]
    fn dependency_snapshot_has_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("dependency_analysis.json");
        write_dependency_snapshot(&path, &DependencyAnalysisResult::default()).expect("write");
        let value = read_json_value(&path).expect("read");
        assert_eq!(value["generated_by"], "static-analyzer");
        assert_eq!(value["resource_count"], 0);
        assert!(value["sorted_endpoints"].as_array().expect("array").is_empty());
    }

    /// Verifies a missing or invalid design file is an error.
    #[test]
    fn load_test_design_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("test_design.json");
        assert!(load_test_design(&path).is_err());
        fs::write(&path, "{\"cases\": 3}").expect("write");
        let err = load_test_design(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("test design validation failed"));
    }
}
