//! Test harness runner.
//!
//! Runs pytest over the generated tests with JUnit XML and HTML reports, then maps
//! each reported case back to its source file and `# TestCase:` id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::{Cancelled, CancellationToken};
use crate::core::diagnostics::extract_line_number;
use crate::core::errors::HarnessReportMissing;
use crate::core::junit::{ReportedCase, parse_junit_report};
use crate::core::types::{TestCaseResult, UNKNOWN_TESTCASE_ID};
use crate::io::artifacts::{TaskPaths, write_atomic};
use crate::io::config::HarnessConfig;
use crate::io::process::run_cancellable;

/// Lines above `def` searched for the testcase id comment.
const ID_LOOKBACK_LINES: usize = 4;

static TESTCASE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#\s*TestCase:\s*(TC-\d+)").expect("valid testcase id regex")
});

/// Parameters for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessRequest {
    /// Task root; the harness runs here and reported paths are relative to it.
    pub workdir: PathBuf,
    pub tests_dir: PathBuf,
    pub junit_path: PathBuf,
    pub html_report_path: PathBuf,
    pub log_path: PathBuf,
    pub per_test_timeout: Duration,
}

impl HarnessRequest {
    pub fn for_task(paths: &TaskPaths, per_test_timeout: Duration) -> Self {
        Self {
            workdir: paths.root.clone(),
            tests_dir: paths.tests_dir.clone(),
            junit_path: paths.junit_path.clone(),
            html_report_path: paths.html_report_path.clone(),
            log_path: paths.harness_log_path.clone(),
            per_test_timeout,
        }
    }
}

/// Parsed outcome of one harness run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessRun {
    pub results: Vec<TestCaseResult>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Abstraction over test harness backends.
pub trait HarnessRunner {
    /// Run every test under `request.tests_dir`.
    ///
    /// Cancellation surfaces as [`Cancelled`]; a missing or unparsable report as
    /// [`HarnessReportMissing`].
    fn run(&self, request: &HarnessRequest, cancel: &CancellationToken) -> Result<HarnessRun>;
}

/// Harness that spawns pytest with `--junitxml` and `--html`.
#[derive(Debug, Clone)]
pub struct PytestHarness {
    config: HarnessConfig,
    poll: Duration,
}

impl PytestHarness {
    pub fn new(config: HarnessConfig, poll: Duration) -> Self {
        Self { config, poll }
    }

    pub fn command(&self, request: &HarnessRequest) -> Result<Command> {
        let (program, prefix) = self
            .config
            .program
            .split_first()
            .ok_or_else(|| anyhow!("harness.program must be non-empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg(&request.tests_dir)
            .arg(format!("--junitxml={}", request.junit_path.display()))
            .arg(format!("--html={}", request.html_report_path.display()))
            .arg("--self-contained-html")
            .arg(format!("--timeout={}", request.per_test_timeout.as_secs()))
            .arg("-v")
            .current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl HarnessRunner for PytestHarness {
    #[instrument(skip_all, fields(tests_dir = %request.tests_dir.display()))]
    fn run(&self, request: &HarnessRequest, cancel: &CancellationToken) -> Result<HarnessRun> {
        cancel.check()?;
        // A stale report from the previous round must not pass for this one.
        if request.junit_path.exists() {
            fs::remove_file(&request.junit_path).with_context(|| {
                format!("remove stale report {}", request.junit_path.display())
            })?;
        }
        if let Some(parent) = request.junit_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let cmd = self.command(request)?;
        info!("running test harness");
        let output = match run_cancellable(
            cmd,
            Duration::from_secs(self.config.run_timeout_secs),
            self.poll,
            cancel,
            self.config.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                return Err(HarnessReportMissing {
                    path: request.junit_path.clone(),
                    detail: format!("harness did not run: {err:#}"),
                }
                .into());
            }
        };

        write_atomic(&request.log_path, output.render_log("harness").as_bytes())?;

        if output.cancelled {
            info!("harness run cancelled");
            return Err(Cancelled.into());
        }
        if output.timed_out {
            warn!(
                timeout_secs = self.config.run_timeout_secs,
                "harness run timed out"
            );
        }

        let xml = match fs::read_to_string(&request.junit_path) {
            Ok(xml) => xml,
            Err(err) => {
                let detail = if output.timed_out {
                    format!("harness timed out after {}s", self.config.run_timeout_secs)
                } else {
                    format!(
                        "{err} (exit code {})",
                        output
                            .status
                            .code()
                            .map_or_else(|| "none".to_string(), |c| c.to_string())
                    )
                };
                return Err(HarnessReportMissing {
                    path: request.junit_path.clone(),
                    detail,
                }
                .into());
            }
        };
        let cases = parse_junit_report(&xml).map_err(|err| HarnessReportMissing {
            path: request.junit_path.clone(),
            detail: format!("{err:#}"),
        })?;

        let results = map_cases_to_results(&request.workdir, &request.tests_dir, &cases);
        info!(
            cases = results.len(),
            exit_code = ?output.status.code(),
            "harness run finished"
        );
        Ok(HarnessRun {
            results,
            exit_code: output.status.code(),
            duration: output.elapsed,
            timed_out: output.timed_out,
        })
    }
}

/// Resolve files and testcase ids for every reported case.
pub fn map_cases_to_results(
    workdir: &Path,
    tests_dir: &Path,
    cases: &[ReportedCase],
) -> Vec<TestCaseResult> {
    let mut sources: HashMap<String, Option<String>> = HashMap::new();
    cases
        .iter()
        .map(|case| {
            let file = resolve_test_file(workdir, tests_dir, case_module(case));
            let source = sources
                .entry(file.clone())
                .or_insert_with(|| fs::read_to_string(workdir.join(&file)).ok());
            let testcase_id = source
                .as_deref()
                .and_then(|text| find_testcase_id(text, &case.name))
                .unwrap_or_else(|| UNKNOWN_TESTCASE_ID.to_string());
            let mut result = case.to_result(&file, &testcase_id);
            if let Some(info) = result.error_info.as_mut()
                && info.line.is_none()
                && let Some(name) = Path::new(&file).file_name().and_then(|n| n.to_str())
            {
                info.line = extract_line_number(&info.raw_diagnostic, name);
            }
            debug!(file = %file, function = %case.name, testcase_id = %testcase_id, "mapped case");
            result
        })
        .collect()
}

/// Dotted module path of a case.
///
/// Collection errors are reported with an empty classname and the module path
/// (`tests.test_orders`) as the name.
fn case_module(case: &ReportedCase) -> &str {
    if case.classname.trim().is_empty() {
        &case.name
    } else {
        &case.classname
    }
}

/// Map a JUnit classname to a source path relative to `workdir`.
///
/// `tests.test_orders` and `test_orders.TestOrders` both resolve to
/// `tests/test_orders.py` when that file exists. Unresolvable names fall back
/// to the dotted path under `tests_dir`.
pub fn resolve_test_file(workdir: &Path, tests_dir: &Path, classname: &str) -> String {
    let segments: Vec<&str> = classname.split('.').filter(|s| !s.is_empty()).collect();
    let relative_tests = tests_dir.strip_prefix(workdir).unwrap_or(tests_dir);
    for take in (1..=segments.len()).rev() {
        let candidate = format!("{}.py", segments[..take].join("/"));
        if workdir.join(&candidate).is_file() {
            return candidate;
        }
        let nested = relative_tests.join(&candidate);
        if workdir.join(&nested).is_file() {
            return nested.display().to_string();
        }
    }
    let fallback = format!("{}.py", segments.join("/"));
    if segments.first() == relative_tests.to_str().as_ref() {
        fallback
    } else {
        relative_tests.join(fallback).display().to_string()
    }
}

/// Testcase id from a `# TestCase: TC-NNN` comment just above `def <function>(`.
///
/// Parametrized names (`test_x[case1]`) match their base function.
pub fn find_testcase_id(source: &str, function: &str) -> Option<String> {
    let base = function.split('[').next().unwrap_or(function);
    let def = format!("def {base}(");
    let lines: Vec<&str> = source.lines().collect();
    let index = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with(&def) || trimmed.strip_prefix("async ").is_some_and(|r| r.starts_with(&def))
    })?;
    lines[index.saturating_sub(ID_LOOKBACK_LINES)..index]
        .iter()
        .rev()
        .find_map(|line| TESTCASE_ID_RE.captures(line).map(|c| c[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::is_cancellation;
    use crate::core::types::{ErrorKind, TestStatus};

    const SOURCE: &str = "import requests\n\n# TestCase: TC-001\n@pytest.mark.p0\ndef test_create_order(api):\n    pass\n\n\n\n\n\n\ndef test_orphan(api):\n    pass\n\n# TestCase: TC-002\nasync def test_async(api):\n    pass\n";

    /// Verifies ids come from the comment within four lines above the function.
    #[test]
    fn finds_testcase_ids() {
        assert_eq!(find_testcase_id(SOURCE, "test_create_order").as_deref(), Some("TC-001"));
        assert_eq!(find_testcase_id(SOURCE, "test_create_order[case-a]").as_deref(), Some("TC-001"));
        assert_eq!(find_testcase_id(SOURCE, "test_orphan"), None);
        assert_eq!(find_testcase_id(SOURCE, "test_async").as_deref(), Some("TC-002"));
        assert_eq!(find_testcase_id(SOURCE, "test_missing"), None);
    }

    /// Verifies classnames resolve with or without the tests package prefix.
    #[test]
    fn resolves_classnames_to_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tests_dir = temp.path().join("tests");
        fs::create_dir_all(&tests_dir).expect("mkdir");
        fs::write(tests_dir.join("test_orders.py"), "").expect("write");

        let root = temp.path();
        assert_eq!(resolve_test_file(root, &tests_dir, "tests.test_orders"), "tests/test_orders.py");
        assert_eq!(resolve_test_file(root, &tests_dir, "test_orders"), "tests/test_orders.py");
        assert_eq!(
            resolve_test_file(root, &tests_dir, "test_orders.TestOrders"),
            "tests/test_orders.py"
        );
        assert_eq!(resolve_test_file(root, &tests_dir, "test_gone"), "tests/test_gone.py");
        assert_eq!(resolve_test_file(root, &tests_dir, "tests.test_gone"), "tests/test_gone.py");
    }

    /// Verifies a collection error points at the module that failed to import.
    #[test]
    fn collection_error_maps_to_module_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tests_dir = temp.path().join("tests");
        fs::create_dir_all(&tests_dir).expect("mkdir");
        fs::write(tests_dir.join("test_orders.py"), "import requestz\n").expect("write");
        let xml = r#"<testsuites><testsuite name="pytest" errors="1" tests="1">
<testcase classname="" name="tests.test_orders" time="0.000"><error message="collection failure">ImportError while importing test module 'tests/test_orders.py'.
tests/test_orders.py:1: in &lt;module&gt;
    import requestz
E   ModuleNotFoundError: No module named 'requestz'</error></testcase>
</testsuite></testsuites>"#;
        let cases = parse_junit_report(xml).expect("parse");

        let results = map_cases_to_results(temp.path(), &tests_dir, &cases);

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.file_path, "tests/test_orders.py");
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.testcase_id, UNKNOWN_TESTCASE_ID);
        let info = result.error_info.as_ref().expect("error info");
        assert_eq!(info.file, "tests/test_orders.py");
        assert_eq!(info.kind, ErrorKind::Syntax);
        assert_eq!(info.line, Some(1));
    }

    /// Verifies the pytest command line.
    #[test]
    fn command_has_report_flags() {
        let harness = PytestHarness::new(
            HarnessConfig {
                program: vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
                ..HarnessConfig::default()
            },
            Duration::from_millis(50),
        );
        let paths = TaskPaths::new("/out/t1");
        let cmd = harness
            .command(&HarnessRequest::for_task(&paths, Duration::from_secs(30)))
            .expect("command");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "python");
        assert_eq!(
            args,
            vec![
                "-m",
                "pytest",
                "/out/t1/tests",
                "--junitxml=/out/t1/reports/results.xml",
                "--html=/out/t1/reports/report.html",
                "--self-contained-html",
                "--timeout=30",
                "-v",
            ]
        );
    }

    #[cfg(unix)]
    fn script_harness(dir: &Path, body: &str) -> PytestHarness {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-pytest.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}")).expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        PytestHarness::new(
            HarnessConfig {
                program: vec![script.display().to_string()],
                run_timeout_secs: 30,
                ..HarnessConfig::default()
            },
            Duration::from_millis(20),
        )
    }

    /// Verifies a fake harness report is parsed and mapped to sources.
    #[cfg(unix)]
    #[test]
    fn runs_script_and_parses_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TaskPaths::new(temp.path().join("task"));
        paths.ensure_dirs().expect("dirs");
        fs::write(paths.tests_dir.join("test_orders.py"), SOURCE).expect("write source");
        let harness = script_harness(
            temp.path(),
            r#"for arg in "$@"; do case "$arg" in --junitxml=*) out="${arg#--junitxml=}";; esac; done
cat > "$out" <<'XML'
<testsuites><testsuite name="pytest">
<testcase classname="test_orders" name="test_create_order" time="0.2"/>
<testcase classname="test_orders" name="test_orphan" time="0.1"><failure message="AssertionError: assert 404 == 200">test_orders.py:14: AssertionError</failure></testcase>
</testsuite></testsuites>
XML
echo "2 collected"
exit 1
"#,
        );
        let run = harness
            .run(
                &HarnessRequest::for_task(&paths, Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .expect("run");
        assert_eq!(run.exit_code, Some(1));
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].testcase_id, "TC-001");
        assert_eq!(run.results[0].status, TestStatus::Pass);
        let failed = &run.results[1];
        assert_eq!(failed.testcase_id, UNKNOWN_TESTCASE_ID);
        assert_eq!(failed.file_path, "tests/test_orders.py");
        let info = failed.error_info.as_ref().expect("error info");
        assert_eq!(info.kind, ErrorKind::Assertion);
        assert_eq!(info.line, Some(14));
        let log = fs::read_to_string(&paths.harness_log_path).expect("log");
        assert!(log.contains("2 collected"));
    }

    /// Verifies a run that writes no report is a hard failure.
    #[cfg(unix)]
    #[test]
    fn missing_report_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TaskPaths::new(temp.path().join("task"));
        paths.ensure_dirs().expect("dirs");
        fs::write(&paths.junit_path, "<testsuite/>").expect("stale report");
        let harness = script_harness(temp.path(), "echo collection error >&2\nexit 4\n");
        let err = harness
            .run(
                &HarnessRequest::for_task(&paths, Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .expect_err("missing report");
        let missing = err
            .downcast_ref::<HarnessReportMissing>()
            .expect("typed error");
        assert!(missing.detail.contains("exit code 4"));
    }

    /// Verifies cancellation surfaces as the cancellation error.
    #[cfg(unix)]
    #[test]
    fn cancelled_run_is_cancellation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TaskPaths::new(temp.path().join("task"));
        paths.ensure_dirs().expect("dirs");
        let harness = script_harness(temp.path(), "exec sleep 30\n");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let err = harness
            .run(&HarnessRequest::for_task(&paths, Duration::from_secs(5)), &cancel)
            .expect_err("cancelled");
        handle.join().expect("join");
        assert!(is_cancellation(&err));
    }
}
