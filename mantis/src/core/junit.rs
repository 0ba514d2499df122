//! JUnit XML report parsing.
//!
//! Only the parts the workflow needs are read: per-case `name`, `classname`,
//! `time`, and the first `failure` / `error` / `skipped` child marker.

use anyhow::{Context, Result, bail};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::core::diagnostics::{
    classify_error, extract_assertion_details, extract_line_number, extract_response_body,
    is_harness_timeout, summary_line,
};
use crate::core::types::{ErrorInfo, ErrorKind, TestCaseResult, TestStatus};

/// Marker found under a `<testcase>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failure { message: String, text: String },
    Error { message: String, text: String },
    Skipped { message: String },
}

/// One `<testcase>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedCase {
    pub name: String,
    pub classname: String,
    pub time: f64,
    pub outcome: CaseOutcome,
}

/// Parse every `<testcase>` in document order.
///
/// A document with no `<testsuite>`/`<testsuites>` root is rejected, so a
/// truncated or unrelated file is not mistaken for an empty run.
pub fn parse_junit_report(xml: &str) -> Result<Vec<ReportedCase>> {
    let mut reader = Reader::from_str(xml);
    let mut cases = Vec::new();
    let mut saw_suite = false;
    let mut current: Option<ReportedCase> = None;
    // Marker being filled from text content: (tag, message, text).
    let mut marker: Option<(Vec<u8>, String, String)> = None;

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("parse junit xml at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"testsuite" | b"testsuites" => saw_suite = true,
                b"testcase" => current = Some(start_case(&e)?),
                tag @ (b"failure" | b"error" | b"skipped") if current.is_some() => {
                    marker = Some((tag.to_vec(), attr(&e, b"message")?, String::new()));
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"testsuite" | b"testsuites" => saw_suite = true,
                b"testcase" => cases.push(start_case(&e)?),
                tag @ (b"failure" | b"error" | b"skipped") => {
                    if let Some(case) = current.as_mut() {
                        set_outcome(case, tag, attr(&e, b"message")?, String::new());
                    }
                }
                _ => {}
            },
            Event::Text(t) => {
                if let Some((_, _, text)) = marker.as_mut() {
                    text.push_str(&t.unescape().context("unescape junit text")?);
                }
            }
            Event::CData(c) => {
                if let Some((_, _, text)) = marker.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(case) = current.take() {
                        cases.push(case);
                    }
                }
                b"failure" | b"error" | b"skipped" => {
                    if let (Some((tag, message, text)), Some(case)) = (marker.take(), current.as_mut()) {
                        set_outcome(case, &tag, message, text);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_suite {
        bail!("junit xml has no testsuite element");
    }
    Ok(cases)
}

fn start_case(e: &BytesStart<'_>) -> Result<ReportedCase> {
    Ok(ReportedCase {
        name: attr(e, b"name")?,
        classname: attr(e, b"classname")?,
        time: attr(e, b"time")?.parse().unwrap_or(0.0),
        outcome: CaseOutcome::Passed,
    })
}

/// The first marker wins; pytest may emit an error after a failure for teardown.
fn set_outcome(case: &mut ReportedCase, tag: &[u8], message: String, text: String) {
    if case.outcome != CaseOutcome::Passed {
        return;
    }
    case.outcome = match tag {
        b"failure" => CaseOutcome::Failure { message, text },
        b"error" => CaseOutcome::Error { message, text },
        _ => CaseOutcome::Skipped { message },
    };
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<String> {
    for attribute in e.attributes() {
        let attribute = attribute.context("read junit attribute")?;
        if attribute.key.as_ref() == key {
            return Ok(attribute
                .unescape_value()
                .context("unescape junit attribute")?
                .into_owned());
        }
    }
    Ok(String::new())
}

impl ReportedCase {
    /// Convert into a workflow result for a resolved source file and testcase id.
    ///
    /// A failure or error raised by the per-test timeout becomes
    /// [`TestStatus::Timeout`].
    pub fn to_result(&self, file_path: &str, testcase_id: &str) -> TestCaseResult {
        let (status, error_info) = match &self.outcome {
            CaseOutcome::Passed => (TestStatus::Pass, None),
            CaseOutcome::Skipped { .. } => (TestStatus::Skip, None),
            CaseOutcome::Failure { message, text } | CaseOutcome::Error { message, text } => {
                let info = self.error_info(message, text, file_path, testcase_id);
                let status = if is_harness_timeout(&info.raw_diagnostic) {
                    TestStatus::Timeout
                } else if matches!(self.outcome, CaseOutcome::Failure { .. }) {
                    TestStatus::Fail
                } else {
                    TestStatus::Error
                };
                (status, Some(info))
            }
        };
        TestCaseResult {
            testcase_id: testcase_id.to_string(),
            function_name: self.name.clone(),
            file_path: file_path.to_string(),
            status,
            duration: self.time,
            error_info,
            healing_attempts: 0,
            healed: false,
        }
    }

    fn error_info(&self, message: &str, text: &str, file: &str, testcase_id: &str) -> ErrorInfo {
        let diagnostic = if message.is_empty() {
            text.trim().to_string()
        } else {
            format!("{message}\n{}", text.trim())
        };
        let kind = classify_error(&diagnostic);
        let mut info = ErrorInfo {
            kind,
            file: file.to_string(),
            function: self.name.clone(),
            testcase_id: testcase_id.to_string(),
            line: extract_line_number(&diagnostic, file),
            message: if message.is_empty() {
                summary_line(&diagnostic)
            } else {
                message.to_string()
            },
            response_body: extract_response_body(&diagnostic),
            raw_diagnostic: diagnostic,
            ..ErrorInfo::default()
        };
        if kind == ErrorKind::Assertion {
            let details = extract_assertion_details(&info.raw_diagnostic);
            info.assertion = details.assertion;
            info.expected = details.expected;
            info.actual = details.actual;
        }
        info
    }
}
