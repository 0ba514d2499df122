//! Typed failures recovered at the workflow's outermost loop.

use std::path::PathBuf;

use thiserror::Error;

/// An agent call finished without success and without being cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase} agent call failed: {error}")]
pub struct AgentCallFailed {
    pub phase: String,
    pub error: String,
}

/// The harness finished but its structured report is missing or unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("harness report {} unusable: {detail}", path.display())]
pub struct HarnessReportMissing {
    pub path: PathBuf,
    pub detail: String,
}
