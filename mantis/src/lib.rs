//! API test-suite orchestration engine.
//!
//! A task takes an OpenAPI document (plus optional business requirements and
//! test data), asks a coding agent to plan and generate a pytest suite, runs it,
//! and loops repair calls over failing tests until the results settle. The crate
//! keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (dependency analysis, diagnostics,
//!   judging, report assembly). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agent and harness subprocesses,
//!   prompts, artifacts). Each external process sits behind a trait.
//!
//! [`workflow`] drives one task through its phases; [`service`] hosts many
//! tasks on worker threads behind an injected [`service::TaskStore`].

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
