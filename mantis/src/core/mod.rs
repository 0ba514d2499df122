//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cancel;
pub mod dependency;
pub mod design;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod exploration;
pub mod judge;
pub mod junit;
pub mod report;
pub mod retry;
pub mod schema;
pub mod types;
