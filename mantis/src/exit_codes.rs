//! Stable exit codes for mantis CLI commands.

/// Command succeeded; for `run`, every executed test passed.
pub const OK: i32 = 0;
/// Invalid inputs, configuration, or other command errors.
pub const INVALID: i32 = 1;
/// `mantis run` ended in the `failed` state.
pub const FAILED: i32 = 2;
/// `mantis run` was cancelled.
pub const CANCELLED: i32 = 3;
/// `mantis run` completed but some tests did not pass.
pub const TESTS_FAILED: i32 = 4;
