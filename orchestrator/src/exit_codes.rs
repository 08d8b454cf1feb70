//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration or missing secrets.
pub const INVALID: i32 = 1;
/// A command failed at runtime (tracker unreachable, bad prompt catalog, ...).
pub const FAILURE: i32 = 2;
