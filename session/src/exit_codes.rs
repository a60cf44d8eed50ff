//! Stable exit codes for the `session` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (unreadable log, invalid config, or any other error).
pub const INVALID: i32 = 1;
