//! Stable exit codes for foreman CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration, or any other failure.
pub const INVALID: i32 = 1;
/// A patch was rejected because a path escapes the workspace root.
pub const UNSAFE_PATCH: i32 = 2;
