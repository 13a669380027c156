//! Stable exit codes for orchestrator CLI commands.

/// Run finished with every story completed.
pub const OK: i32 = 0;
/// A story exhausted its retry ceiling in unattended mode, or another error.
pub const FAILED: i32 = 1;
/// The operator stopped a guarded run; state persisted as `paused`.
pub const PAUSED: i32 = 2;
/// A chain group's prerequisite was not archived; state persisted as `blocked`.
pub const BLOCKED: i32 = 3;
