//! Unattended backlog execution orchestrator.
//!
//! This crate drives an external autonomous agent through a backlog of user
//! stories: for each story it renders an implementation prompt, runs an agent
//! session, runs an independent verification session, parses the verdict, and
//! decides whether to accept, retry, or escalate. Progress is persisted after
//! every phase so a crashed or killed run resumes without re-applying effects.
//!
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (story parsing, verdict parsing,
//!   state transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution, the pause gate). Isolated to enable scripted doubles in tests.
//!
//! Orchestration modules ([`attempt`], [`run`], [`chain`]) coordinate core
//! logic with I/O to implement the CLI commands.

pub mod attempt;
pub mod chain;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
