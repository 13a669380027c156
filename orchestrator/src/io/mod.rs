//! Side-effecting operations: filesystem, git, process execution, sessions.

pub mod config;
pub mod exec_log;
pub mod gate;
pub mod git;
pub mod pause;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod session;
pub mod state_store;
pub mod stories;
