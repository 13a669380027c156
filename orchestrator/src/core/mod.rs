//! Pure, deterministic logic for the orchestrator.
//!
//! Nothing in this module performs I/O. Story parsing, verdict parsing, and
//! state transitions are plain functions over in-memory values so they can be
//! tested without a repository, a filesystem, or an agent backend.

pub mod state;
pub mod story;
pub mod verdict;
