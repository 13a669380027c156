//! Operator decision gate for guarded mode.
//!
//! When a story exhausts its retries in guarded mode, the run stops and asks
//! the operator whether to reset the attempt counter and keep going or to
//! park the run as paused. The trait seam lets tests script decisions.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

/// What the operator chose at a retry-ceiling stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    /// Reset the story's attempt counter and continue the run.
    Continue,
    /// Persist the run as paused and exit.
    Stop,
}

/// Source of operator decisions.
pub trait OperatorGate {
    fn decide(&mut self, story_id: &str, attempts: u32) -> Result<OperatorDecision>;
}

/// Interactive gate reading from stdin.
pub struct StdinGate;

impl OperatorGate for StdinGate {
    fn decide(&mut self, story_id: &str, attempts: u32) -> Result<OperatorDecision> {
        let mut stderr = io::stderr();
        writeln!(
            stderr,
            "\n{story_id} failed {attempts} attempts. Continue with reset attempt counter? [y/N]"
        )
        .context("prompt operator")?;
        stderr.flush().context("flush operator prompt")?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read operator decision")?;
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(OperatorDecision::Continue),
            _ => Ok(OperatorDecision::Stop),
        }
    }
}
