//! Durable state persistence for runs and chains.
//!
//! State is written atomically (temp file + rename) so an external monitor
//! reading the file sees either the previous or the new complete document,
//! never a torn snapshot.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::state::{ChainState, ExecutionState, RunStatus, StateDoc, now_iso};

/// Load single-group state if the file exists.
pub fn load_execution_state(path: &Path) -> Result<Option<ExecutionState>> {
    load_json(path)
}

/// Load chain state if the file exists.
pub fn load_chain_state(path: &Path) -> Result<Option<ChainState>> {
    load_json(path)
}

/// Reset a terminal status from a prior run so the loop can continue.
///
/// `blocked` is also repaired: the operator may have archived the missing
/// prerequisite since the last run, and the gate re-checks on every start.
pub fn repair_for_resume(status: &mut RunStatus) {
    if status.is_terminal() {
        debug!(?status, "repairing terminal status for resume");
        *status = RunStatus::Running;
    }
}

/// Persist the state document behind `doc`, bumping its `updated_at`.
pub fn persist(path: &Path, doc: &mut StateDoc) -> Result<()> {
    doc.touch();
    match doc {
        StateDoc::Single(state) => write_json(path, state),
        StateDoc::Chain { state, .. } => write_json(path, state),
    }
}

/// Persist chain state outside a story-loop scope, bumping `updated_at`.
pub fn persist_chain(path: &Path, state: &mut ChainState) -> Result<()> {
    state.updated_at = now_iso();
    write_json(path, state)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state =
        serde_json::from_str(&contents).with_context(|| format!("parse state {}", path.display()))?;
    Ok(Some(state))
}

fn write_json<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
