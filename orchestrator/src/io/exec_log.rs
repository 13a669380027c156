//! Append-only human-readable execution log.
//!
//! `EXECUTION_LOG.md` is the operator-facing audit trail: one header per run,
//! one entry per story outcome, a summary when the backlog drains. The JSON
//! state file is authoritative; this log is never read back by the
//! orchestrator.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::state::{Mode, now_iso};

/// Failure detail lines in the log are capped to keep entries scannable.
const FAILURE_DETAIL_CAP: usize = 500;

/// Appender for the markdown execution log.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the start (or resumption) of a single-group run.
    pub fn run_started(
        &self,
        feature: &str,
        document: &str,
        branch: &str,
        mode: Mode,
        max_retries: u32,
        stories: usize,
        resumed: bool,
    ) -> Result<()> {
        let verb = if resumed { "Resumed" } else { "Started" };
        self.append(&format!(
            "\n## {verb}: {feature} ({ts})\n\nDocument: `{document}`, branch `{branch}` (mode {}, retry ceiling {max_retries}, {stories} stories)\n",
            mode.as_str(),
            ts = now_iso(),
        ))
    }

    /// Record the start (or resumption) of a chain run.
    pub fn chain_started(
        &self,
        chain: &str,
        branch: &str,
        mode: Mode,
        max_retries: u32,
        groups: usize,
        resumed: bool,
    ) -> Result<()> {
        let verb = if resumed { "Resumed" } else { "Started" };
        self.append(&format!(
            "\n## {verb} chain: {chain} ({ts})\n\nBranch: `{branch}` (mode {}, retry ceiling {max_retries}, {groups} groups)\n",
            mode.as_str(),
            ts = now_iso(),
        ))
    }

    /// Record a story completing after `attempts` attempts.
    pub fn story_completed(&self, story_id: &str, title: &str, attempts: u32) -> Result<()> {
        self.append(&format!(
            "- [{ts}] ✅ {story_id}: {title} (attempt {attempts})\n",
            ts = now_iso(),
        ))
    }

    /// Record a failed attempt with sanitized failure detail.
    pub fn attempt_failed(
        &self,
        story_id: &str,
        title: &str,
        attempt: u32,
        detail: &str,
    ) -> Result<()> {
        self.append(&format!(
            "- [{ts}] ❌ {story_id}: {title} (attempt {attempt}) — {}\n",
            sanitize_failure(detail),
            ts = now_iso(),
        ))
    }

    /// Record a story hitting the retry ceiling.
    pub fn story_abandoned(&self, story_id: &str, title: &str, max_retries: u32) -> Result<()> {
        self.append(&format!(
            "- [{ts}] ⛔ {story_id}: {title} — abandoned after {max_retries} attempts\n",
            ts = now_iso(),
        ))
    }

    /// Record the backlog draining completely.
    pub fn run_completed(&self, feature: &str, completed: u32, total_sessions: u32) -> Result<()> {
        self.append(&format!(
            "\n**Completed: {feature}** ({ts}) — {completed} stories, {total_sessions} agent sessions\n",
            ts = now_iso(),
        ))
    }

    /// Record a chain group checkpoint.
    pub fn checkpoint(&self, chain: &str, feature: &str, tag: &str) -> Result<()> {
        self.append(&format!(
            "- [{ts}] 🏁 checkpoint for {chain}/{feature}: `{tag}`\n",
            ts = now_iso(),
        ))
    }

    fn append(&self, entry: &str) -> Result<()> {
        // The log may be the first thing written on a fresh project.
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open execution log {}", self.path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append to execution log {}", self.path.display()))?;
        debug!(path = %self.path.display(), bytes = entry.len(), "appended log entry");
        Ok(())
    }
}

/// Collapse a failure blob into a single capped line.
///
/// Leading blank lines and markdown fences are noise from agent output;
/// newlines become separators so the entry stays one bullet.
fn sanitize_failure(detail: &str) -> String {
    let mut line = detail
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .collect::<Vec<_>>()
        .join(" / ");
    if line.is_empty() {
        line = "no failure detail captured".to_string();
    }
    if line.chars().count() > FAILURE_DETAIL_CAP {
        let truncated: String = line.chars().take(FAILURE_DETAIL_CAP).collect();
        line = format!("{truncated}…");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> ExecutionLog {
        ExecutionLog::new(dir.path().join("EXECUTION_LOG.md"))
    }

    #[test]
    fn entries_accumulate_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let log = log_in(&dir);

        log.run_started("parser", "prd/parser.md", "feat/parser", Mode::Autonomous, 3, 2, false)
            .expect("log");
        log.attempt_failed("US-001", "Add parser", 1, "verifier said no")
            .expect("log");
        log.story_completed("US-001", "Add parser", 2).expect("log");
        log.run_completed("parser", 1, 4).expect("log");

        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.contains("Document: `prd/parser.md`"));
        let started = contents.find("## Started: parser").expect("header");
        let failed = contents.find("❌ US-001").expect("failure");
        let done = contents.find("✅ US-001").expect("success");
        let summary = contents.find("**Completed: parser**").expect("summary");
        assert!(started < failed && failed < done && done < summary);
        assert!(contents.contains("(attempt 2)"));
    }

    #[test]
    fn resumed_runs_use_distinct_header() {
        let dir = TempDir::new().expect("tempdir");
        let log = log_in(&dir);
        log.run_started("parser", "prd/parser.md", "feat/parser", Mode::Guarded, 3, 2, true)
            .expect("log");
        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.contains("## Resumed: parser"));
        assert!(contents.contains("mode guarded"));
    }

    #[test]
    fn append_creates_missing_log_directory() {
        let dir = TempDir::new().expect("tempdir");
        let log = ExecutionLog::new(dir.path().join(".orchestrator").join("EXECUTION_LOG.md"));
        log.run_started("parser", "prd/parser.md", "feat/parser", Mode::Autonomous, 3, 1, false)
            .expect("log");
        assert!(log.path().exists());
    }

    #[test]
    fn failure_detail_is_flattened_and_capped() {
        let noisy = format!("\n\n```\n{}\nmore\n```\n", "x".repeat(600));
        let line = sanitize_failure(&noisy);
        assert!(!line.contains('\n'));
        assert!(!line.contains("```"));
        assert!(line.chars().count() <= FAILURE_DETAIL_CAP + 1);
        assert!(line.ends_with('…'));

        assert_eq!(sanitize_failure("\n\n"), "no failure detail captured");
        assert_eq!(sanitize_failure("a\nb"), "a / b");
    }
}
