//! Git adapter for orchestrator source-control touches.
//!
//! The orchestrator resets working trees between attempts, tags checkpoints,
//! and commits tracking artifacts deterministically, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        Ok(name)
    }

    /// Return the full HEAD commit sha.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Discard tracked modifications and untracked files.
    ///
    /// The single-group retry reset: `checkout -- .` plus `clean -fd`.
    /// Commits made by the agent since the baseline are left in place.
    #[instrument(skip_all)]
    pub fn checkout_clean(&self) -> Result<()> {
        debug!("resetting working tree (checkout + clean)");
        self.run_checked(&["checkout", "--", "."])?;
        // The orchestrator's own tracking directory is never debris.
        self.run_checked(&["clean", "-fd", "-e", ".orchestrator"])?;
        Ok(())
    }

    /// Hard-reset the branch to `sha`, discarding commits past it.
    ///
    /// The chain-mode retry reset; callers must restore tracking artifacts
    /// afterwards since the reset rewinds them too.
    #[instrument(skip_all, fields(sha))]
    pub fn reset_hard(&self, sha: &str) -> Result<()> {
        debug!(sha, "hard resetting working tree");
        self.run_checked(&["reset", "--hard", sha])?;
        self.run_checked(&["clean", "-fd", "-e", ".orchestrator"])?;
        Ok(())
    }

    /// Create an annotated-free lightweight tag; re-tagging the same name on
    /// resume moves it rather than erroring.
    pub fn tag(&self, name: &str) -> Result<()> {
        self.run_checked(&["tag", "--force", name])?;
        Ok(())
    }

    pub fn tag_exists(&self, name: &str) -> Result<bool> {
        let out = self.run_capture(&["tag", "--list", name])?;
        Ok(!out.trim().is_empty())
    }

    /// Stage specific paths, tolerating ones that do not exist yet.
    pub fn add_paths(&self, paths: &[&Path]) -> Result<()> {
        let mut args: Vec<String> = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
        for path in paths {
            args.push(path.display().to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs)?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// True if `base` is an ancestor of HEAD. Used for the warn-only
    /// ancestry check; an unknown `base` reads as false rather than erroring.
    pub fn is_ancestor_of_head(&self, base: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", base, "HEAD"])?;
        Ok(out.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
