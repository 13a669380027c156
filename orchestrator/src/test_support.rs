//! Shared test fixtures: throwaway git repos and scripted doubles.
//!
//! Available to unit tests and, via the `test-support` feature, to
//! integration tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::io::gate::{OperatorDecision, OperatorGate};
use crate::io::session::SessionRunner;

/// A temporary git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Contents of the README committed at init, for reset assertions.
    pub const README: &'static str = "# Test project\n";

    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create tempdir")?;
        let root = dir.path();
        run_git(root, &["init", "--initial-branch=main"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "Test User"])?;
        run_git(root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), Self::README).context("write README")?;
        run_git(root, &["add", "-A"])?;
        run_git(root, &["commit", "-m", "init"])?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file relative to the repo root, creating parent directories.
    pub fn write_file(&self, rel: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(rel.as_ref());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Stage everything and commit.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        run_git(self.root(), &["add", "-A"])?;
        run_git(self.root(), &["commit", "-m", message])?;
        Ok(())
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Side effect run against the project root before a scripted output is
/// returned, standing in for filesystem/git work a real agent would do.
pub type SessionEffect = Box<dyn Fn(&Path) + Send>;

struct ScriptedStep {
    output: String,
    effect: Option<SessionEffect>,
}

/// [`SessionRunner`] double that replays canned outputs in order.
///
/// Prompts are recorded for assertion. Running past the end of the script
/// returns a session-error sentinel so a looping bug fails fast instead of
/// hanging.
pub struct ScriptedSession {
    steps: Mutex<VecDeque<ScriptedStep>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSession {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: Mutex::new(
                outputs
                    .into_iter()
                    .map(|output| ScriptedStep {
                        output: output.into(),
                        effect: None,
                    })
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Append a step whose effect runs before its output is returned.
    pub fn push_with_effect(
        &self,
        output: impl Into<String>,
        effect: impl Fn(&Path) + Send + 'static,
    ) {
        self.steps
            .lock()
            .expect("steps lock")
            .push_back(ScriptedStep {
                output: output.into(),
                effect: Some(Box::new(effect)),
            });
    }

    /// Prompts seen so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().expect("steps lock").len()
    }
}

impl SessionRunner for ScriptedSession {
    fn run(&self, prompt: &str, workdir: &Path) -> String {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(step) => {
                if let Some(effect) = &step.effect {
                    effect(workdir);
                }
                step.output
            }
            None => "SESSION_ERROR: scripted session exhausted".to_string(),
        }
    }
}

/// [`OperatorGate`] double replaying canned decisions.
pub struct ScriptedGate {
    decisions: VecDeque<OperatorDecision>,
    pub asked: Vec<(String, u32)>,
}

impl ScriptedGate {
    pub fn new<I>(decisions: I) -> Self
    where
        I: IntoIterator<Item = OperatorDecision>,
    {
        Self {
            decisions: decisions.into_iter().collect(),
            asked: Vec::new(),
        }
    }
}

impl OperatorGate for ScriptedGate {
    fn decide(&mut self, story_id: &str, attempts: u32) -> Result<OperatorDecision> {
        self.asked.push((story_id.to_string(), attempts));
        Ok(self
            .decisions
            .pop_front()
            .unwrap_or(OperatorDecision::Stop))
    }
}

/// Canned agent outputs used across orchestration tests.
pub mod outputs {
    /// Implementation output with the structured result block.
    pub fn implementation_ok() -> String {
        "\
IMPLEMENTATION_RESULT:
files_changed:
- src/lib.rs
criteria_met:
- all criteria satisfied
learnings:
- kept changes minimal
issues:
END_IMPLEMENTATION_RESULT
"
        .to_string()
    }

    /// Verification output with a structured pass verdict.
    pub fn verification_pass() -> String {
        "\
VERIFICATION_RESULT:
verdict: pass
recommendations: \"none\"
overall_notes: \"looks correct\"
END_VERIFICATION_RESULT
"
        .to_string()
    }

    /// Verification output with a structured fail verdict.
    pub fn verification_fail(recommendation: &str) -> String {
        format!(
            "\
VERIFICATION_RESULT:
verdict: fail
recommendations: \"{recommendation}\"
overall_notes: \"criteria unmet\"
END_VERIFICATION_RESULT
"
        )
    }
}
