//! Attempt state machine for one story.
//!
//! Drives implement → verify → decide for a single story until it completes,
//! exhausts its retry ceiling, or the operator stops the run. State is
//! persisted after every phase so a killed process resumes at the story and
//! attempt count it left off at.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::state::{Mode, RunStatus, SessionKind, StateDoc, StoryStatus, StoryUpdate};
use crate::core::story::Story;
use crate::core::verdict::{ParseMethod, VerdictKind, combined_learnings, parse_verdict};
use crate::io::config::Config;
use crate::io::exec_log::ExecutionLog;
use crate::io::gate::{OperatorDecision, OperatorGate};
use crate::io::git::Git;
use crate::io::prompt::PromptBuilder;
use crate::io::session::{SESSION_ERROR_PREFIX, SessionRunner, is_session_error};
use crate::io::state_store::persist;

/// Failure text persisted to state is capped; full session output is not a
/// state-file concern.
const FAILURE_CAP: usize = 500;
/// Verification-only re-runs allowed per attempt when the implementation
/// landed commits but the verdict was unreadable.
const VERIFY_ONLY_CAP: u32 = 2;

/// How the working tree is returned to a known state before a retry.
pub enum ResetStrategy {
    /// Discard tracked edits and untracked files; agent commits stay.
    WorkingTree,
    /// Hard-reset to the HEAD captured before the story's first attempt,
    /// then restore and stage the listed tracking artifacts (the reset
    /// rewinds them along with agent commits).
    Baseline { tracking: Vec<PathBuf> },
}

/// Terminal result of driving one story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryOutcome {
    Completed { attempts: u32 },
    Failed { attempts: u32 },
    /// Guarded-mode operator chose to stop; run status is already `Paused`.
    Paused,
}

/// One story's worth of orchestration context.
pub struct StoryRunner<'a> {
    pub config: &'a Config,
    pub project_root: &'a Path,
    /// State file this run persists to (single or chain).
    pub state_path: &'a Path,
    pub git: &'a Git,
    pub session: &'a dyn SessionRunner,
    pub prompts: &'a PromptBuilder,
    pub log: &'a ExecutionLog,
    pub feature: &'a str,
    /// Backlog document path as interpolated into prompts.
    pub document: &'a str,
    pub reset: ResetStrategy,
}

impl StoryRunner<'_> {
    /// Drive one story to a terminal outcome.
    #[instrument(skip_all, fields(story = %story.id))]
    pub fn run_story(
        &self,
        doc: &mut StateDoc,
        story: &Story,
        gate: &mut dyn OperatorGate,
    ) -> Result<StoryOutcome> {
        let max_retries = doc.max_retries();
        let mut attempts = doc.story(&story.id).map(|s| s.attempts).unwrap_or(0);

        // Retry reset target: HEAD before this story's first attempt. Earlier
        // stories' commits sit below it and are never rewound.
        let story_baseline = self.git.head_sha()?;

        loop {
            if attempts >= max_retries {
                match doc.mode() {
                    Mode::Autonomous => {
                        doc.apply_story_update(
                            &story.id,
                            StoryUpdate {
                                status: StoryStatus::Failed,
                                attempt: attempts,
                                learnings: Vec::new(),
                                failure: None,
                            },
                        );
                        persist(self.state_path, doc)?;
                        self.log
                            .story_abandoned(&story.id, &story.title, max_retries)?;
                        warn!(attempts, "retry ceiling reached, abandoning story");
                        return Ok(StoryOutcome::Failed { attempts });
                    }
                    Mode::Guarded => match gate.decide(&story.id, attempts)? {
                        OperatorDecision::Continue => {
                            info!("operator continued; attempt counter reset");
                            doc.apply_story_update(
                                &story.id,
                                StoryUpdate {
                                    status: StoryStatus::Retrying,
                                    attempt: 0,
                                    learnings: Vec::new(),
                                    failure: None,
                                },
                            );
                            persist(self.state_path, doc)?;
                            attempts = 0;
                            // The counter restarts at 1, so the `attempt > 1`
                            // reset below will not fire: clear the abandoned
                            // attempt's debris here.
                            self.reset_working_tree(&story_baseline)?;
                        }
                        OperatorDecision::Stop => {
                            info!("operator stopped; pausing run");
                            doc.set_status(RunStatus::Paused);
                            persist(self.state_path, doc)?;
                            return Ok(StoryOutcome::Paused);
                        }
                    },
                }
            }

            let attempt = attempts + 1;
            if attempt > 1 {
                self.reset_working_tree(&story_baseline)?;
            }

            doc.apply_story_update(
                &story.id,
                StoryUpdate {
                    status: StoryStatus::InProgress,
                    attempt,
                    learnings: Vec::new(),
                    failure: None,
                },
            );
            persist(self.state_path, doc)?;
            info!(attempt, max_retries, "starting attempt");

            let attempt_baseline = self.git.head_sha()?;
            let impl_prompt = self.prompts.implementation(
                self.config,
                doc,
                story,
                self.feature,
                self.document,
                attempt,
            )?;
            let impl_output = self.session.run(&impl_prompt, self.project_root);
            doc.record_session(SessionKind::Implementation);
            persist(self.state_path, doc)?;

            if is_session_error(&impl_output) {
                warn!(attempt, "implementation session failed, skipping verification");
                let detail = impl_output
                    .strip_prefix(SESSION_ERROR_PREFIX)
                    .unwrap_or(&impl_output)
                    .trim();
                let learning = format!("Session error: {}", truncate_chars(detail, FAILURE_CAP));
                self.record_failed_attempt(doc, story, attempt, &impl_output, vec![learning])?;
                attempts = attempt;
                continue;
            }

            // Verify, re-running a bounded number of times when the
            // implementation landed commits but the verdict is unreadable.
            let verify_prompt = self.prompts.verification(self.config, story, &impl_output)?;
            let mut verify_only = 0u32;
            let verdict = loop {
                let verify_output = self.session.run(&verify_prompt, self.project_root);
                doc.record_session(SessionKind::Verification);
                persist(self.state_path, doc)?;

                let verdict = parse_verdict(&verify_output);
                if verdict.method == ParseMethod::None
                    && verify_only < VERIFY_ONLY_CAP
                    && self.git.head_sha()? != attempt_baseline
                {
                    verify_only += 1;
                    warn!(
                        attempt,
                        verify_only, "verdict unreadable with work landed, re-verifying"
                    );
                    continue;
                }
                break verdict;
            };

            match verdict.kind {
                VerdictKind::Pass => {
                    let learnings = combined_learnings(&impl_output, &verdict);
                    doc.apply_story_update(
                        &story.id,
                        StoryUpdate {
                            status: StoryStatus::Completed,
                            attempt,
                            learnings,
                            failure: None,
                        },
                    );
                    persist(self.state_path, doc)?;
                    self.log.story_completed(&story.id, &story.title, attempt)?;
                    info!(attempt, "story completed");
                    return Ok(StoryOutcome::Completed { attempts: attempt });
                }
                VerdictKind::Fail => {
                    let failure = failure_detail(&verdict);
                    let learnings = verifier_learnings(&verdict);
                    self.record_failed_attempt(doc, story, attempt, &failure, learnings)?;
                    attempts = attempt;
                }
            }
        }
    }

    fn record_failed_attempt(
        &self,
        doc: &mut StateDoc,
        story: &Story,
        attempt: u32,
        failure: &str,
        learnings: Vec<String>,
    ) -> Result<()> {
        let capped = truncate_chars(failure, FAILURE_CAP);
        doc.apply_story_update(
            &story.id,
            StoryUpdate {
                status: StoryStatus::Retrying,
                attempt,
                learnings,
                failure: Some(capped.clone()),
            },
        );
        persist(self.state_path, doc)?;
        self.log
            .attempt_failed(&story.id, &story.title, attempt, &capped)?;
        Ok(())
    }

    fn reset_working_tree(&self, baseline: &str) -> Result<()> {
        match &self.reset {
            ResetStrategy::WorkingTree => self.git.checkout_clean(),
            ResetStrategy::Baseline { tracking } => {
                let mut snapshot = Vec::new();
                for path in tracking {
                    if path.exists() {
                        let contents = fs::read(path)
                            .with_context(|| format!("snapshot {}", path.display()))?;
                        snapshot.push((path.clone(), contents));
                    }
                }
                self.git.reset_hard(baseline)?;
                for (path, contents) in &snapshot {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create directory {}", parent.display()))?;
                    }
                    fs::write(path, contents)
                        .with_context(|| format!("restore {}", path.display()))?;
                }
                if !snapshot.is_empty() {
                    let refs: Vec<&Path> = snapshot.iter().map(|(p, _)| p.as_path()).collect();
                    self.git.add_paths(&refs)?;
                }
                Ok(())
            }
        }
    }
}

/// Human-readable failure detail for a failed verdict.
fn failure_detail(verdict: &crate::core::verdict::Verdict) -> String {
    if !verdict.recommendations.is_empty() {
        return verdict.recommendations.clone();
    }
    if !verdict.notes.is_empty() {
        return verdict.notes.clone();
    }
    match &verdict.raw_tail {
        Some(tail) => format!("Unparseable verifier output: {tail}"),
        None => "Verification failed without detail".to_string(),
    }
}

/// Verifier feedback worth carrying into future attempts.
fn verifier_learnings(verdict: &crate::core::verdict::Verdict) -> Vec<String> {
    let mut learnings = Vec::new();
    if !verdict.recommendations.is_empty() {
        learnings.push(format!("Verifier: {}", verdict.recommendations));
    }
    learnings
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    text.chars().take(cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ExecutionState;
    use crate::io::prompt::PromptBuilder;
    use crate::test_support::{ScriptedGate, ScriptedSession, TestRepo, outputs};
    use std::process::Command;

    const BACKLOG: &str = "\
### US-001: Add widget
**Description:** Build the widget.
- [ ] widget exists
";

    struct Fixture {
        repo: TestRepo,
        config: Config,
        prompts: PromptBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = TestRepo::new().expect("repo");
            let config = Config {
                document: "prd.md".to_string(),
                feature: "widget".to_string(),
                branch: "main".to_string(),
                ..Config::default()
            };
            let prompts = PromptBuilder::from_config(repo.root(), &config).expect("prompts");
            Self {
                repo,
                config,
                prompts,
            }
        }

        fn state_path(&self) -> PathBuf {
            self.repo.root().join(".orchestrator/state.json")
        }
    }

    fn story() -> Story {
        crate::core::story::parse_stories(BACKLOG).remove(0)
    }

    fn doc(mode: Mode, max_retries: u32) -> StateDoc {
        StateDoc::Single(ExecutionState::new("prd.md", "main", mode, max_retries))
    }

    fn run_one(
        fixture: &Fixture,
        session: &ScriptedSession,
        doc: &mut StateDoc,
        gate: &mut dyn OperatorGate,
    ) -> StoryOutcome {
        let git = Git::new(fixture.repo.root());
        let log = ExecutionLog::new(fixture.repo.root().join(".orchestrator/EXECUTION_LOG.md"));
        std::fs::create_dir_all(fixture.repo.root().join(".orchestrator")).expect("dir");
        let state_path = fixture.state_path();
        let runner = StoryRunner {
            config: &fixture.config,
            project_root: fixture.repo.root(),
            state_path: &state_path,
            git: &git,
            session,
            prompts: &fixture.prompts,
            log: &log,
            feature: "widget",
            document: "prd.md",
            reset: ResetStrategy::WorkingTree,
        };
        runner.run_story(doc, &story(), gate).expect("run story")
    }

    #[test]
    fn pass_on_first_attempt_completes_story() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 1 });

        let state = doc.story("US-001").expect("state");
        assert_eq!(state.status, Some(StoryStatus::Completed));
        assert_eq!(state.attempts, 1);
        assert!(state.learnings.iter().any(|l| l == "kept changes minimal"));
        assert_eq!(session.calls(), 2);
    }

    #[test]
    fn failed_verdict_retries_then_completes() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("widget has no tests"),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 2 });

        let state = doc.story("US-001").expect("state");
        assert_eq!(state.attempts, 2);
        assert_eq!(state.last_failure.as_deref(), Some("widget has no tests"));
        assert!(
            state
                .learnings
                .iter()
                .any(|l| l == "Verifier: widget has no tests")
        );
    }

    #[test]
    fn retry_exhaustion_abandons_story_in_autonomous_mode() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("still wrong"),
            outputs::implementation_ok(),
            outputs::verification_fail("still wrong"),
        ]);
        let mut doc = doc(Mode::Autonomous, 2);
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Failed { attempts: 2 });
        // Exactly max_retries attempts: 2 implementation + 2 verification.
        assert_eq!(session.calls(), 4);
        assert_eq!(session.remaining(), 0);

        let state = doc.story("US-001").expect("state");
        assert_eq!(state.status, Some(StoryStatus::Failed));
    }

    #[test]
    fn implementation_session_error_skips_verification() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            "SESSION_ERROR: Timed out after 900s".to_string(),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 2 });
        // Attempt 1 used one session only (no verification after the error).
        assert_eq!(session.calls(), 3);

        let state = doc.story("US-001").expect("state");
        assert!(
            state
                .last_failure
                .as_deref()
                .expect("failure recorded")
                .contains("Timed out")
        );
        // The error is carried into later attempts as a learning.
        assert!(
            state
                .learnings
                .iter()
                .any(|l| l.starts_with("Session error:") && l.contains("Timed out"))
        );
    }

    #[test]
    fn working_tree_is_reset_between_attempts() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new(Vec::<String>::new());
        session.push_with_effect(outputs::implementation_ok(), |root| {
            std::fs::write(root.join("scratch.txt"), "debris").expect("write");
        });
        session.push_with_effect(outputs::verification_fail("incomplete"), |_| {});
        session.push_with_effect(outputs::implementation_ok(), |root| {
            // Attempt 1 debris must be gone before attempt 2 starts.
            assert!(!root.join("scratch.txt").exists());
        });
        session.push_with_effect(outputs::verification_pass(), |_| {});

        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);
        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 2 });
        assert!(!fixture.repo.root().join("scratch.txt").exists());
    }

    #[test]
    fn guarded_gate_continue_resets_attempt_counter() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("not yet"),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut doc = doc(Mode::Guarded, 1);
        let mut gate = ScriptedGate::new([OperatorDecision::Continue]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        // Counter was reset, so the passing attempt is attempt 1 again.
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 1 });
        assert_eq!(gate.asked, vec![("US-001".to_string(), 1)]);
    }

    #[test]
    fn guarded_gate_continue_resets_working_tree() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new(Vec::<String>::new());
        session.push_with_effect(outputs::implementation_ok(), |root| {
            std::fs::write(root.join("scratch.txt"), "debris").expect("write");
        });
        session.push_with_effect(outputs::verification_fail("not yet"), |_| {});
        session.push_with_effect(outputs::implementation_ok(), |root| {
            // The abandoned attempt's debris is gone once the operator
            // continues, even though the counter restarted at 1.
            assert!(!root.join("scratch.txt").exists());
        });
        session.push_with_effect(outputs::verification_pass(), |_| {});

        let mut doc = doc(Mode::Guarded, 1);
        let mut gate = ScriptedGate::new([OperatorDecision::Continue]);
        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 1 });
        assert!(!fixture.repo.root().join("scratch.txt").exists());
    }

    #[test]
    fn guarded_gate_stop_pauses_run() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("not yet"),
        ]);
        let mut doc = doc(Mode::Guarded, 1);
        let mut gate = ScriptedGate::new([OperatorDecision::Stop]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Paused);
        assert_eq!(doc.status(), RunStatus::Paused);
    }

    #[test]
    fn unreadable_verdict_with_landed_work_reverifies_without_new_attempt() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new(Vec::<String>::new());
        session.push_with_effect(outputs::implementation_ok(), |root| {
            // Simulate the agent committing its work.
            std::fs::write(root.join("widget.rs"), "pub struct Widget;\n").expect("write");
            let commit = |args: &[&str]| {
                assert!(
                    Command::new("git")
                        .args(args)
                        .current_dir(root)
                        .status()
                        .expect("git")
                        .success()
                );
            };
            commit(&["add", "-A"]);
            commit(&["commit", "-m", "feat(widget): US-001 - Add widget"]);
        });
        session.push_with_effect("rambling with no verdict at all", |_| {});
        session.push_with_effect("still rambling incoherently", |_| {});
        session.push_with_effect(outputs::verification_pass(), |_| {});

        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);
        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);

        // One implementation session, three verification sessions, still
        // attempt 1.
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 1 });
        assert_eq!(session.calls(), 4);
    }

    #[test]
    fn unreadable_verdict_without_landed_work_counts_as_failed_attempt() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            "rambling with no verdict at all".to_string(),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut doc = doc(Mode::Autonomous, 3);
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        // HEAD never moved, so no verify-only retry: straight to attempt 2.
        assert_eq!(outcome, StoryOutcome::Completed { attempts: 2 });
        assert_eq!(session.calls(), 4);
    }

    #[test]
    fn resume_continues_from_persisted_attempt_count() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("nope"),
        ]);
        let mut doc = doc(Mode::Autonomous, 3);
        // Two attempts already burned in a previous process.
        doc.apply_story_update(
            "US-001",
            StoryUpdate {
                status: StoryStatus::Retrying,
                attempt: 2,
                learnings: Vec::new(),
                failure: Some("earlier failure".to_string()),
            },
        );
        let mut gate = ScriptedGate::new([]);

        let outcome = run_one(&fixture, &session, &mut doc, &mut gate);
        assert_eq!(outcome, StoryOutcome::Failed { attempts: 3 });
        // Only the one remaining attempt ran.
        assert_eq!(session.calls(), 2);
    }
}
