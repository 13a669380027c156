//! Single-group run driver.
//!
//! Loads or creates execution state, then loops: pause check, next incomplete
//! story, attempt machine. The backlog document is re-read before every
//! selection so agent and operator edits to checkboxes are honored.

use anyhow::{Result, bail};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::attempt::{ResetStrategy, StoryOutcome, StoryRunner};
use crate::core::state::{ExecutionState, RunStatus, StateDoc, StoryStatus};
use crate::core::story::Story;
use crate::io::config::Config;
use crate::io::exec_log::ExecutionLog;
use crate::io::gate::OperatorGate;
use crate::io::git::Git;
use crate::io::pause;
use crate::io::paths::OrchestratorPaths;
use crate::io::prompt::PromptBuilder;
use crate::io::session::SessionRunner;
use crate::io::state_store::{load_execution_state, persist, repair_for_resume};
use crate::io::stories::load_stories;

/// Terminal result of a run, mapped to an exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Paused,
    /// A chain prerequisite gate failed; never produced by single-group runs.
    Blocked,
}

/// Drive a single-group run to a terminal outcome.
#[instrument(skip_all, fields(feature = %config.feature))]
pub fn execute(
    project_root: &Path,
    config: &Config,
    session: &dyn SessionRunner,
    gate: &mut dyn OperatorGate,
) -> Result<RunOutcome> {
    config.validate_for_run()?;
    let paths = OrchestratorPaths::new(project_root);
    let git = Git::new(project_root);

    let branch = git.current_branch()?;
    if branch != config.branch {
        bail!(
            "run is bound to branch '{}' but HEAD is on '{branch}'",
            config.branch
        );
    }

    let (state, resumed) = match load_execution_state(&paths.state_path)? {
        Some(mut state) => {
            if state.document != config.document {
                warn!(
                    state_document = %state.document,
                    config_document = %config.document,
                    "state file was created for a different document"
                );
            }
            repair_for_resume(&mut state.status);
            (state, true)
        }
        None => (
            ExecutionState::new(&config.document, &config.branch, config.mode, config.max_retries),
            false,
        ),
    };

    let backlog_size = load_stories(&project_root.join(&config.document))?.len();
    let log = ExecutionLog::new(&paths.log_path);
    log.run_started(
        &config.feature,
        &config.document,
        &config.branch,
        config.mode,
        config.max_retries,
        backlog_size,
        resumed,
    )?;

    let mut doc = StateDoc::Single(state);
    persist(&paths.state_path, &mut doc)?;

    let prompts = PromptBuilder::from_config(project_root, config)?;
    let runner = StoryRunner {
        config,
        project_root,
        state_path: &paths.state_path,
        git: &git,
        session,
        prompts: &prompts,
        log: &log,
        feature: &config.feature,
        document: &config.document,
        reset: ResetStrategy::WorkingTree,
    };

    let poll = Duration::from_millis(config.pause_poll_millis);
    loop {
        pause::wait_while_paused(&paths.pause_path, poll);

        let stories = load_stories(&project_root.join(&config.document))?;
        let Some(story) = next_story(&stories, &doc) else {
            let completed = doc
                .stories()
                .values()
                .filter(|s| s.status == Some(StoryStatus::Completed))
                .count() as u32;
            let total_sessions = match &doc {
                StateDoc::Single(s) => s.sessions.total,
                StateDoc::Chain { state, .. } => state.sessions.total,
            };
            doc.set_status(RunStatus::Completed);
            persist(&paths.state_path, &mut doc)?;
            log.run_completed(&config.feature, completed, total_sessions)?;
            info!(completed, "backlog drained");
            return Ok(RunOutcome::Completed);
        };

        match runner.run_story(&mut doc, story, gate)? {
            StoryOutcome::Completed { .. } => {}
            StoryOutcome::Failed { attempts } => {
                warn!(story = %story.id, attempts, "story failed, run failed");
                doc.set_status(RunStatus::Failed);
                persist(&paths.state_path, &mut doc)?;
                return Ok(RunOutcome::Failed);
            }
            StoryOutcome::Paused => return Ok(RunOutcome::Paused),
        }
    }
}

/// First story not complete in the document and not completed in state.
///
/// The document checkbox is consulted first; a story checked off out-of-band
/// counts as done even if state lags. The state cross-check covers the other
/// direction, where the agent completed work but forgot the checkbox.
pub(crate) fn next_story<'a>(stories: &'a [Story], doc: &StateDoc) -> Option<&'a Story> {
    stories.iter().find(|story| {
        if story.completed {
            return false;
        }
        let state_completed = matches!(
            doc.story(&story.id).and_then(|s| s.status),
            Some(StoryStatus::Completed)
        );
        if state_completed {
            warn!(story = %story.id, "state says completed but document checkbox is unchecked");
        }
        !state_completed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Mode;
    use crate::test_support::{ScriptedGate, ScriptedSession, TestRepo, outputs};
    use std::fs;

    const BACKLOG: &str = "\
# Widget backlog

### US-001: First story
**Description:** One.
- [ ] first criterion

### US-002: Second story
**Description:** Two.
- [ ] second criterion
";

    fn fixture() -> (TestRepo, Config) {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("prd.md", BACKLOG).expect("backlog");
        repo.commit_all("docs: add backlog").expect("commit");
        let config = Config {
            document: "prd.md".to_string(),
            feature: "widget".to_string(),
            branch: "main".to_string(),
            ..Config::default()
        };
        (repo, config)
    }

    #[test]
    fn two_story_backlog_runs_to_completion() {
        let (repo, config) = fixture();
        // US-001 passes first try; US-002 fails twice then passes.
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_pass(),
            outputs::implementation_ok(),
            outputs::verification_fail("missing edge case"),
            outputs::implementation_ok(),
            outputs::verification_fail("still missing"),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut gate = ScriptedGate::new([]);

        let outcome = execute(repo.root(), &config, &session, &mut gate).expect("run");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.remaining(), 0);

        let state = load_execution_state(&repo.root().join(".orchestrator/state.json"))
            .expect("load")
            .expect("present");
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stories["US-001"].attempts, 1);
        assert_eq!(state.stories["US-002"].attempts, 3);
        assert_eq!(state.sessions.implementation, 4);
        assert_eq!(state.sessions.verification, 4);

        let log = fs::read_to_string(repo.root().join(".orchestrator/EXECUTION_LOG.md"))
            .expect("read log");
        assert_eq!(log.matches("❌").count(), 2);
        assert_eq!(log.matches("✅").count(), 2);
        assert!(log.contains("**Completed: widget**"));
    }

    #[test]
    fn pause_sentinel_blocks_until_removed() {
        let (repo, config) = fixture();
        let config = Config {
            pause_poll_millis: 10,
            ..config
        };
        fs::create_dir_all(repo.root().join(".orchestrator")).expect("dir");
        let sentinel = repo.root().join(".orchestrator/pause");
        fs::write(&sentinel, "").expect("sentinel");

        let sentinel_clone = sentinel.clone();
        let remover = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            fs::remove_file(&sentinel_clone).expect("remove");
        });

        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_pass(),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut gate = ScriptedGate::new([]);
        let outcome = execute(repo.root(), &config, &session, &mut gate).expect("run");
        remover.join().expect("join");

        // No session ran until the sentinel was gone; then the run completed.
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.calls(), 4);
    }

    #[test]
    fn completed_run_resumes_without_new_sessions() {
        let (repo, config) = fixture();
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_pass(),
            outputs::implementation_ok(),
            outputs::verification_pass(),
        ]);
        let mut gate = ScriptedGate::new([]);
        assert_eq!(
            execute(repo.root(), &config, &session, &mut gate).expect("run"),
            RunOutcome::Completed
        );

        // Second invocation reloads state from disk and finds nothing to do.
        let idle_session = ScriptedSession::new(Vec::<String>::new());
        let outcome = execute(repo.root(), &config, &idle_session, &mut gate).expect("resume");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(idle_session.calls(), 0);
    }

    #[test]
    fn exhausted_story_fails_the_run() {
        let (repo, config) = fixture();
        let config = Config {
            max_retries: 1,
            ..config
        };
        let session = ScriptedSession::new([
            outputs::implementation_ok(),
            outputs::verification_fail("wrong"),
        ]);
        let mut gate = ScriptedGate::new([]);

        let outcome = execute(repo.root(), &config, &session, &mut gate).expect("run");
        assert_eq!(outcome, RunOutcome::Failed);
        let state = load_execution_state(&repo.root().join(".orchestrator/state.json"))
            .expect("load")
            .expect("present");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stories["US-001"].status, Some(StoryStatus::Failed));
    }

    #[test]
    fn branch_mismatch_is_fatal() {
        let (repo, config) = fixture();
        let config = Config {
            branch: "feat/other".to_string(),
            ..config
        };
        let session = ScriptedSession::new(Vec::<String>::new());
        let mut gate = ScriptedGate::new([]);
        let err = execute(repo.root(), &config, &session, &mut gate).unwrap_err();
        assert!(err.to_string().contains("bound to branch"));
    }

    #[test]
    fn document_checkbox_overrides_stale_state() {
        let (repo, config) = fixture();
        // Both stories already checked in the document: nothing to run.
        let done = BACKLOG.replace("- [ ]", "- [x]");
        repo.write_file("prd.md", &done).expect("rewrite");

        let session = ScriptedSession::new(Vec::<String>::new());
        let mut gate = ScriptedGate::new([]);
        let outcome = execute(repo.root(), &config, &session, &mut gate).expect("run");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.calls(), 0);
    }
}
