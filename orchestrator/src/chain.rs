//! Chain controller: ordered feature groups on one shared branch.
//!
//! Each group is a backlog document plus a feature name and declared
//! prerequisites. A prerequisite is satisfied only when its group's document
//! has been archived; an unmet prerequisite blocks the chain without touching
//! the group. Completing a group runs a validation session, commits tracking
//! artifacts, tags a checkpoint, and archives the document.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::attempt::{ResetStrategy, StoryOutcome, StoryRunner};
use crate::core::state::{
    ChainState, GroupEntry, GroupStatus, RunStatus, SessionKind, StateDoc, now_iso,
};
use crate::io::config::{ChainConfig, Config, GroupConfig};
use crate::io::exec_log::ExecutionLog;
use crate::io::gate::OperatorGate;
use crate::io::git::Git;
use crate::io::pause::wait_while_paused;
use crate::io::paths::{OrchestratorPaths, file_name};
use crate::io::prompt::PromptBuilder;
use crate::io::session::{SessionRunner, is_session_error};
use crate::io::state_store::{load_chain_state, persist, persist_chain, repair_for_resume};
use crate::io::stories::load_stories;
use crate::run::{RunOutcome, next_story};

static STATUS_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\*Status:\*\*.*$").unwrap());
static UPDATED_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\*Last Updated:\*\*.*$").unwrap());

/// Drive a chain run to a terminal outcome.
#[instrument(skip_all)]
pub fn execute(
    project_root: &Path,
    config: &Config,
    session: &dyn SessionRunner,
    gate: &mut dyn OperatorGate,
) -> Result<RunOutcome> {
    let chain_cfg = config.validate_for_chain()?;
    let paths = OrchestratorPaths::new(project_root);
    let git = Git::new(project_root);

    let branch = git.current_branch()?;
    if branch != config.branch {
        bail!(
            "chain is bound to branch '{}' but HEAD is on '{branch}'",
            config.branch
        );
    }
    if !chain_cfg.base_branch.is_empty()
        && !git.is_ancestor_of_head(&chain_cfg.base_branch)?
    {
        warn!(
            base = %chain_cfg.base_branch,
            "base branch is not an ancestor of HEAD; chain may be on a stale branch"
        );
    }

    let (mut state, resumed) = match load_chain_state(&paths.chain_state_path)? {
        Some(mut state) => {
            repair_for_resume(&mut state.status);
            (state, true)
        }
        None => (
            ChainState::new(&chain_cfg.name, &config.branch, config.mode, config.max_retries),
            false,
        ),
    };

    let log = ExecutionLog::new(&paths.log_path);
    log.chain_started(
        &chain_cfg.name,
        &config.branch,
        config.mode,
        config.max_retries,
        chain_cfg.groups.len(),
        resumed,
    )?;
    persist_chain(&paths.chain_state_path, &mut state)?;

    let prompts = PromptBuilder::from_config(project_root, config)?;
    let group_count = chain_cfg.groups.len();
    let mut ran_any_group = false;

    let poll = Duration::from_millis(config.pause_poll_millis);
    for (index, group) in chain_cfg.groups.iter().enumerate() {
        if group_is_complete(project_root, chain_cfg, group, &state) {
            info!(group = %group.id, "group already complete, skipping");
            continue;
        }

        wait_while_paused(&paths.pause_path, poll);

        if let Some(missing) = unmet_prerequisite(project_root, chain_cfg, group) {
            warn!(group = %group.id, missing = %missing, "prerequisite not archived, blocking");
            state.status = RunStatus::Blocked;
            persist_chain(&paths.chain_state_path, &mut state)?;
            return Ok(RunOutcome::Blocked);
        }

        ran_any_group = true;
        state
            .groups
            .entry(group.id.clone())
            .or_insert_with(|| GroupEntry::new(&group.feature));
        state.current_group = Some(group.id.clone());
        persist_chain(&paths.chain_state_path, &mut state)?;

        let runner = StoryRunner {
            config,
            project_root,
            state_path: &paths.chain_state_path,
            git: &git,
            session,
            prompts: &prompts,
            log: &log,
            feature: &group.feature,
            document: &group.document,
            reset: ResetStrategy::Baseline {
                tracking: paths.tracking_files(),
            },
        };

        let mut doc = StateDoc::Chain {
            state,
            group: group.id.clone(),
        };
        let group_outcome = run_group_stories(
            project_root,
            &paths,
            group,
            &runner,
            &mut doc,
            gate,
        )?;
        state = take_chain_state(doc);
        if let Some(outcome) = group_outcome {
            return Ok(outcome);
        }

        // All stories done: validation session, then checkpoint + archive.
        let validation_prompt = prompts.validation(config, &group.feature)?;
        let validation_output = session.run(&validation_prompt, project_root);
        state.sessions.record(SessionKind::Validation);
        persist_chain(&paths.chain_state_path, &mut state)?;
        if is_session_error(&validation_output) {
            warn!(group = %group.id, "validation session failed; continuing");
        }

        archive_document(project_root, &git, &group.document, &chain_cfg.archive_dir)?;
        git.add_paths(&tracking_refs(&paths))?;
        git.commit_staged(&format!(
            "chore({}): checkpoint and archive feature group",
            group.feature
        ))?;

        let tag = format!("checkpoint/{}/{}", chain_cfg.name, group.feature);
        git.tag(&tag)?;
        log.checkpoint(&chain_cfg.name, &group.feature, &tag)?;

        if let Some(entry) = state.groups.get_mut(&group.id) {
            entry.status = GroupStatus::Completed;
            entry.completed_at = Some(now_iso());
        }
        state.current_group = None;
        persist_chain(&paths.chain_state_path, &mut state)?;
        info!(group = %group.id, "group completed");

        let last = index + 1 == group_count;
        if chain_cfg.pause_between_groups && !last {
            info!("pausing between groups; remove the sentinel to continue");
            fs::write(&paths.pause_path, "")
                .with_context(|| format!("create pause sentinel {}", paths.pause_path.display()))?;
            wait_while_paused(&paths.pause_path, poll);
        }
    }

    if ran_any_group {
        // Final completion pass over the whole chain.
        let completion_prompt = prompts.validation(config, &chain_cfg.name)?;
        let completion_output = session.run(&completion_prompt, project_root);
        state.sessions.record(SessionKind::Validation);
        if is_session_error(&completion_output) {
            warn!("chain completion session failed; continuing");
        }
    }

    let completed: u32 = state
        .groups
        .values()
        .flat_map(|g| g.stories.values())
        .filter(|s| s.completed_at.is_some())
        .count() as u32;
    state.status = RunStatus::Completed;
    let total_sessions = state.sessions.total;
    persist_chain(&paths.chain_state_path, &mut state)?;
    log.run_completed(&chain_cfg.name, completed, total_sessions)?;
    info!(completed, "chain completed");
    Ok(RunOutcome::Completed)
}

/// Run the story loop for one group. `Some(outcome)` means the chain must
/// stop with that outcome; `None` means the group's backlog drained.
fn run_group_stories(
    project_root: &Path,
    paths: &OrchestratorPaths,
    group: &GroupConfig,
    runner: &StoryRunner<'_>,
    doc: &mut StateDoc,
    gate: &mut dyn OperatorGate,
) -> Result<Option<RunOutcome>> {
    loop {
        wait_while_paused(
            &paths.pause_path,
            Duration::from_millis(runner.config.pause_poll_millis),
        );
        let stories = load_stories(&project_root.join(&group.document))?;
        let Some(story) = next_story(&stories, doc) else {
            return Ok(None);
        };
        match runner.run_story(doc, story, gate)? {
            StoryOutcome::Completed { .. } => {}
            StoryOutcome::Failed { attempts } => {
                warn!(story = %story.id, attempts, "story failed, chain failed");
                doc.set_status(RunStatus::Failed);
                persist(&paths.chain_state_path, doc)?;
                return Ok(Some(RunOutcome::Failed));
            }
            StoryOutcome::Paused => return Ok(Some(RunOutcome::Paused)),
        }
    }
}

fn take_chain_state(doc: StateDoc) -> ChainState {
    match doc {
        StateDoc::Chain { state, .. } => state,
        // The chain driver only ever constructs chain-scoped docs.
        StateDoc::Single(_) => unreachable!("chain driver built a single-run doc"),
    }
}

/// A group is complete when its document is archived, or (the document may
/// have been archived out-of-band and re-created) its state entry says so.
fn group_is_complete(
    root: &Path,
    chain: &ChainConfig,
    group: &GroupConfig,
    state: &ChainState,
) -> bool {
    if archived_path(root, chain, &group.document).exists() {
        return true;
    }
    state
        .groups
        .get(&group.id)
        .is_some_and(|entry| entry.status == GroupStatus::Completed)
}

/// First prerequisite whose document is not yet in the archive area.
fn unmet_prerequisite<'a>(
    root: &Path,
    chain: &'a ChainConfig,
    group: &'a GroupConfig,
) -> Option<&'a str> {
    for req in &group.requires {
        let Some(req_group) = chain.groups.iter().find(|g| g.id == *req) else {
            // Config validation already rejects unknown ids.
            continue;
        };
        if !archived_path(root, chain, &req_group.document).exists() {
            return Some(req.as_str());
        }
    }
    None
}

fn archived_path(root: &Path, chain: &ChainConfig, document: &str) -> PathBuf {
    root.join(&chain.archive_dir)
        .join(file_name(Path::new(document)))
}

/// Move a completed group's document into the archive area, rewriting its
/// status/date metadata lines, and stage the move.
fn archive_document(root: &Path, git: &Git, document: &str, archive_dir: &str) -> Result<()> {
    let source = root.join(document);
    let contents = fs::read_to_string(&source)
        .with_context(|| format!("read document for archival {}", source.display()))?;

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let rewritten = STATUS_LINE_RE.replace(&contents, "**Status:** Complete");
    let rewritten = UPDATED_LINE_RE.replace(&rewritten, format!("**Last Updated:** {today}"));

    let archive = root.join(archive_dir);
    fs::create_dir_all(&archive)
        .with_context(|| format!("create archive directory {}", archive.display()))?;
    let target = archive.join(file_name(&source));
    fs::write(&target, rewritten.as_bytes())
        .with_context(|| format!("write archived document {}", target.display()))?;
    fs::remove_file(&source)
        .with_context(|| format!("remove archived source {}", source.display()))?;

    git.add_paths(&[&source, &target])?;
    info!(from = %source.display(), to = %target.display(), "archived group document");
    Ok(())
}

fn tracking_refs(paths: &OrchestratorPaths) -> Vec<&Path> {
    vec![
        paths.state_path.as_path(),
        paths.chain_state_path.as_path(),
        paths.log_path.as_path(),
    ]
}
