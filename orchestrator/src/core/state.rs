//! Persisted execution state types and transitions.
//!
//! Two document shapes share one conceptual story state: a single-group run
//! persists an [`ExecutionState`], a chain run persists a [`ChainState`] with
//! one story map per group. [`StateDoc`] is the tagged scope over both so the
//! attempt state machine is written once against a story-state lookup instead
//! of being duplicated per schema.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current UTC time in the ISO form used by all persisted timestamps.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Execution mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fully unattended; retry exhaustion is fatal.
    Autonomous,
    /// Retry exhaustion blocks for an operator decision.
    Guarded,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Autonomous => "autonomous",
            Mode::Guarded => "guarded",
        }
    }
}

/// Overall status of a run or chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Blocked,
}

impl RunStatus {
    /// Terminal statuses are repaired to `Running` when a run resumes.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Per-story status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    InProgress,
    Retrying,
    Completed,
    Failed,
}

/// Persisted record for one story. Never deleted; fields are appended to or
/// overwritten, and `learnings` is append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryState {
    pub status: Option<StoryStatus>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub learnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Which kind of agent session was run, for counter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Implementation,
    Verification,
    Validation,
}

/// Session counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCounters {
    pub total: u32,
    pub implementation: u32,
    pub verification: u32,
    pub validation: u32,
}

impl SessionCounters {
    pub fn record(&mut self, kind: SessionKind) {
        self.total += 1;
        match kind {
            SessionKind::Implementation => self.implementation += 1,
            SessionKind::Verification => self.verification += 1,
            SessionKind::Validation => self.validation += 1,
        }
    }
}

/// Persisted state for a single-group run (`.orchestrator/state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Backlog document file name.
    pub document: String,
    pub branch: String,
    pub mode: Mode,
    pub max_retries: u32,
    pub started_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    pub stories: BTreeMap<String, StoryState>,
    pub sessions: SessionCounters,
}

impl ExecutionState {
    pub fn new(document: &str, branch: &str, mode: Mode, max_retries: u32) -> Self {
        let now = now_iso();
        Self {
            document: document.to_string(),
            branch: branch.to_string(),
            mode,
            max_retries,
            started_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running,
            stories: BTreeMap::new(),
            sessions: SessionCounters::default(),
        }
    }
}

/// Status of one group within a chain. Strictly additive: once `Completed`,
/// an entry is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    InProgress,
    Completed,
}

/// Persisted record for one group of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub feature: String,
    pub status: GroupStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub stories: BTreeMap<String, StoryState>,
}

impl GroupEntry {
    pub fn new(feature: &str) -> Self {
        Self {
            feature: feature.to_string(),
            status: GroupStatus::InProgress,
            started_at: now_iso(),
            completed_at: None,
            stories: BTreeMap::new(),
        }
    }
}

/// Persisted state for a chain run (`.orchestrator/chain_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain: String,
    pub branch: String,
    pub mode: Mode,
    pub max_retries: u32,
    pub started_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_group: Option<String>,
    pub groups: BTreeMap<String, GroupEntry>,
    pub sessions: SessionCounters,
}

impl ChainState {
    pub fn new(chain: &str, branch: &str, mode: Mode, max_retries: u32) -> Self {
        let now = now_iso();
        Self {
            chain: chain.to_string(),
            branch: branch.to_string(),
            mode,
            max_retries,
            started_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running,
            current_group: None,
            groups: BTreeMap::new(),
            sessions: SessionCounters::default(),
        }
    }
}

/// Field-level update applied to a story's persisted record.
///
/// Mirrors the rule that story records are appended to, never rewritten
/// wholesale: learnings extend the existing list, failure text overwrites.
#[derive(Debug, Clone)]
pub struct StoryUpdate {
    pub status: StoryStatus,
    pub attempt: u32,
    pub learnings: Vec<String>,
    pub failure: Option<String>,
}

/// Tagged scope over the two persisted state shapes.
///
/// `Single` addresses the top-level story map; `Chain` addresses the story
/// map of the named group entry. All attempt-machine mutations go through
/// this type so every write hits the correct map.
#[derive(Debug, Clone)]
pub enum StateDoc {
    Single(ExecutionState),
    Chain { state: ChainState, group: String },
}

impl StateDoc {
    pub fn mode(&self) -> Mode {
        match self {
            StateDoc::Single(s) => s.mode,
            StateDoc::Chain { state, .. } => state.mode,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            StateDoc::Single(s) => s.max_retries,
            StateDoc::Chain { state, .. } => state.max_retries,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            StateDoc::Single(s) => s.status,
            StateDoc::Chain { state, .. } => state.status,
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        match self {
            StateDoc::Single(s) => s.status = status,
            StateDoc::Chain { state, .. } => state.status = status,
        }
    }

    pub fn touch(&mut self) {
        let now = now_iso();
        match self {
            StateDoc::Single(s) => s.updated_at = now,
            StateDoc::Chain { state, .. } => state.updated_at = now,
        }
    }

    /// Story map for the current scope (the group entry in chain mode).
    pub fn stories(&self) -> &BTreeMap<String, StoryState> {
        match self {
            StateDoc::Single(s) => &s.stories,
            StateDoc::Chain { state, group } => {
                static EMPTY: BTreeMap<String, StoryState> = BTreeMap::new();
                state.groups.get(group).map(|g| &g.stories).unwrap_or(&EMPTY)
            }
        }
    }

    pub fn story(&self, id: &str) -> Option<&StoryState> {
        self.stories().get(id)
    }

    pub fn record_session(&mut self, kind: SessionKind) {
        match self {
            StateDoc::Single(s) => s.sessions.record(kind),
            StateDoc::Chain { state, .. } => state.sessions.record(kind),
        }
    }

    /// Apply a field-level update to a story's record, creating it if absent.
    pub fn apply_story_update(&mut self, id: &str, update: StoryUpdate) {
        let stories = match self {
            StateDoc::Single(s) => &mut s.stories,
            StateDoc::Chain { state, group } => {
                let entry = state
                    .groups
                    .get_mut(group)
                    .expect("chain scope must point at an existing group entry");
                &mut entry.stories
            }
        };
        let entry = stories.entry(id.to_string()).or_default();
        entry.status = Some(update.status);
        entry.attempts = update.attempt;
        if update.status == StoryStatus::Completed {
            entry.completed_at = Some(now_iso());
        }
        entry.learnings.extend(update.learnings);
        if let Some(failure) = update.failure {
            entry.last_failure = Some(failure);
        }
    }

    /// All learnings recorded for stories other than `except`, in story-id
    /// order (document order for zero-padded ids), oldest first within a
    /// story. Used to seed prompt context.
    pub fn prior_learnings(&self, except: &str) -> Vec<String> {
        self.stories()
            .iter()
            .filter(|(id, _)| id.as_str() != except)
            .flat_map(|(_, s)| s.learnings.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_doc() -> StateDoc {
        StateDoc::Single(ExecutionState::new("prd.md", "feat/x", Mode::Autonomous, 3))
    }

    #[test]
    fn story_update_creates_and_appends() {
        let mut doc = single_doc();
        doc.apply_story_update(
            "US-001",
            StoryUpdate {
                status: StoryStatus::Retrying,
                attempt: 1,
                learnings: vec!["first".to_string()],
                failure: Some("boom".to_string()),
            },
        );
        doc.apply_story_update(
            "US-001",
            StoryUpdate {
                status: StoryStatus::Completed,
                attempt: 2,
                learnings: vec!["second".to_string()],
                failure: None,
            },
        );

        let story = doc.story("US-001").expect("story state");
        assert_eq!(story.status, Some(StoryStatus::Completed));
        assert_eq!(story.attempts, 2);
        // Learnings are append-only; the earlier failure text survives.
        assert_eq!(story.learnings, vec!["first", "second"]);
        assert_eq!(story.last_failure.as_deref(), Some("boom"));
        assert!(story.completed_at.is_some());
    }

    #[test]
    fn chain_scope_addresses_group_story_map() {
        let mut state = ChainState::new("epic", "feat/epic", Mode::Guarded, 5);
        state
            .groups
            .insert("g1".to_string(), GroupEntry::new("feature-one"));
        let mut doc = StateDoc::Chain {
            state,
            group: "g1".to_string(),
        };

        doc.apply_story_update(
            "US-003",
            StoryUpdate {
                status: StoryStatus::InProgress,
                attempt: 1,
                learnings: Vec::new(),
                failure: None,
            },
        );

        let StateDoc::Chain { state, .. } = &doc else {
            unreachable!()
        };
        assert!(state.groups["g1"].stories.contains_key("US-003"));
    }

    #[test]
    fn prior_learnings_excludes_current_story() {
        let mut doc = single_doc();
        doc.apply_story_update(
            "US-001",
            StoryUpdate {
                status: StoryStatus::Completed,
                attempt: 1,
                learnings: vec!["from one".to_string()],
                failure: None,
            },
        );
        doc.apply_story_update(
            "US-002",
            StoryUpdate {
                status: StoryStatus::Retrying,
                attempt: 1,
                learnings: vec!["from two".to_string()],
                failure: None,
            },
        );

        assert_eq!(doc.prior_learnings("US-002"), vec!["from one"]);
    }

    #[test]
    fn session_counters_track_kinds() {
        let mut doc = single_doc();
        doc.record_session(SessionKind::Implementation);
        doc.record_session(SessionKind::Verification);
        doc.record_session(SessionKind::Verification);
        doc.record_session(SessionKind::Validation);

        let StateDoc::Single(state) = &doc else {
            unreachable!()
        };
        assert_eq!(state.sessions.total, 4);
        assert_eq!(state.sessions.implementation, 1);
        assert_eq!(state.sessions.verification, 2);
        assert_eq!(state.sessions.validation, 1);
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(!RunStatus::Running.is_terminal());
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Paused,
            RunStatus::Blocked,
        ] {
            assert!(status.is_terminal());
        }
    }
}
