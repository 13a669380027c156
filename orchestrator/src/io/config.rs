//! Run configuration stored under `.orchestrator/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::state::Mode;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; fields a command
/// actually needs are checked by [`Config::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Backlog document path, relative to the project root (single-group mode).
    pub document: String,
    /// Feature name used in prompts, commit messages, and checkpoint tags.
    pub feature: String,
    /// Branch the run is bound to.
    pub branch: String,
    pub mode: Mode,
    /// Retry ceiling per story.
    pub max_retries: u32,
    /// Poll interval for the pause sentinel, in milliseconds.
    pub pause_poll_millis: u64,

    pub session: SessionConfig,
    pub templates: TemplateConfig,
    pub context: ProjectContext,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Agent command line; the rendered prompt is fed on stdin.
    pub command: Vec<String>,
    /// Wall-clock timeout per session, in seconds.
    pub timeout_secs: u64,
    /// Truncate captured session output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            timeout_secs: 900,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Optional template overrides; built-in templates are used when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TemplateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementer: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator: Option<PathBuf>,
}

/// Free-text project context interpolated into prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectContext {
    pub overview: String,
    pub synopsis: String,
    pub architecture: String,
    pub conventions: String,
    pub known_issues: String,
}

/// Chain (epic) configuration: ordered groups sharing one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChainConfig {
    pub name: String,
    /// Branch the chain's ancestry is checked against (warn-only).
    pub base_branch: String,
    /// Directory completed group documents are archived into.
    pub archive_dir: String,
    /// Pause at the file gate between groups (skipped after the last group).
    pub pause_between_groups: bool,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GroupConfig {
    pub id: String,
    pub document: String,
    pub feature: String,
    /// Group ids that must already be archived before this group may start.
    pub requires: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            document: String::new(),
            feature: String::new(),
            branch: String::new(),
            mode: Mode::Autonomous,
            max_retries: 3,
            pause_poll_millis: 10_000,
            session: SessionConfig::default(),
            templates: TemplateConfig::default(),
            context: ProjectContext::default(),
            chain: None,
        }
    }
}

impl Config {
    /// Shape checks shared by all commands.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.pause_poll_millis == 0 {
            return Err(anyhow!("pause_poll_millis must be > 0"));
        }
        if self.session.timeout_secs == 0 {
            return Err(anyhow!("session.timeout_secs must be > 0"));
        }
        if self.session.output_limit_bytes == 0 {
            return Err(anyhow!("session.output_limit_bytes must be > 0"));
        }
        if self.session.command.is_empty() || self.session.command[0].trim().is_empty() {
            return Err(anyhow!("session.command must be a non-empty array"));
        }
        if let Some(chain) = &self.chain {
            chain.validate()?;
        }
        Ok(())
    }

    /// Additional checks for `orchestrator run`.
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        for (field, value) in [
            ("document", &self.document),
            ("feature", &self.feature),
            ("branch", &self.branch),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} is required for a single-group run"));
            }
        }
        Ok(())
    }

    /// Additional checks for `orchestrator chain`.
    pub fn validate_for_chain(&self) -> Result<&ChainConfig> {
        self.validate()?;
        let chain = self
            .chain
            .as_ref()
            .ok_or_else(|| anyhow!("[chain] section is required for a chain run"))?;
        if self.branch.trim().is_empty() {
            return Err(anyhow!("branch is required for a chain run"));
        }
        Ok(chain)
    }
}

impl ChainConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("chain.name must not be empty"));
        }
        if self.archive_dir.trim().is_empty() {
            return Err(anyhow!("chain.archive_dir must not be empty"));
        }
        if self.groups.is_empty() {
            return Err(anyhow!("chain.groups must not be empty"));
        }
        let mut seen = BTreeSet::new();
        for group in &self.groups {
            if group.id.trim().is_empty() {
                return Err(anyhow!("chain group ids must not be empty"));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(anyhow!("duplicate chain group id '{}'", group.id));
            }
            if group.document.trim().is_empty() || group.feature.trim().is_empty() {
                return Err(anyhow!(
                    "chain group '{}' needs both a document and a feature",
                    group.id
                ));
            }
        }
        for group in &self.groups {
            for req in &group.requires {
                if !seen.contains(req.as_str()) {
                    return Err(anyhow!(
                        "chain group '{}' requires unknown group '{req}'",
                        group.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
