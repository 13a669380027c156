//! Prompt rendering for implementation, verification, and validation sessions.
//!
//! Templates are minijinja with a fixed, enumerated set of placeholders.
//! Built-in templates are compiled in; config may point at override files,
//! whose leading YAML frontmatter (if present) is stripped before rendering —
//! downstream agents would otherwise misinterpret the metadata block.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::state::StateDoc;
use crate::core::story::Story;
use crate::core::verdict::extract_section;
use crate::io::config::Config;

const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");
const VERIFIER_TEMPLATE: &str = include_str!("prompts/verifier.md");
const VALIDATOR_TEMPLATE: &str = include_str!("prompts/validator.md");

/// Prior learnings interpolated into a prompt are capped to bound its size.
const LEARNINGS_CAP: usize = 15;
/// Implementation evidence falls back to this much output tail.
const EVIDENCE_TAIL: usize = 3000;

/// Loaded template sources plus the project context they render against.
pub struct PromptBuilder {
    implementer: String,
    verifier: String,
    validator: String,
}

impl PromptBuilder {
    /// Load templates from config overrides, falling back to built-ins.
    pub fn from_config(root: &Path, config: &Config) -> Result<Self> {
        Ok(Self {
            implementer: load_template(root, config.templates.implementer.as_deref())?
                .unwrap_or_else(|| IMPLEMENTER_TEMPLATE.to_string()),
            verifier: load_template(root, config.templates.verifier.as_deref())?
                .unwrap_or_else(|| VERIFIER_TEMPLATE.to_string()),
            validator: load_template(root, config.templates.validator.as_deref())?
                .unwrap_or_else(|| VALIDATOR_TEMPLATE.to_string()),
        })
    }

    /// Render the implementation prompt for one attempt.
    ///
    /// Pure function of config + state + story + attempt number: prior
    /// learnings come from other stories (newest first, capped), retry
    /// context appears only past the first attempt.
    pub fn implementation(
        &self,
        config: &Config,
        doc: &StateDoc,
        story: &Story,
        feature: &str,
        document: &str,
        attempt: u32,
    ) -> Result<String> {
        let mut prior = doc.prior_learnings(&story.id);
        if prior.len() > LEARNINGS_CAP {
            prior.drain(..prior.len() - LEARNINGS_CAP);
        }
        prior.reverse(); // newest first

        let retry_context = if attempt > 1 {
            let story_state = doc.story(&story.id);
            let failure = story_state
                .and_then(|s| s.last_failure.clone())
                .unwrap_or_else(|| "Unknown failure".to_string());
            let own_learnings = story_state
                .map(|s| s.learnings.clone())
                .unwrap_or_default();
            format!(
                "This is retry attempt {attempt}.\n\nPrevious failure:\n{failure}\n\nLearnings from previous attempts:\n{}",
                bullet_list(&own_learnings)
            )
        } else {
            "First attempt — no retry context.".to_string()
        };

        let env = Environment::new();
        let mut prompt = env
            .render_str(
                &self.implementer,
                context! {
                    STORY_ID => story.id,
                    STORY_TITLE => story.title,
                    STORY_DESCRIPTION => story.description,
                    ACCEPTANCE_CRITERIA => story.criteria_text(),
                    FEATURE => feature,
                    OVERVIEW => not_available(&config.context.overview),
                    SYNOPSIS => not_available(&config.context.synopsis),
                    ARCHITECTURE => not_available(&config.context.architecture),
                    CONVENTIONS => not_available(&config.context.conventions),
                    KNOWN_ISSUES => not_available(&config.context.known_issues),
                    PRIOR_LEARNINGS => if prior.is_empty() {
                        "None yet".to_string()
                    } else {
                        bullet_list(&prior)
                    },
                    RETRY_CONTEXT => retry_context,
                },
            )
            .context("render implementation template")?;

        // Autonomous-mode footer: the agent reads and updates the backlog
        // document directly and commits under a deterministic message.
        prompt.push_str(&format!(
            "\n\n## Additional Instructions (Autonomous Mode)\n\
             - The backlog document is at: {document}\n\
             - Read it directly for full story context\n\
             - Update its checkboxes when criteria are verified\n\
             - Commit with message: feat({feature}): {id} - {title}\n\
             - Do NOT mark criteria as complete unless you have verified them\n",
            id = story.id,
            title = story.title,
        ));

        debug!(story = %story.id, attempt, bytes = prompt.len(), "rendered implementation prompt");
        Ok(prompt)
    }

    /// Render the verification prompt against implementation output.
    pub fn verification(
        &self,
        config: &Config,
        story: &Story,
        impl_output: &str,
    ) -> Result<String> {
        let files_changed = extract_section(impl_output, "files_changed:")
            .unwrap_or_else(|| "See implementation output below".to_string());
        let evidence = extract_section(impl_output, "criteria_met:")
            .unwrap_or_else(|| tail_chars(impl_output, EVIDENCE_TAIL).to_string());

        let env = Environment::new();
        let prompt = env
            .render_str(
                &self.verifier,
                context! {
                    STORY_ID => story.id,
                    STORY_TITLE => story.title,
                    ACCEPTANCE_CRITERIA => story.criteria_text(),
                    FILES_CHANGED => files_changed,
                    IMPLEMENTATION_EVIDENCE => evidence,
                    CONVENTIONS => not_available(&config.context.conventions),
                },
            )
            .context("render verification template")?;
        debug!(story = %story.id, bytes = prompt.len(), "rendered verification prompt");
        Ok(prompt)
    }

    /// Render the group validation prompt.
    pub fn validation(&self, config: &Config, feature: &str) -> Result<String> {
        let env = Environment::new();
        env.render_str(
            &self.validator,
            context! {
                FEATURE => feature,
                OVERVIEW => not_available(&config.context.overview),
                CONVENTIONS => not_available(&config.context.conventions),
            },
        )
        .context("render validation template")
    }
}

/// Read an override template and strip leading YAML frontmatter.
fn load_template(root: &Path, path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let contents =
        fs::read_to_string(&full).with_context(|| format!("read template {}", full.display()))?;
    Ok(Some(strip_frontmatter(&contents).to_string()))
}

/// Strip a leading `---` fenced metadata block, if present.
fn strip_frontmatter(contents: &str) -> &str {
    let Some(rest) = contents.strip_prefix("---\n") else {
        return contents;
    };
    match rest.find("\n---\n") {
        Some(end) => &rest[end + "\n---\n".len()..],
        None => contents,
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn not_available(value: &str) -> &str {
    if value.trim().is_empty() {
        "Not available"
    } else {
        value
    }
}

/// Last `count` characters of `text`, on a char boundary.
fn tail_chars(text: &str, count: usize) -> &str {
    let total = text.chars().count();
    if total <= count {
        return text;
    }
    let (idx, _) = text.char_indices().nth(total - count).unwrap();
    &text[idx..]
}
