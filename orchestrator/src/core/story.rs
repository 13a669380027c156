//! Backlog document parsing.
//!
//! A backlog document is hand-edited markdown. Each story starts at a level-3
//! heading of the form `### US-001: Title` and ends at the next story heading,
//! the next level-2 heading, or end of document. Parsing is lenient: a span
//! that does not match the heading pattern is skipped rather than rejected.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static STORY_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^### (US-\d+):[ \t]*(.+?)[ \t]*$").unwrap());

static SECTION_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^## ").unwrap());

static DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\*\*Description:\*\*\s*(.+?)(?:\n\*\*|\n#|\z)").unwrap());

static CRITERION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- \[( |x)\] (.+?)[ \t]*$").unwrap());

/// One acceptance criterion line from a story's checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Criterion {
    pub text: String,
    pub checked: bool,
}

/// One unit of acceptance-criterion-bound work parsed from a backlog document.
///
/// Immutable once parsed. The document itself remains the source of truth for
/// completion; persisted state is only a secondary cross-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Story {
    /// Stable identifier, unique within the document (e.g. `US-003`).
    pub id: String,
    pub title: String,
    pub description: String,
    /// Ordered checklist, in document order.
    pub criteria: Vec<Criterion>,
    /// True iff the document shows zero unchecked and at least one checked
    /// criterion. A story with no criteria at all is never completed.
    pub completed: bool,
}

impl Story {
    /// Render the criteria as an unchecked checklist for prompt interpolation.
    pub fn criteria_text(&self) -> String {
        self.criteria
            .iter()
            .map(|c| format!("- [ ] {}", c.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse all stories from backlog document text, in document order.
pub fn parse_stories(content: &str) -> Vec<Story> {
    let headings: Vec<_> = STORY_HEADING_RE.captures_iter(content).collect();

    let mut stories = Vec::with_capacity(headings.len());
    for (i, caps) in headings.iter().enumerate() {
        let id = caps.get(1).unwrap().as_str().to_string();
        let title = caps.get(2).unwrap().as_str().to_string();

        let start = caps.get(0).unwrap().end();
        let next_story = headings
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(content.len());
        // The span ends at the next story heading or the next level-2 heading,
        // whichever comes first.
        let next_section = SECTION_HEADING_RE
            .find(&content[start..])
            .map(|m| start + m.start())
            .unwrap_or(content.len());
        let span = &content[start..next_story.min(next_section)];

        let description = DESCRIPTION_RE
            .captures(span)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string())
            .unwrap_or_default();

        let criteria: Vec<Criterion> = CRITERION_RE
            .captures_iter(span)
            .map(|c| Criterion {
                text: c.get(2).unwrap().as_str().to_string(),
                checked: c.get(1).unwrap().as_str() == "x",
            })
            .collect();

        let unchecked = criteria.iter().filter(|c| !c.checked).count();
        let checked = criteria.iter().filter(|c| c.checked).count();

        stories.push(Story {
            id,
            title,
            description,
            criteria,
            // "Zero unchecked" is vacuously true for an empty checklist, so
            // the checked count must be positive as well.
            completed: unchecked == 0 && checked > 0,
        });
    }

    stories
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Feature PRD

## Stories

### US-001: First story
**Description:** Do the first thing
across two lines.
**Notes:** irrelevant
- [x] criterion one
- [x] criterion two

### US-002: Second story
**Description:** Do the second thing.
- [ ] criterion one
- [x] criterion two

## Appendix

### US-999: Not a story span
- [x] should not leak into US-002
";

    #[test]
    fn parses_stories_in_document_order() {
        let stories = parse_stories(DOC);
        let ids: Vec<&str> = stories.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["US-001", "US-002", "US-999"]);
    }

    #[test]
    fn extracts_description_up_to_next_bold_label() {
        let stories = parse_stories(DOC);
        assert_eq!(
            stories[0].description,
            "Do the first thing\nacross two lines."
        );
    }

    #[test]
    fn completed_requires_zero_unchecked_and_some_checked() {
        let stories = parse_stories(DOC);
        assert!(stories[0].completed);
        assert!(!stories[1].completed);
    }

    #[test]
    fn story_with_zero_criteria_is_never_completed() {
        // "Zero unchecked" is vacuously true here; the guard against a latent
        // false-positive is the positive checked count.
        let doc = "### US-010: Empty story\n**Description:** nothing to check\n";
        let stories = parse_stories(doc);
        assert_eq!(stories.len(), 1);
        assert!(stories[0].criteria.is_empty());
        assert!(!stories[0].completed);
    }

    #[test]
    fn span_ends_at_level_two_heading() {
        let stories = parse_stories(DOC);
        // US-002's span stops at "## Appendix": the checked box under US-999
        // must not count toward US-002.
        assert_eq!(stories[1].criteria.len(), 2);
        assert!(!stories[1].completed);
    }

    #[test]
    fn malformed_headings_are_skipped() {
        let doc = "\
### STORY-1: wrong id pattern
- [x] done

### US-007: good story
- [ ] pending
";
        let stories = parse_stories(doc);
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, "US-007");
    }

    #[test]
    fn parsing_is_idempotent() {
        let first = parse_stories(DOC);
        let second = parse_stories(DOC);
        assert_eq!(first, second);
    }

    #[test]
    fn criteria_text_renders_unchecked_checklist() {
        let stories = parse_stories(DOC);
        assert_eq!(
            stories[1].criteria_text(),
            "- [ ] criterion one\n- [ ] criterion two"
        );
    }
}
