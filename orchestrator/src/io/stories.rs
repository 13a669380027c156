//! Backlog document loading.
//!
//! The markdown backlog is re-read from disk before every story selection so
//! that checkbox edits made by the implementing agent (or the operator) are
//! always honored.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::story::{Story, parse_stories};

/// Read and parse the backlog document. A missing document is fatal.
pub fn load_stories(document: &Path) -> Result<Vec<Story>> {
    let contents = fs::read_to_string(document)
        .with_context(|| format!("read backlog document {}", document.display()))?;
    let stories = parse_stories(&contents);
    if stories.is_empty() {
        bail!(
            "backlog document {} contains no user stories",
            document.display()
        );
    }
    debug!(
        document = %document.display(),
        count = stories.len(),
        "loaded backlog"
    );
    Ok(stories)
}

/// First story that is incomplete in the document.
///
/// The document checkbox state is consulted before the JSON state: a story
/// checked off out-of-band is treated as done even if state lags behind.
pub fn next_incomplete(stories: &[Story]) -> Option<&Story> {
    stories.iter().find(|s| !s.completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DOC: &str = "\
# Backlog

### US-001: First
**Description:** One.
- [x] done

### US-002: Second
**Description:** Two.
- [ ] pending
";

    #[test]
    fn loads_document_and_finds_next_incomplete() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("prd.md");
        fs::write(&path, DOC).expect("write");

        let stories = load_stories(&path).expect("load");
        assert_eq!(stories.len(), 2);
        let next = next_incomplete(&stories).expect("next");
        assert_eq!(next.id, "US-002");
    }

    #[test]
    fn fully_checked_document_has_no_next_story() {
        let done = DOC.replace("- [ ] pending", "- [x] pending");
        let stories = parse_stories(&done);
        assert!(next_incomplete(&stories).is_none());
    }

    #[test]
    fn missing_document_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        assert!(load_stories(&dir.path().join("absent.md")).is_err());
    }

    #[test]
    fn storyless_document_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("prd.md");
        fs::write(&path, "# Notes\n\nNothing here.\n").expect("write");
        assert!(load_stories(&path).is_err());
    }
}
