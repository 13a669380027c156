//! Verdict extraction from verifier session output.
//!
//! The external agent is a free-text generator, so the grammar degrades
//! gracefully instead of crashing on malformed output. Extraction is
//! three-tier, and the tier used is recorded so operators can distinguish
//! "really failed" from "could not tell":
//!
//! 1. `structured` — a `VERIFICATION_RESULT:` ... `END_VERIFICATION_RESULT`
//!    block with line-anchored `key: value` fields.
//! 2. `fallback` — an explicit `verdict: pass|fail` token anywhere, or curated
//!    positive/negative phrases in the trailing window of output.
//! 3. `none` — nothing recognizable; the verdict is conservatively `fail` and
//!    the raw tail is retained for human review.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Characters of output tail scanned by the phrase heuristics.
const TAIL_WINDOW: usize = 500;
/// Characters of raw output retained when nothing could be parsed.
const RAW_TAIL_KEEP: usize = 2000;

const POSITIVE_PHRASES: [&str; 4] = [
    "all criteria met",
    "all criteria are met",
    "verification passed",
    "all checks passed",
];
const NEGATIVE_PHRASES: [&str; 4] = [
    "criteria not met",
    "verification failed",
    "does not meet",
    "not implemented",
];

static RESULT_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)VERIFICATION_RESULT:\s*\n(.+?)END_VERIFICATION_RESULT").unwrap());

static VERDICT_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*verdict:\s*(\w+)").unwrap());

static VERDICT_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\bverdict:\s*(pass|fail)\b").unwrap());

static RECOMMENDATIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*recommendations:\s*"?(.+?)"?\s*$"#).unwrap());

static NOTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*overall_notes:\s*"?(.+?)"?\s*$"#).unwrap());

static LEARNINGS_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)IMPLEMENTATION_RESULT:.+?learnings:\s*\n(.+?)(?:issues:|END_IMPLEMENTATION_RESULT)")
        .unwrap()
});

/// How the verdict was obtained. The main observability signal for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMethod {
    /// Extracted from a well-formed result block.
    Structured,
    /// Inferred from an explicit token or trailing phrases.
    Fallback,
    /// Nothing recognizable; verdict defaulted to fail.
    None,
}

/// Pass/fail outcome of a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    Pass,
    Fail,
}

/// Transient result of parsing verifier output. Never persisted verbatim;
/// only derived fields feed story-state updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub recommendations: String,
    pub notes: String,
    pub method: ParseMethod,
    /// Tail of the raw output, retained only when `method` is `None`.
    pub raw_tail: Option<String>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.kind == VerdictKind::Pass
    }
}

/// Extract a verdict from verifier session output.
pub fn parse_verdict(output: &str) -> Verdict {
    let stripped = strip_code_fences(output);

    if let Some(caps) = RESULT_BLOCK_RE.captures(&stripped) {
        let block = caps.get(1).unwrap().as_str();
        // Missing verdict key inside a found block defaults to fail.
        let kind = match VERDICT_KEY_RE.captures(block) {
            Some(v) if v.get(1).unwrap().as_str().eq_ignore_ascii_case("pass") => VerdictKind::Pass,
            _ => VerdictKind::Fail,
        };
        return Verdict {
            kind,
            recommendations: capture_or_default(&RECOMMENDATIONS_RE, block),
            notes: capture_or_default(&NOTES_RE, block),
            method: ParseMethod::Structured,
            raw_tail: None,
        };
    }

    // Fallback 1: an explicit verdict token anywhere in the output.
    if let Some(caps) = VERDICT_TOKEN_RE.captures(&stripped) {
        let kind = if caps.get(1).unwrap().as_str().eq_ignore_ascii_case("pass") {
            VerdictKind::Pass
        } else {
            VerdictKind::Fail
        };
        return Verdict {
            kind,
            recommendations: String::new(),
            notes: String::new(),
            method: ParseMethod::Fallback,
            raw_tail: None,
        };
    }

    // Fallback 2: curated phrases in the trailing window only.
    let tail = tail_chars(&stripped, TAIL_WINDOW).to_lowercase();
    let positive = POSITIVE_PHRASES.iter().any(|p| tail.contains(p));
    let negative = NEGATIVE_PHRASES.iter().any(|p| tail.contains(p));
    match (positive, negative) {
        (true, false) => Verdict {
            kind: VerdictKind::Pass,
            recommendations: String::new(),
            notes: String::new(),
            method: ParseMethod::Fallback,
            raw_tail: None,
        },
        (false, true) => Verdict {
            kind: VerdictKind::Fail,
            recommendations: String::new(),
            notes: String::new(),
            method: ParseMethod::Fallback,
            raw_tail: None,
        },
        // Both or neither: indeterminate. Conservatively fail, keep the raw
        // tail for human review.
        _ => Verdict {
            kind: VerdictKind::Fail,
            recommendations: "Verifier did not produce structured output. Review manually."
                .to_string(),
            notes: String::new(),
            method: ParseMethod::None,
            raw_tail: Some(tail_chars(output, RAW_TAIL_KEEP).to_string()),
        },
    }
}

/// Extract learnings from implementation output plus verifier feedback.
///
/// Implementation learnings come from the `learnings:` list inside an
/// `IMPLEMENTATION_RESULT` block; verifier recommendations and notes are
/// appended with a `Verifier:` prefix so their origin stays visible.
pub fn combined_learnings(impl_output: &str, verdict: &Verdict) -> Vec<String> {
    let mut learnings = Vec::new();

    if let Some(caps) = LEARNINGS_BLOCK_RE.captures(impl_output) {
        for line in caps.get(1).unwrap().as_str().lines() {
            let line = line
                .trim()
                .trim_start_matches("- ")
                .trim_matches(|c| c == '"' || c == '\'');
            if !line.is_empty() {
                learnings.push(line.to_string());
            }
        }
    }

    if !verdict.recommendations.is_empty() {
        learnings.push(format!("Verifier: {}", verdict.recommendations));
    }
    if !verdict.notes.is_empty() {
        learnings.push(format!("Verifier note: {}", verdict.notes));
    }

    learnings
}

/// Extract a `header:` section from structured implementation output.
///
/// Returns the text between `header` and the next top-of-line `key:` token,
/// or `None` if the header is absent.
pub fn extract_section(text: &str, header: &str) -> Option<String> {
    let start = text.find(header)?;
    let rest = &text[start + header.len()..];
    static NEXT_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\w+:").unwrap());
    let section = match NEXT_KEY_RE.find(rest) {
        Some(m) => &rest[..m.start()],
        None => rest,
    };
    let section = section.trim();
    if section.is_empty() {
        None
    } else {
        Some(section.to_string())
    }
}

fn strip_code_fences(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn capture_or_default(re: &Regex, block: &str) -> String {
    re.captures(block)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        .unwrap_or_default()
}

/// Last `count` characters of `text`, on a char boundary.
fn tail_chars(text: &str, count: usize) -> &str {
    let total = text.chars().count();
    if total <= count {
        return text;
    }
    let skip = total - count;
    let (idx, _) = text.char_indices().nth(skip).unwrap();
    &text[idx..]
}
