use crate::models::{ExerciseMatch, TextbookIndex};
use crate::RetrievalError;
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;
use tracing::debug;

/// Optional section label, optional `Part <id>:` label, a question keyword and
/// a number with an optional trailing letter.
const EXERCISE_HEADING_PATTERN: &str = r"(?i)(?:(review\s+questions|exercises|problems)[\s:]*)?(?:(part\s+[a-z0-9]+)\s*:\s*)?(question|exercise|problem|no\.|#)\s*(\d+(?:\.\d+)*[a-z]?)";

const NUMBER_BONUS: u32 = 2;
const PART_BONUS: u32 = 1;

static EXERCISE_HEADING: OnceLock<Regex> = OnceLock::new();

/// Compiled once per process; a failed compile is reported, not cached.
fn exercise_heading_regex() -> Result<&'static Regex, RetrievalError> {
    if let Some(compiled) = EXERCISE_HEADING.get() {
        return Ok(compiled);
    }
    let compiled = Regex::new(EXERCISE_HEADING_PATTERN)?;
    Ok(EXERCISE_HEADING.get_or_init(|| compiled))
}

fn require_query(query: &str) -> Result<&str, RetrievalError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(RetrievalError::Validation("query is empty".to_string()));
    }
    Ok(trimmed)
}

/// Pages whose text contains `query`, case-insensitively. Scanning stops as
/// soon as `max_results` pages matched.
pub fn find_matching_pages(
    index: &TextbookIndex,
    query: &str,
    max_results: usize,
) -> Result<Vec<u32>, RetrievalError> {
    let needle = require_query(query)?.to_lowercase();

    let mut pages = Vec::new();
    if max_results == 0 {
        return Ok(pages);
    }

    for chunk in &index.chunks {
        if chunk.text.to_lowercase().contains(&needle) {
            pages.push(chunk.page_number);
            if pages.len() >= max_results {
                break;
            }
        }
    }

    pages.sort_unstable();
    pages.dedup();
    Ok(pages)
}

/// Scores every exercise heading in `document` against the query and keeps
/// the best. Ties keep the earliest heading. Headings sharing no token with
/// the query score zero and are never selected.
pub fn best_exercise_match(
    document: &str,
    query: &str,
) -> Result<Option<ExerciseMatch>, RetrievalError> {
    let tokens = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
    if tokens.is_empty() {
        return Ok(None);
    }

    let heading_re = exercise_heading_regex()?;
    let mut best: Option<ExerciseMatch> = None;

    for captures in heading_re.captures_iter(document) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let matched_text = whole.as_str().to_lowercase();

        let overlap = tokens
            .iter()
            .filter(|token| matched_text.contains(token.as_str()))
            .count() as u32;

        let number = captures.get(4).map(|m| m.as_str().to_string());
        let part = captures.get(2).map(|m| m.as_str().to_string());

        let score = if overlap == 0 {
            0
        } else {
            overlap
                + if number.is_some() { NUMBER_BONUS } else { 0 }
                + if part.is_some() { PART_BONUS } else { 0 }
        };

        debug!(
            heading = whole.as_str(),
            offset = whole.start(),
            score,
            "exercise heading candidate"
        );

        let better = best.as_ref().map_or(score > 0, |current| score > current.score);
        if better {
            best = Some(ExerciseMatch {
                start: whole.start(),
                end: whole.end(),
                score,
                matched_text: whole.as_str().to_string(),
                number,
                part,
            });
        }
    }

    Ok(best)
}

/// Byte offset of the first case-insensitive occurrence of `query`.
pub fn find_literal(document: &str, query: &str) -> Option<usize> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }

    RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .ok()
        .and_then(|pattern| pattern.find(document))
        .map(|found| found.start())
}
