use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One physical page of a textbook. `page_number` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRecord {
    pub page_number: u32,
    pub text: String,
}

/// The persisted per-textbook document: `<textbook_id>_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextbookIndex {
    pub textbook_id: String,
    pub chunks: Vec<PageRecord>,
}

impl TextbookIndex {
    pub fn new(textbook_id: impl Into<String>, chunks: Vec<PageRecord>) -> Self {
        Self {
            textbook_id: textbook_id.into(),
            chunks,
        }
    }

    pub fn page(&self, page_number: u32) -> Option<&PageRecord> {
        self.chunks
            .iter()
            .find(|chunk| chunk.page_number == page_number)
    }

    pub fn page_count(&self) -> usize {
        self.chunks.len()
    }

    /// All page texts joined in page order, one newline between pages.
    pub fn full_text(&self) -> String {
        let mut ordered = self.chunks.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|chunk| chunk.page_number);
        ordered
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Which path of the exercise locator produced a context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOrigin {
    Heading,
    Substring,
}

/// Best heading candidate found by the exercise locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExerciseMatch {
    pub start: usize,
    pub end: usize,
    pub score: u32,
    pub matched_text: String,
    pub number: Option<String>,
    pub part: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExerciseContext {
    pub text: String,
    pub found: bool,
    pub origin: Option<MatchOrigin>,
}

pub const EXERCISE_NOT_FOUND: &str = "Exercise not found.";

impl ExerciseContext {
    pub fn not_found() -> Self {
        Self {
            text: EXERCISE_NOT_FOUND.to_string(),
            found: false,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Load once, serve from memory until the process exits.
    #[default]
    ProcessLifetime,
    /// Reload when the index file's modification time changes.
    RevalidateOnChange,
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub max_pages: usize,
    pub exercise_chars_before: usize,
    pub exercise_chars_after: usize,
    pub cache_policy: CachePolicy,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_pages: 5,
            exercise_chars_before: 500,
            exercise_chars_after: 1_000,
            cache_policy: CachePolicy::ProcessLifetime,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub audience: String,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            audience: "a Grade 9 student".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub max_chars: usize,
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_chars: 400,
            max_interval: Duration::from_millis(1_500),
        }
    }
}
