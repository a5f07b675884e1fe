use crate::context::{assemble_pages, char_window};
use crate::locator::{best_exercise_match, find_literal, find_matching_pages};
use crate::models::{ExerciseContext, MatchOrigin, RetrievalOptions, TextbookIndex};
use crate::store::TextbookStore;
use crate::RetrievalError;
use std::sync::Arc;
use tracing::{debug, info};

/// Retrieval entry points used when building prompts. Unknown textbooks
/// never fail these calls: they yield empty results so callers can fall
/// back to an ungrounded prompt.
#[derive(Debug, Clone)]
pub struct Retriever {
    store: Arc<TextbookStore>,
    options: RetrievalOptions,
}

impl Retriever {
    pub fn new(store: Arc<TextbookStore>, options: RetrievalOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub fn store(&self) -> &TextbookStore {
        &self.store
    }

    pub fn get_textbook(&self, textbook_id: &str) -> Option<Arc<TextbookIndex>> {
        self.store.get_textbook(textbook_id)
    }

    /// Empty query is a validation failure; an unknown textbook is an empty result.
    pub fn find_pages(
        &self,
        textbook_id: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<u32>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::Validation("query is empty".to_string()));
        }

        let Some(index) = self.store.get_textbook(textbook_id) else {
            debug!(textbook_id, "no index, concept search skipped");
            return Ok(Vec::new());
        };

        let pages = find_matching_pages(&index, query, max_results)?;
        info!(textbook_id, query, pages = ?pages, "concept pages located");
        Ok(pages)
    }

    pub fn assemble(&self, textbook_id: &str, page_numbers: &[u32]) -> String {
        if page_numbers.is_empty() {
            return String::new();
        }
        self.store
            .get_textbook(textbook_id)
            .map(|index| assemble_pages(&index, page_numbers))
            .unwrap_or_default()
    }

    pub fn find_exercise_context(
        &self,
        textbook_id: &str,
        query: &str,
    ) -> Result<ExerciseContext, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::Validation("exercise query is empty".to_string()));
        }

        let Some(index) = self.store.get_textbook(textbook_id) else {
            return Ok(ExerciseContext::not_found());
        };

        let document = index.full_text();
        let context = exercise_context(&document, query, &self.options)?;
        info!(
            textbook_id,
            query,
            found = context.found,
            origin = ?context.origin,
            "exercise lookup finished"
        );
        Ok(context)
    }
}

/// Heading match first, then a literal search for the raw query.
pub fn exercise_context(
    document: &str,
    query: &str,
    options: &RetrievalOptions,
) -> Result<ExerciseContext, RetrievalError> {
    let (anchor, origin) = match best_exercise_match(document, query)? {
        Some(best) => {
            debug!(heading = %best.matched_text, score = best.score, "best exercise heading");
            (best.start, MatchOrigin::Heading)
        }
        None => match find_literal(document, query) {
            Some(offset) => (offset, MatchOrigin::Substring),
            None => return Ok(ExerciseContext::not_found()),
        },
    };

    let text = char_window(
        document,
        anchor,
        options.exercise_chars_before,
        options.exercise_chars_after,
    );

    Ok(ExerciseContext {
        text: text.to_string(),
        found: true,
        origin: Some(origin),
    })
}
