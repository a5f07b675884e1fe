use crate::ingest::index_path;
use crate::models::{CachePolicy, TextbookIndex};
use crate::RetrievalError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const MAX_TEXTBOOK_ID_LEN: usize = 64;

/// Ids become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_textbook_id(textbook_id: &str) -> Result<(), RetrievalError> {
    if textbook_id.is_empty() {
        return Err(RetrievalError::Validation("textbook id is empty".to_string()));
    }
    if textbook_id.len() > MAX_TEXTBOOK_ID_LEN {
        return Err(RetrievalError::Validation(format!(
            "textbook id is longer than {MAX_TEXTBOOK_ID_LEN} characters"
        )));
    }
    let valid = textbook_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if !valid {
        return Err(RetrievalError::Validation(format!(
            "textbook id '{textbook_id}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct CachedTextbook {
    index: Arc<TextbookIndex>,
    modified: Option<SystemTime>,
}

/// Lazily loads textbook indices from `index_dir` and keeps them in memory.
///
/// Failed loads are not cached, so a textbook that is preprocessed after
/// startup becomes available on the next lookup. Two concurrent first loads
/// of the same id may both read the file; the later insert wins and both
/// observe identical content.
#[derive(Debug)]
pub struct TextbookStore {
    index_dir: PathBuf,
    policy: CachePolicy,
    cache: RwLock<HashMap<String, CachedTextbook>>,
}

impl TextbookStore {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self::with_policy(index_dir, CachePolicy::default())
    }

    pub fn with_policy(index_dir: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        Self {
            index_dir: index_dir.into(),
            policy,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// `None` for unknown, invalid or unreadable textbooks.
    pub fn get_textbook(&self, textbook_id: &str) -> Option<Arc<TextbookIndex>> {
        match self.load(textbook_id) {
            Ok(index) => Some(index),
            Err(RetrievalError::NotFound(_)) => None,
            Err(error) => {
                warn!(textbook_id, %error, "textbook index unavailable");
                None
            }
        }
    }

    pub fn load(&self, textbook_id: &str) -> Result<Arc<TextbookIndex>, RetrievalError> {
        validate_textbook_id(textbook_id)?;
        let path = index_path(&self.index_dir, textbook_id);

        if let Some(index) = self.cached(textbook_id, &path) {
            return Ok(index);
        }

        let (index, modified) = read_index(textbook_id, &path)?;
        let index = Arc::new(index);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                textbook_id.to_string(),
                CachedTextbook {
                    index: Arc::clone(&index),
                    modified,
                },
            );

        info!(textbook_id, pages = index.page_count(), "textbook index cached");
        Ok(index)
    }

    pub fn is_cached(&self, textbook_id: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(textbook_id)
    }

    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn cached(&self, textbook_id: &str, path: &Path) -> Option<Arc<TextbookIndex>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(textbook_id)?;

        if self.policy == CachePolicy::RevalidateOnChange {
            let current = modified_time(path);
            if current != entry.modified {
                debug!(textbook_id, "index file changed on disk, reloading");
                return None;
            }
        }

        Some(Arc::clone(&entry.index))
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn read_index(
    textbook_id: &str,
    path: &Path,
) -> Result<(TextbookIndex, Option<SystemTime>), RetrievalError> {
    let modified = modified_time(path);
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(RetrievalError::NotFound(textbook_id.to_string()));
        }
        Err(error) => return Err(RetrievalError::Io(error)),
    };

    let index: TextbookIndex =
        serde_json::from_str(&raw).map_err(|error| RetrievalError::Malformed {
            textbook_id: textbook_id.to_string(),
            details: error.to_string(),
        })?;

    if index.textbook_id != textbook_id {
        return Err(RetrievalError::Malformed {
            textbook_id: textbook_id.to_string(),
            details: format!("document declares textbook_id '{}'", index.textbook_id),
        });
    }

    Ok((index, modified))
}
