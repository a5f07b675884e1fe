use crate::error::IngestError;
use crate::models::PageRecord;
use lopdf::Document;
use std::path::Path;
use tracing::{debug, warn};

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageRecord>, IngestError>;
}

/// Text extraction backed by `lopdf`. Every physical page yields a record,
/// pages without extractable text keep an empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageRecord>, IngestError> {
        if !path.is_file() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }

        let document = Document::load(path)
            .map_err(|error| IngestError::PdfParse(format!("{}: {error}", path.display())))?;

        let page_numbers = document.get_pages().into_keys().collect::<Vec<_>>();
        if page_numbers.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf has no pages: {}",
                path.display()
            )));
        }

        let mut pages = Vec::with_capacity(page_numbers.len());
        for page_number in page_numbers {
            let text = match document.extract_text(&[page_number]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        page = page_number,
                        error = %error,
                        "page text extraction failed, keeping empty page"
                    );
                    String::new()
                }
            };

            if text.trim().is_empty() {
                debug!(path = %path.display(), page = page_number, "page has no text");
            }

            pages.push(PageRecord { page_number, text });
        }

        Ok(pages)
    }
}

pub fn extract_pages(path: &Path) -> Result<Vec<PageRecord>, IngestError> {
    LopdfExtractor.extract_pages(path)
}
