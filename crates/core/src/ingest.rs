use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::models::{PageRecord, TextbookIndex};
use crate::IngestError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const INDEX_FILE_SUFFIX: &str = "_index.json";

pub fn index_path(index_dir: &Path, textbook_id: &str) -> PathBuf {
    index_dir.join(format!("{textbook_id}{INDEX_FILE_SUFFIX}"))
}

/// Writes `<index_dir>/<textbook_id>_index.json`, replacing any previous
/// document for the same id.
pub fn build_index(
    index_dir: &Path,
    textbook_id: &str,
    pages: Vec<PageRecord>,
) -> Result<PathBuf, IngestError> {
    if textbook_id.trim().is_empty() {
        return Err(IngestError::InvalidArgument(
            "textbook id is empty".to_string(),
        ));
    }

    fs::create_dir_all(index_dir)?;

    let index = TextbookIndex::new(textbook_id, pages);
    let destination = index_path(index_dir, textbook_id);
    let encoded = serde_json::to_string_pretty(&index)?;

    // Write next to the target first so readers never observe a half-written index.
    let staging = destination.with_extension("json.tmp");
    fs::write(&staging, encoded)?;
    fs::rename(&staging, &destination)?;

    info!(
        textbook_id,
        pages = index.page_count(),
        path = %destination.display(),
        "index written"
    );
    Ok(destination)
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// `api/economics9.pdf` -> `economics9`.
pub fn textbook_id_from_path(path: &Path) -> Result<String, IngestError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

#[derive(Debug, Clone)]
pub struct BuiltIndex {
    pub textbook_id: String,
    pub source: PathBuf,
    pub index_file: PathBuf,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub textbook_id: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessReport {
    pub built: Vec<BuiltIndex>,
    pub skipped: Vec<SkippedPdf>,
}

/// Preprocesses every PDF under `pdf_dir`, deriving ids from file stems.
pub fn preprocess_folder(pdf_dir: &Path, index_dir: &Path) -> Result<PreprocessReport, IngestError> {
    let files = discover_pdf_files(pdf_dir);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            pdf_dir.display()
        )));
    }

    let mut catalog = Vec::with_capacity(files.len());
    for path in files {
        match textbook_id_from_path(&path) {
            Ok(textbook_id) => catalog.push((textbook_id, path)),
            Err(error) => warn!(path = %path.display(), %error, "skipping pdf without usable name"),
        }
    }

    Ok(preprocess_catalog(&LopdfExtractor, &catalog, index_dir))
}

/// Best effort: one failing textbook is recorded and the rest still run.
pub fn preprocess_catalog<E: PdfExtractor>(
    extractor: &E,
    catalog: &[(String, PathBuf)],
    index_dir: &Path,
) -> PreprocessReport {
    let mut report = PreprocessReport::default();

    for (textbook_id, path) in catalog {
        info!(textbook_id = %textbook_id, path = %path.display(), "preprocessing textbook");

        let result = extractor.extract_pages(path).and_then(|pages| {
            let count = pages.len();
            build_index(index_dir, textbook_id, pages).map(|index_file| (index_file, count))
        });

        match result {
            Ok((index_file, pages)) => report.built.push(BuiltIndex {
                textbook_id: textbook_id.clone(),
                source: path.clone(),
                index_file,
                pages,
            }),
            Err(error) => {
                warn!(textbook_id = %textbook_id, %error, "preprocessing failed");
                report.skipped.push(SkippedPdf {
                    textbook_id: textbook_id.clone(),
                    path: path.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_text_pdf;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn build_index_overwrites_previous_document() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index_dir = dir.path().join("textbook_index");

        let first = vec![PageRecord {
            page_number: 1,
            text: "old".to_string(),
        }];
        let second = vec![
            PageRecord {
                page_number: 1,
                text: "new".to_string(),
            },
            PageRecord {
                page_number: 2,
                text: String::new(),
            },
        ];

        build_index(&index_dir, "history9", first)?;
        let path = build_index(&index_dir, "history9", second.clone())?;

        assert_eq!(path, index_dir.join("history9_index.json"));
        let stored: TextbookIndex = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(stored.textbook_id, "history9");
        assert_eq!(stored.chunks, second);
        assert!(!index_dir.join("history9_index.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn document_uses_flat_page_layout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = build_index(
            dir.path(),
            "economics9",
            vec![PageRecord {
                page_number: 1,
                text: "Demand".to_string(),
            }],
        )?;

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(raw["textbook_id"], "economics9");
        assert_eq!(raw["chunks"][0]["page_number"], 1);
        assert_eq!(raw["chunks"][0]["text"], "Demand");
        Ok(())
    }

    #[test]
    fn preprocessing_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = preprocess_folder(dir.path(), &dir.path().join("out"));
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn best_effort_skips_unreadable_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf_dir = dir.path().join("api");
        let index_dir = dir.path().join("textbook_index");
        fs::create_dir(&pdf_dir)?;
        fs::write(pdf_dir.join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        write_text_pdf(&pdf_dir.join("economics9.pdf"), &["Opportunity cost"])?;

        let report = preprocess_folder(&pdf_dir, &index_dir)?;

        assert_eq!(report.built.len(), 1);
        assert_eq!(report.built[0].textbook_id, "economics9");
        assert_eq!(report.built[0].pages, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].textbook_id, "broken");
        assert!(index_dir.join("economics9_index.json").exists());
        assert!(!index_dir.join("broken_index.json").exists());
        Ok(())
    }

    #[test]
    fn missing_catalog_entry_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let catalog = vec![("math9".to_string(), dir.path().join("math9.pdf"))];

        let report = preprocess_catalog(&LopdfExtractor, &catalog, dir.path());

        assert!(report.built.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("not found"));
        Ok(())
    }
}
