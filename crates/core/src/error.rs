use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("pdf not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("textbook not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("index for {textbook_id} is malformed: {details}")]
    Malformed { textbook_id: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("generation api returned {status}: {details}")]
    Api { status: u16, details: String },

    #[error("response blocked: {0}")]
    Blocked(String),

    #[error("generation returned no text")]
    EmptyResponse,

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("generation backend is not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} failed: {details}")]
    Api { method: String, details: String },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
