use std::path::PathBuf;

use thiserror::Error;

use crate::italia::opendata::sources::SourceKind;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Failure of a single source adapter: the remote could not be reached, the
/// payload could not be decoded, or it yielded no usable records.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{provider} fetch failed: {cause}")]
pub struct FetchError {
    pub provider: SourceKind,
    pub cause: String,
}

impl FetchError {
    pub fn new(provider: SourceKind, cause: impl Into<String>) -> Self {
        Self {
            provider,
            cause: cause.into(),
        }
    }
}

/// Error type covering the different failure cases that can occur while the
/// dataset is fetched, merged, persisted or queried.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A single source failed. Refresh cycles record it and carry on unless
    /// the source is the anchor.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The official registry could not be fetched; the refresh was aborted and
    /// the previous snapshot, if any, is still being served.
    #[error("anchor source unavailable, refresh aborted: {0}")]
    AnchorFetch(FetchError),

    /// Raised when a query matched nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Raised when the caller supplied malformed input.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Raised when the local store exists but cannot be read back.
    #[error("local store {path} is unreadable: {cause}")]
    StoreCorrupt { path: PathBuf, cause: String },

    /// Raised when a source payload does not follow the expected layout.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Raised when a remote source answers with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Wrapper for IO failures such as reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised when JSON parsing or serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors bubbled up from the HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Errors bubbled up from SQLite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Errors bubbled up from the Excel reader implementation.
    #[error("Excel read error: {0}")]
    ExcelRead(#[from] calamine::XlsxError),

    /// Raised when a zip archive cannot be opened.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Raised when a CSV payload cannot be decoded.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Raised when a blocking store task panics or is cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}
