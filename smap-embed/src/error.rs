//! Error types for smap-embed
//!
//! Each component has its own error enum. Every error maps onto one
//! [`FailureKind`], the taxonomy reported per track in the run summary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for per-track outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, rate limit, timeout, or exhausted retries
    TransientIo,
    /// No candidate within tolerance
    NoMatch,
    /// Undecodable or empty audio, bad identifier, dimension mismatch
    CorruptInput,
    /// Missing model, unreadable parameters, bad schema
    Configuration,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientIo => "transient_io",
            FailureKind::NoMatch => "no_match",
            FailureKind::CorruptInput => "corrupt_input",
            FailureKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a `RetryPolicy` can drive
pub trait Retryable: std::error::Error {
    /// Whether another attempt could succeed
    fn is_retryable(&self) -> bool;

    /// Error reported once every attempt failed with a retryable error
    fn exhausted(self, _attempts: u32) -> Self
    where
        Self: Sized,
    {
        self
    }
}

/// Search collaborator errors
#[derive(Debug, Error)]
pub enum SearchError {
    /// Search tool missing or not executable
    #[error("Search tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Search did not complete in time
    #[error("Search timed out after {0:?}")]
    Timeout(Duration),

    /// Search tool ran but reported failure
    #[error("Search failed: {0}")]
    Failed(String),

    /// Search output could not be parsed
    #[error("Search output parse error: {0}")]
    Parse(String),

    #[error("Search IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SearchError {
    /// Whether searching again could succeed
    ///
    /// A missing tool or unparsable output will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::Failed(_) | SearchError::Timeout(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SearchError::ToolUnavailable(_) => FailureKind::Configuration,
            _ => FailureKind::TransientIo,
        }
    }
}

/// Link cache errors
#[derive(Debug, Error)]
pub enum LinkCacheError {
    /// Key already maps to a different URL; the existing entry is kept
    #[error("Link cache conflict for '{key}': keeping {existing}, rejected {rejected}")]
    Conflict {
        key: String,
        existing: String,
        rejected: String,
    },

    /// Cache file header does not match
    #[error("Link cache file {path} has unexpected header: {found}")]
    Schema { path: String, found: String },

    #[error("Link cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkCacheError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LinkCacheError::Conflict { .. } => FailureKind::TransientIo,
            LinkCacheError::Schema { .. } => FailureKind::Configuration,
            LinkCacheError::Io(_) => FailureKind::TransientIo,
        }
    }
}

/// Retrieval worker errors
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Track identifier cannot be used in a file name
    #[error("Invalid track id for path: '{0}'")]
    InvalidTrackId(String),

    /// Source URL is not an http(s) URL
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    /// Remote target is gone (404/410, removed video)
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Network failure, throttling, server error
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// Fetch attempt exceeded its deadline
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Fetched bytes could not be decoded as audio
    #[error("Corrupt source audio: {0}")]
    CorruptSource(String),

    /// Fetch tool missing or not executable
    #[error("Fetch tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Every attempt failed with a retryable error
    #[error("Retrieval failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RetrievalError>,
    },

    /// Local filesystem failure (staging, transcode output)
    #[error("Retrieval IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    /// Whether another attempt could succeed
    ///
    /// Network-side failures arrive as `Transient`. `Io` is local disk
    /// trouble, which another download will not fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Transient(_) | RetrievalError::Timeout(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RetrievalError::InvalidTrackId(_)
            | RetrievalError::InvalidUrl(_)
            | RetrievalError::SourceUnavailable(_)
            | RetrievalError::CorruptSource(_) => FailureKind::CorruptInput,
            RetrievalError::ToolUnavailable(_) => FailureKind::Configuration,
            RetrievalError::Transient(_)
            | RetrievalError::Timeout(_)
            | RetrievalError::Exhausted { .. }
            | RetrievalError::Io(_) => FailureKind::TransientIo,
        }
    }
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        SearchError::is_retryable(self)
    }
}

impl Retryable for RetrievalError {
    fn is_retryable(&self) -> bool {
        RetrievalError::is_retryable(self)
    }

    fn exhausted(self, attempts: u32) -> Self {
        RetrievalError::Exhausted {
            attempts,
            last: Box::new(self),
        }
    }
}

/// Feature extraction errors
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Canonical file decoded to zero samples
    #[error("Audio contains no samples")]
    EmptyAudio,

    /// Framing or pooling received no windows
    #[error("No windows to aggregate")]
    NoWindows,

    /// Vector length differs from the configured dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Canonical file is not 16-bit mono at the expected rate
    #[error("Audio format mismatch: {0}")]
    FormatMismatch(String),

    /// WAV container could not be read
    #[error("WAV read error: {0}")]
    Wav(#[from] hound::Error),

    /// Model rejected the input or produced no output
    #[error("Model inference failed: {0}")]
    Inference(String),

    /// Model or parameter files missing or unusable
    #[error("Extractor configuration error: {0}")]
    Configuration(String),

    /// Track was abandoned while windows were still being embedded
    #[error("Extraction cancelled")]
    Cancelled,

    #[error("Extractor IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractError::Configuration(_) => FailureKind::Configuration,
            ExtractError::Io(_) | ExtractError::Cancelled => FailureKind::TransientIo,
            _ => FailureKind::CorruptInput,
        }
    }
}

/// Dataset and metadata table errors
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Header does not match the expected schema
    #[error("Schema error in {path}: {reason}")]
    Schema { path: String, reason: String },

    /// Required column missing from a table
    #[error("Missing required column '{column}' in {path}")]
    MissingColumn { path: String, column: String },

    /// Column guard: the table already has this column
    #[error("Column '{0}' already exists")]
    ColumnExists(String),

    /// Row for this track already written
    #[error("Duplicate row for track {0}")]
    DuplicateRow(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Dataset IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DatasetError::Schema { .. }
            | DatasetError::MissingColumn { .. }
            | DatasetError::ColumnExists(_) => FailureKind::Configuration,
            DatasetError::DuplicateRow(_) | DatasetError::Serialize(_) => {
                FailureKind::CorruptInput
            }
            DatasetError::Io(_) => FailureKind::TransientIo,
        }
    }
}

/// Per-track pipeline error
///
/// Converted to a `TrackOutcome` at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("No candidate within tolerance (best diff: {best_diff:?})")]
    NoMatch { best_diff: Option<f64> },

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Cache(#[from] LinkCacheError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Whole-track deadline exceeded
    #[error("Track timed out after {0:?}")]
    Timeout(Duration),

    /// Blocking or spawned task did not complete
    #[error("Task failed: {0}")]
    Task(String),
}

impl TrackError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TrackError::NoMatch { .. } => FailureKind::NoMatch,
            TrackError::Search(e) => e.kind(),
            TrackError::Cache(e) => e.kind(),
            TrackError::Retrieval(e) => e.kind(),
            TrackError::Extract(e) => e.kind(),
            TrackError::Dataset(e) => e.kind(),
            TrackError::Timeout(_) => FailureKind::TransientIo,
            TrackError::Task(_) => FailureKind::CorruptInput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RetrievalError::Transient("503".into()).is_retryable());
        assert!(RetrievalError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RetrievalError::InvalidUrl("ftp://x".into()).is_retryable());
        assert!(!RetrievalError::SourceUnavailable("404".into()).is_retryable());
        assert!(!RetrievalError::CorruptSource("bad".into()).is_retryable());
        assert!(!RetrievalError::Io(std::io::Error::other("disk full")).is_retryable());
        assert!(!RetrievalError::Exhausted {
            attempts: 5,
            last: Box::new(RetrievalError::Transient("503".into())),
        }
        .is_retryable());
    }

    #[test]
    fn test_search_retryable_classification() {
        assert!(SearchError::Failed("HTTP Error 429: Too Many Requests".into()).is_retryable());
        assert!(SearchError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!SearchError::ToolUnavailable("yt-dlp: not found".into()).is_retryable());
        assert!(!SearchError::Parse("eof".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_wraps_only_retrieval_errors() {
        let search = Retryable::exhausted(SearchError::Failed("503".into()), 3);
        assert!(matches!(search, SearchError::Failed(_)));

        let retrieval = Retryable::exhausted(RetrievalError::Transient("503".into()), 3);
        assert!(matches!(retrieval, RetrievalError::Exhausted { attempts: 3, .. }));
        assert_eq!(retrieval.kind(), FailureKind::TransientIo);
    }

    #[test]
    fn test_track_error_kinds() {
        assert_eq!(
            TrackError::NoMatch { best_diff: Some(12.0) }.kind(),
            FailureKind::NoMatch
        );
        assert_eq!(
            TrackError::from(SearchError::Timeout(Duration::from_secs(30))).kind(),
            FailureKind::TransientIo
        );
        assert_eq!(
            TrackError::from(ExtractError::EmptyAudio).kind(),
            FailureKind::CorruptInput
        );
        assert_eq!(
            TrackError::from(ExtractError::Configuration("no model".into())).kind(),
            FailureKind::Configuration
        );
        assert_eq!(
            TrackError::from(RetrievalError::InvalidTrackId("../x".into())).kind(),
            FailureKind::CorruptInput
        );
        assert_eq!(
            TrackError::Timeout(Duration::from_secs(900)).kind(),
            FailureKind::TransientIo
        );
    }

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::TransientIo.to_string(), "transient_io");
        assert_eq!(
            serde_json::to_string(&FailureKind::CorruptInput).unwrap(),
            "\"corrupt_input\""
        );
    }
}
