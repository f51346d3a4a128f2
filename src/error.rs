use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("provenance schema not found: {0}")]
    SchemaNotFound(String),

    #[error("malformed enclosure field: {0}")]
    MalformedEnclosure(String),

    #[error("malformed feed entry: {0}")]
    MalformedEntry(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("rejected ingestion for unknown location {0}")]
    UnknownLocation(String),

    #[error("concurrent update conflict: {0}")]
    Contention(String),

    #[error("feed request failed: {0}")]
    FeedHttp(String),

    #[error("feed returned status {status}: {message}")]
    FeedStatus { status: u16, message: String },

    #[error("failed to parse feed document: {0}")]
    FeedParse(String),

    #[error("repository error: {0}")]
    Persistence(String),

    #[error("replica copy failed: {0}")]
    CopyFailed(String),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("missing config file atom-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid location pattern: {0}")]
    InvalidLocationPattern(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl IngestError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IngestError::FeedHttp(_) | IngestError::FeedStatus { .. } | IngestError::FeedParse(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Contention(_))
    }
}
