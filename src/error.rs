//! Error taxonomy shared by the summarization pipeline.
//!
//! Failures are split by how the caller is expected to react: transport
//! problems are retried by the client, malformed extraction output is
//! recovered locally, and coverage exhaustion is fatal for the chapter.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the completion service after the client's own retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced an HTTP response (timeout, connect, body).
    #[error("completion request failed: {0}")]
    Request(String),
    /// The service answered with a non-success status.
    #[error("completion service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The response could not be decoded into the provider's envelope.
    #[error("failed to decode completion response: {0}")]
    Decode(String),
    /// A scripted or offline client ran out of responses.
    #[error("completion client exhausted: {0}")]
    Exhausted(String),
}

/// Why a chunk's extraction was degraded instead of used verbatim.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The generator could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The generator answered, but not with the expected JSON object.
    #[error("malformed extraction for chunk {chunk_id}: {reason}")]
    Malformed {
        /// Chunk whose extraction failed to parse.
        chunk_id: usize,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Raised when both the regeneration and addendum budgets are spent.
#[derive(Debug, Error)]
pub enum CoverageError {
    /// Critical items are still missing after every allowed attempt.
    #[error(
        "chapter {chapter}: coverage incomplete after {regenerations} regenerations and {addendums} addendums; missing {missing:?}"
    )]
    Exhausted {
        /// Chapter being summarized.
        chapter: String,
        /// Failed full-summary attempts.
        regenerations: usize,
        /// Addendum attempts made.
        addendums: usize,
        /// Item ids that never received a valid marker.
        missing: Vec<String>,
    },
}

/// Strict-load failure for `coverage_report.json`.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A required key is absent.
    #[error("missing required field `{0}`")]
    MissingField(String),
    /// A key is present with the wrong JSON type.
    #[error("field `{field}` must be {expected}")]
    WrongType {
        /// Dotted path of the offending field.
        field: String,
        /// Human readable expected type.
        expected: &'static str,
    },
    /// The document is not JSON at all.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error for a summarization job.
#[derive(Debug, Error)]
pub enum SummaryError {
    /// Generator unreachable for a full summary or addendum call.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Coverage budgets exhausted for a chapter.
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    /// Coverage report failed strict validation.
    #[error("coverage report {path:?}: {source}")]
    Schema {
        /// Report location.
        path: PathBuf,
        /// Validation failure.
        #[source]
        source: SchemaError,
    },
    /// Job input that can never produce a valid marker or checkpoint path.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The quality gate rejected the persisted report.
    #[error("quality gate failed: {}", .0.join("; "))]
    QualityGate(Vec<String>),
    /// Filesystem failure writing evidence or reports.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Serialization failure for an artifact.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SummaryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SummaryError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Coarse classification used by callers that only need to know how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable at the transport layer; surfaced once retries are spent.
    Transport,
    /// Recoverable; the chunk defaults to a best-effort extraction.
    MalformedExtraction,
    /// Fatal for the chapter.
    CoverageExhausted,
    /// Anything else (schema, I/O, gate).
    Other,
}

impl ExtractionError {
    /// Maps the extraction failure onto the shared kind taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractionError::Transport(_) => ErrorKind::Transport,
            ExtractionError::Malformed { .. } => ErrorKind::MalformedExtraction,
        }
    }
}

impl SummaryError {
    /// Maps the job failure onto the shared kind taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SummaryError::Transport(_) => ErrorKind::Transport,
            SummaryError::Coverage(_) => ErrorKind::CoverageExhausted,
            _ => ErrorKind::Other,
        }
    }
}
