#![warn(missing_docs)]
//! Long-document summarization with verifiable coverage.
//!
//! Chapters are chunked and mined for concepts, a capped Recall Set of
//! critical items is selected, and the generated summary must carry an
//! anchored marker for every one of them before it is accepted.

pub mod attempts;
pub mod auditor;
pub mod chapters;
pub mod checkpoint;
pub mod controls;
pub mod coverage_report;
pub mod error;
pub mod extraction;
pub mod normalizer;
pub mod pipeline;
pub mod providers;
pub mod recall_set;
pub mod regeneration;
pub mod sections;

pub use attempts::{AttemptRecord, AttemptRecorder, JsonlAttemptLedger, MemoryRecorder};
pub use auditor::{AuditResult, MarkerAuditor};
pub use chapters::Chapter;
pub use checkpoint::{Checkpoint, CheckpointStore, ChapterSummary, PartialCoverage, ProcessMetadata};
pub use controls::{Cli, ProviderKind, SummaryControls};
pub use coverage_report::{CoverageReport, GateVerdict, QualityGate};
pub use error::{CoverageError, ErrorKind, SchemaError, SummaryError, TransportError};
pub use normalizer::{item_id, normalize_content, Chunk, Chunker, ChunkingConfig};
pub use pipeline::{JobOutcome, SummaryJob};
pub use providers::{CompletionClient, CompletionRequest, RetryPolicy};
pub use recall_set::{MechanicalRecallSetBuilder, RecallItem, RecallSet, RecallSetBuilder};
pub use regeneration::{ControllerConfig, RegenerationController};
