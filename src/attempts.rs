//! Side-channel record of every regeneration and addendum attempt.
//!
//! Recorders observe the controller; nothing they do feeds back into audits.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const EXCERPT_CHARS: usize = 200;

/// Which phase of the controller produced the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Full summary generation.
    Regeneration,
    /// Bullet addendum for missing items.
    Addendum,
}

/// Prompting strategy used for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStrategy {
    /// Full summary with every marker embedded in the prompt.
    Full,
    /// First addendum try: one bullet per missing item.
    Direct,
    /// Later addendum tries: copy the bullets verbatim.
    CopyExactly,
}

/// One attempt as seen by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// When the audit of the attempt finished.
    pub recorded_at: DateTime<Utc>,
    /// Chapter being summarized.
    pub chapter_number: String,
    /// Phase of the controller.
    pub phase: AttemptPhase,
    /// 1-based attempt number within the phase.
    pub attempt: usize,
    /// Prompting strategy.
    pub strategy: AttemptStrategy,
    /// Sampling temperature used.
    pub temperature: f32,
    /// Audit verdict for the text produced.
    pub passed: bool,
    /// Items still missing after the attempt.
    pub missing: Vec<String>,
    /// Leading characters of the generated text.
    pub excerpt: String,
}

impl AttemptRecord {
    /// Builds a record stamped with the current time; the excerpt is cut to
    /// its first 200 characters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chapter_number: &str,
        phase: AttemptPhase,
        attempt: usize,
        strategy: AttemptStrategy,
        temperature: f32,
        passed: bool,
        missing: Vec<String>,
        text: &str,
    ) -> Self {
        Self {
            recorded_at: Utc::now(),
            chapter_number: chapter_number.to_string(),
            phase,
            attempt,
            strategy,
            temperature,
            passed,
            missing,
            excerpt: text.chars().take(EXCERPT_CHARS).collect(),
        }
    }
}

/// Sink for attempt records.
pub trait AttemptRecorder: Send + Sync {
    /// Stores one record. Failures are the recorder's problem, never the caller's.
    fn record(&self, record: &AttemptRecord);
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<AttemptRecord>>,
}

impl MemoryRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl AttemptRecorder for MemoryRecorder {
    fn record(&self, record: &AttemptRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

/// Appends records to a JSONL file, one line per attempt.
#[derive(Debug, Clone)]
pub struct JsonlAttemptLedger {
    path: PathBuf,
}

impl JsonlAttemptLedger {
    /// Ledger writing to `path`; parent directories are created on demand.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &AttemptRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")
    }

    /// Reads every record back, skipping nothing: a bad line is an error.
    pub fn read_all(&self) -> anyhow::Result<Vec<AttemptRecord>> {
        use anyhow::Context;
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read ledger {:?}", self.path))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("invalid ledger line {} in {:?}", idx + 1, self.path))
            })
            .collect()
    }
}

impl AttemptRecorder for JsonlAttemptLedger {
    fn record(&self, record: &AttemptRecord) {
        if let Err(err) = self.append(record) {
            warn!(path = ?self.path, error = %err, "failed to append attempt record");
        }
    }
}
