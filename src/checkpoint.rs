//! Per-chapter checkpoints that make a summarization job resumable.
//!
//! One file per chapter, `{session}_checkpoint_{chapter}.json`, written to a
//! temporary sibling and renamed into place. A checkpoint that fails any
//! validation rule is treated exactly like a missing one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coverage_report::ChapterAuditSummary;
use crate::error::SummaryError;
use crate::recall_set::RecallSet;

const CHECKPOINT_MARKER: &str = "_checkpoint_";

/// Structured result for one chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    /// Chapter number.
    pub number: String,
    /// Chapter title.
    pub title: String,
    /// Words in the chapter.
    pub word_count: usize,
    /// Words in the summary body.
    pub summary_word_count: usize,
    /// Summary body with its markers and coverage addendum.
    pub summary: String,
    /// Accepted generator text exactly as audited.
    pub marked_text: String,
    /// Key points.
    pub key_points: Vec<String>,
    /// Verbatim quotes.
    pub quotes: Vec<String>,
    /// Examples.
    pub examples: Vec<String>,
}

/// Coverage figures of a chapter as known when its checkpoint is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCoverage {
    /// Chapter number.
    pub chapter_number: String,
    /// Chapter title.
    pub chapter_title: String,
    /// Chunks produced.
    pub total_chunks: usize,
    /// Chunks extracted.
    pub processed_chunks: usize,
    /// `processed / total * 100`.
    pub chunk_coverage_percentage: f64,
    /// Recall Set the chapter was audited against.
    pub recall_set: RecallSet,
    /// Final audit figures.
    pub audit_result: ChapterAuditSummary,
}

/// Job progress carried from checkpoint to checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    /// Session the job belongs to.
    pub session_id: String,
    /// When the job first started.
    pub started_at: DateTime<Utc>,
    /// Chapters completed, in processing order, without duplicates.
    pub processed_chapters: Vec<String>,
    /// Extracted chunks per chapter.
    pub processed_chunks_per_chapter: BTreeMap<String, usize>,
    /// Produced chunks per chapter.
    pub total_chunks_per_chapter: BTreeMap<String, usize>,
    /// Time of the most recent checkpoint.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl ProcessMetadata {
    /// Fresh metadata for `session_id`.
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            processed_chapters: Vec::new(),
            processed_chunks_per_chapter: BTreeMap::new(),
            total_chunks_per_chapter: BTreeMap::new(),
            last_checkpoint_at: None,
        }
    }

    /// Records a completed chapter.
    pub fn mark_processed(&mut self, chapter: &str, processed_chunks: usize, total_chunks: usize) {
        if !self.is_processed(chapter) {
            self.processed_chapters.push(chapter.to_string());
        }
        self.processed_chunks_per_chapter
            .insert(chapter.to_string(), processed_chunks);
        self.total_chunks_per_chapter
            .insert(chapter.to_string(), total_chunks);
        self.last_checkpoint_at = Some(Utc::now());
    }

    /// Forgets a chapter whose checkpoint turned out to be unusable.
    pub fn unmark(&mut self, chapter: &str) {
        self.processed_chapters.retain(|c| c != chapter);
        self.processed_chunks_per_chapter.remove(chapter);
        self.total_chunks_per_chapter.remove(chapter);
    }

    /// Whether `chapter` is recorded as completed.
    pub fn is_processed(&self, chapter: &str) -> bool {
        self.processed_chapters.iter().any(|c| c == chapter)
    }
}

/// Everything persisted for one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning session.
    pub session_id: String,
    /// Chapter the checkpoint closes.
    pub chapter_number: String,
    /// Write time; resume orders by it.
    pub timestamp: DateTime<Utc>,
    /// [`ChapterSummary::checksum`] at write time.
    pub summary_crc32: u32,
    /// Structured chapter result.
    pub chapter_summary: ChapterSummary,
    /// Coverage figures for the chapter.
    pub coverage_report: PartialCoverage,
    /// Job progress including this chapter.
    pub metadata: ProcessMetadata,
}

/// Reason a checkpoint is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCheckpoint(pub String);

impl std::fmt::Display for InvalidCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ChapterSummary {
    /// CRC32 over the summary body followed by the marked text.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.summary.as_bytes());
        hasher.update(self.marked_text.as_bytes());
        hasher.finalize()
    }
}

impl Checkpoint {
    /// Checks every rule a loaded checkpoint must satisfy.
    pub fn validate(&self) -> Result<(), InvalidCheckpoint> {
        let invalid = |reason: String| Err(InvalidCheckpoint(reason));
        if self.session_id.is_empty() || self.chapter_number.is_empty() {
            return invalid("missing session id or chapter number".into());
        }
        let summary = &self.chapter_summary;
        let empty_fields: Vec<&str> = [
            ("number", summary.number.is_empty()),
            ("title", summary.title.is_empty()),
            ("summary", summary.summary.is_empty()),
            ("marked_text", summary.marked_text.is_empty()),
            ("key_points", summary.key_points.is_empty()),
            ("quotes", summary.quotes.is_empty()),
            ("examples", summary.examples.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();
        if !empty_fields.is_empty() {
            return invalid(format!("empty summary fields {empty_fields:?}"));
        }
        if summary.checksum() != self.summary_crc32 {
            return invalid("summary checksum mismatch".into());
        }
        if self.coverage_report.chapter_number != self.chapter_number {
            return invalid(format!(
                "coverage belongs to chapter {}",
                self.coverage_report.chapter_number
            ));
        }
        if !self.metadata.is_processed(&self.chapter_number) {
            return invalid(format!(
                "chapter {} not listed as processed",
                self.chapter_number
            ));
        }
        if self.metadata.session_id != self.session_id {
            return invalid(format!(
                "metadata session {} differs from {}",
                self.metadata.session_id, self.session_id
            ));
        }
        Ok(())
    }
}

/// True when `part` can be embedded in a checkpoint file name without
/// leaving the store directory.
pub fn is_safe_file_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains(|c| matches!(c, '/' | '\\' | '\0'))
}

/// Directory-backed checkpoint storage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of a chapter's checkpoint.
    pub fn path_for(&self, session_id: &str, chapter_number: &str) -> PathBuf {
        self.dir
            .join(format!("{session_id}{CHECKPOINT_MARKER}{chapter_number}.json"))
    }

    /// Atomically writes the checkpoint for one chapter.
    pub fn save(
        &self,
        session_id: &str,
        chapter_number: &str,
        chapter_summary: &ChapterSummary,
        coverage: &PartialCoverage,
        metadata: &ProcessMetadata,
    ) -> Result<PathBuf, SummaryError> {
        let checkpoint = Checkpoint {
            session_id: session_id.to_string(),
            chapter_number: chapter_number.to_string(),
            timestamp: Utc::now(),
            summary_crc32: chapter_summary.checksum(),
            chapter_summary: chapter_summary.clone(),
            coverage_report: coverage.clone(),
            metadata: metadata.clone(),
        };
        self.write(&checkpoint)
    }

    /// Atomically writes a fully built checkpoint.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf, SummaryError> {
        for part in [&checkpoint.session_id, &checkpoint.chapter_number] {
            if !is_safe_file_component(part) {
                return Err(SummaryError::InvalidInput(format!(
                    "{part:?} cannot be used in a checkpoint file name"
                )));
            }
        }
        fs::create_dir_all(&self.dir).map_err(|err| SummaryError::io(&self.dir, err))?;
        let path = self.path_for(&checkpoint.session_id, &checkpoint.chapter_number);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&body)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(SummaryError::io(&path, err));
        }
        debug!(path = ?path, "checkpoint written");
        Ok(path)
    }

    /// Loads and validates a chapter's checkpoint; invalid means absent.
    pub fn load(&self, session_id: &str, chapter_number: &str) -> Option<Checkpoint> {
        let checkpoint = read_checkpoint(&self.path_for(session_id, chapter_number))?;
        match checkpoint.validate() {
            Ok(()) if checkpoint.session_id == session_id => Some(checkpoint),
            Ok(()) => None,
            Err(reason) => {
                warn!(session = session_id, chapter = chapter_number, %reason, "ignoring invalid checkpoint");
                None
            }
        }
    }

    /// Most recent valid checkpoint of the session, by embedded timestamp.
    pub fn find_last_valid(&self, session_id: &str) -> Option<Checkpoint> {
        let mut candidates: Vec<Checkpoint> = self
            .session_files(session_id)
            .iter()
            .filter_map(|path| read_checkpoint(path))
            .filter(|checkpoint| checkpoint.session_id == session_id)
            .collect();
        candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let found = candidates.into_iter().find(|checkpoint| match checkpoint.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    session = session_id,
                    chapter = %checkpoint.chapter_number,
                    %reason,
                    "skipping invalid checkpoint"
                );
                false
            }
        });
        if let Some(checkpoint) = &found {
            info!(
                session = session_id,
                chapter = %checkpoint.chapter_number,
                "resuming from checkpoint"
            );
        }
        found
    }

    /// Chapters recorded as processed by the most recent valid checkpoint.
    pub fn processed_chapters(&self, session_id: &str) -> BTreeSet<String> {
        self.find_last_valid(session_id)
            .map(|checkpoint| checkpoint.metadata.processed_chapters.into_iter().collect())
            .unwrap_or_default()
    }

    fn session_files(&self, session_id: &str) -> Vec<PathBuf> {
        let prefix = format!("{session_id}{CHECKPOINT_MARKER}");
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            })
            .collect()
    }
}

fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
    let raw = fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(err) => {
            warn!(path = ?path, error = %err, "unreadable checkpoint");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary(number: &str) -> ChapterSummary {
        ChapterSummary {
            number: number.to_string(),
            title: format!("Chapter {number}"),
            word_count: 1200,
            summary_word_count: 320,
            summary: format!("Summary of chapter {number}"),
            marked_text: format!("SUMMARY:\nSummary of chapter {number}"),
            key_points: vec!["point".into()],
            quotes: vec!["quote".into()],
            examples: vec!["example".into()],
        }
    }

    fn coverage(number: &str) -> PartialCoverage {
        PartialCoverage {
            chapter_number: number.to_string(),
            chapter_title: format!("Chapter {number}"),
            total_chunks: 2,
            processed_chunks: 2,
            chunk_coverage_percentage: 100.0,
            recall_set: RecallSet {
                chapter_number: number.to_string(),
                critical_items: Vec::new(),
                supporting_items: Vec::new(),
            },
            audit_result: ChapterAuditSummary {
                passed: true,
                ..ChapterAuditSummary::default()
            },
        }
    }

    fn save_chapter(store: &CheckpointStore, meta: &mut ProcessMetadata, number: &str) -> PathBuf {
        meta.mark_processed(number, 2, 2);
        store
            .save(&meta.session_id.clone(), number, &summary(number), &coverage(number), meta)
            .expect("save")
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let mut meta = ProcessMetadata::new("s1");
        let path = save_chapter(&store, &mut meta, "1");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("s1_checkpoint_1.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = store.load("s1", "1").expect("valid checkpoint");
        let raw: Checkpoint =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(loaded, raw);
        assert_eq!(loaded.chapter_summary, summary("1"));
        assert_eq!(loaded.coverage_report, coverage("1"));
        assert_eq!(loaded.metadata, meta);
    }

    #[test]
    fn corrupted_newer_checkpoint_falls_back_to_older() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let mut meta = ProcessMetadata::new("s2");
        save_chapter(&store, &mut meta, "1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = save_chapter(&store, &mut meta, "2");

        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(&newer).expect("read")).expect("parse");
        value["chapter_summary"]
            .as_object_mut()
            .expect("object")
            .remove("key_points");
        fs::write(&newer, value.to_string()).expect("rewrite");

        let found = store.find_last_valid("s2").expect("older checkpoint");
        assert_eq!(found.chapter_number, "1");
        assert!(store.load("s2", "2").is_none());
    }

    #[test]
    fn processed_chapters_after_three_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let mut meta = ProcessMetadata::new("s3");
        for chapter in ["1", "2", "3"] {
            save_chapter(&store, &mut meta, chapter);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let expected: BTreeSet<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(store.processed_chapters("s3"), expected);
        assert!(store.processed_chapters("other").is_empty());
    }

    #[test]
    fn validation_rules() {
        let mut meta = ProcessMetadata::new("s4");
        meta.mark_processed("1", 2, 2);
        let good = Checkpoint {
            session_id: "s4".into(),
            chapter_number: "1".into(),
            timestamp: Utc::now(),
            summary_crc32: summary("1").checksum(),
            chapter_summary: summary("1"),
            coverage_report: coverage("1"),
            metadata: meta.clone(),
        };
        assert_eq!(good.validate(), Ok(()));

        let mut empty_quotes = good.clone();
        empty_quotes.chapter_summary.quotes.clear();
        assert!(empty_quotes.validate().is_err());

        let mut tampered = good.clone();
        tampered.chapter_summary.summary.push_str(" edited");
        assert!(tampered.validate().is_err());

        let mut stripped = good.clone();
        stripped.chapter_summary.marked_text = "SUMMARY:\nno markers".into();
        assert!(stripped.validate().is_err());

        let mut unlisted = good.clone();
        unlisted.metadata.unmark("1");
        assert!(unlisted.validate().is_err());

        let mut foreign = good.clone();
        foreign.metadata.session_id = "other".into();
        assert!(foreign.validate().is_err());
    }

    #[test]
    fn unsafe_names_never_leave_the_store() {
        for part in ["", ".", "..", "../up", "a/b", "a\\b", "nul\0"] {
            assert!(!is_safe_file_component(part), "{part:?}");
        }
        assert!(is_safe_file_component("3f2a-session"));

        let root = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(root.path().join("checkpoints"));
        let mut meta = ProcessMetadata::new("../escape");
        meta.mark_processed("1", 2, 2);
        let err = store
            .save("../escape", "1", &summary("1"), &coverage("1"), &meta)
            .expect_err("traversal rejected");
        assert!(matches!(err, SummaryError::InvalidInput(_)));
        assert_eq!(fs::read_dir(root.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let mut meta = ProcessMetadata::new("s5");
        meta.mark_processed("2", 1, 3);
        meta.mark_processed("2", 3, 3);
        assert_eq!(meta.processed_chapters, vec!["2".to_string()]);
        assert_eq!(meta.processed_chunks_per_chapter["2"], 3);
    }
}
