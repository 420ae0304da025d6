//! Job driver: runs every chapter through extraction, Recall Set selection and
//! the coverage controller, checkpointing each one, then writes the coverage
//! report and gates on it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempts::AttemptRecorder;
use crate::auditor::MarkerAuditor;
use crate::chapters::Chapter;
use crate::checkpoint::{
    is_safe_file_component, ChapterSummary, CheckpointStore, PartialCoverage, ProcessMetadata,
};
use crate::controls::SummaryControls;
use crate::coverage_report::{
    ChapterAuditSummary, CoverageReport, QualityGate, REPORT_MARKDOWN_FILE,
};
use crate::error::SummaryError;
use crate::extraction::{ChunkExtraction, ConceptExtractor};
use crate::normalizer::{collapse_whitespace, word_count, Chunker};
use crate::providers::CompletionClient;
use crate::recall_set::{RecallSet, RecallSetBuilder};
use crate::regeneration::{ChapterContext, RegenerationController};
use crate::sections::{parse_sections, ParsedSections};

const FALLBACK_KEY_POINTS: usize = 5;
const FALLBACK_EXAMPLES: usize = 3;

/// Everything a finished job produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Session the job ran under.
    pub session_id: String,
    /// Chapter results in input order.
    pub summaries: Vec<ChapterSummary>,
    /// Report as loaded back from disk.
    pub report: CoverageReport,
    /// `coverage_report.json` location.
    pub report_path: PathBuf,
    /// `report.md` location.
    pub markdown_path: PathBuf,
    /// Extraction evidence location.
    pub extractions_path: PathBuf,
    /// Chapters restored from checkpoints instead of recomputed.
    pub resumed_chapters: Vec<String>,
}

struct ChapterRun {
    summary: ChapterSummary,
    coverage: PartialCoverage,
    extractions: Vec<ChunkExtraction>,
}

/// A resumable multi-chapter summarization job.
pub struct SummaryJob<'a> {
    client: &'a dyn CompletionClient,
    builder: &'a dyn RecallSetBuilder,
    recorder: &'a dyn AttemptRecorder,
    controls: SummaryControls,
    checkpoints: CheckpointStore,
    evidence_dir: PathBuf,
}

impl<'a> SummaryJob<'a> {
    /// Wires a job together. `builder` decides criticality; `recorder` sees
    /// every generation attempt.
    pub fn new(
        client: &'a dyn CompletionClient,
        builder: &'a dyn RecallSetBuilder,
        recorder: &'a dyn AttemptRecorder,
        controls: SummaryControls,
        checkpoints: CheckpointStore,
        evidence_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            builder,
            recorder,
            controls,
            checkpoints,
            evidence_dir: evidence_dir.into(),
        }
    }

    /// Runs (or resumes) the job over `chapters`.
    pub async fn run(&self, chapters: &[Chapter]) -> Result<JobOutcome, SummaryError> {
        let session_id = self
            .controls
            .session_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !is_safe_file_component(&session_id) {
            return Err(SummaryError::InvalidInput(format!(
                "session id {session_id:?} cannot be used in a checkpoint file name"
            )));
        }
        for chapter in chapters {
            chapter.check_number()?;
        }

        let mut metadata = match self.checkpoints.find_last_valid(&session_id) {
            Some(checkpoint) => checkpoint.metadata,
            None => {
                info!(session = %session_id, "starting new session");
                ProcessMetadata::new(&session_id)
            }
        };

        let mut summaries = Vec::with_capacity(chapters.len());
        let mut coverages = Vec::with_capacity(chapters.len());
        let mut extractions: BTreeMap<String, Vec<ChunkExtraction>> = BTreeMap::new();
        let mut resumed_chapters = Vec::new();

        for chapter in chapters {
            if metadata.is_processed(&chapter.number) {
                if let Some(checkpoint) = self.checkpoints.load(&session_id, &chapter.number) {
                    info!(chapter = %chapter.number, "restored from checkpoint");
                    summaries.push(checkpoint.chapter_summary);
                    coverages.push(checkpoint.coverage_report);
                    resumed_chapters.push(chapter.number.clone());
                    continue;
                }
                warn!(chapter = %chapter.number, "checkpoint unusable; recomputing chapter");
                metadata.unmark(&chapter.number);
            }

            let run = self.summarize_chapter(chapter).await?;
            metadata.mark_processed(
                &chapter.number,
                run.coverage.processed_chunks,
                run.coverage.total_chunks,
            );
            if let Err(err) = self.checkpoints.save(
                &session_id,
                &chapter.number,
                &run.summary,
                &run.coverage,
                &metadata,
            ) {
                warn!(chapter = %chapter.number, error = %err, "failed to save checkpoint");
            }
            extractions.insert(chapter.number.clone(), run.extractions);
            summaries.push(run.summary);
            coverages.push(run.coverage);
        }

        let extractions_path = self.write_extractions(&extractions)?;
        let report_path = CoverageReport::build(&coverages).write_to(&self.evidence_dir)?;
        let report = CoverageReport::load(&report_path)?;
        let markdown_path = self.evidence_dir.join(REPORT_MARKDOWN_FILE);
        fs::write(&markdown_path, report.render_markdown())
            .map_err(|err| SummaryError::io(&markdown_path, err))?;

        let verdict = QualityGate.evaluate(&report);
        if !verdict.passed {
            return Err(SummaryError::QualityGate(verdict.errors));
        }
        info!(
            session = %session_id,
            chapters = summaries.len(),
            resumed = resumed_chapters.len(),
            report = ?report_path,
            "job complete"
        );
        Ok(JobOutcome {
            session_id,
            summaries,
            report,
            report_path,
            markdown_path,
            extractions_path,
            resumed_chapters,
        })
    }

    async fn summarize_chapter(&self, chapter: &Chapter) -> Result<ChapterRun, SummaryError> {
        let chunks = Chunker::new(self.controls.chunking()).chunk(&chapter.text);
        info!(chapter = %chapter.number, chunks = chunks.len(), "chapter chunked");

        let extractor = ConceptExtractor::new(self.client, self.controls.extraction_concurrency());
        let extractions = extractor.extract_chapter(&chunks).await;
        let degraded = extractions.iter().filter(|e| e.degraded).count();
        if degraded > 0 {
            warn!(chapter = %chapter.number, degraded, "some chunks used fallback extraction");
        }

        let recall_set = self.builder.build(&extractions, &chapter.number);
        info!(chapter = %chapter.number, recall_set = %recall_set, "recall set built");

        let controller =
            RegenerationController::new(self.client, self.recorder, self.controls.controller());
        let outcome = controller
            .run(
                ChapterContext {
                    number: &chapter.number,
                    title: &chapter.title,
                    text: &chapter.text,
                },
                &recall_set,
            )
            .await?;
        let audit = MarkerAuditor.audit(&outcome.text, &recall_set, &chapter.number);

        let summary = structure_summary(chapter, &outcome.text, &recall_set, &extractions);
        let coverage = PartialCoverage {
            chapter_number: chapter.number.clone(),
            chapter_title: chapter.title.clone(),
            total_chunks: chunks.len(),
            processed_chunks: extractions.len(),
            chunk_coverage_percentage: if chunks.is_empty() {
                0.0
            } else {
                extractions.len() as f64 / chunks.len() as f64 * 100.0
            },
            recall_set,
            audit_result: ChapterAuditSummary {
                passed: audit.passed,
                regeneration_count: outcome.regeneration_count,
                addendum_count: outcome.addendum_count,
                missing_markers: audit.missing_markers,
                invalid_chunks: audit.invalid_chunks,
            },
        };
        Ok(ChapterRun {
            summary,
            coverage,
            extractions,
        })
    }

    fn write_extractions(
        &self,
        extractions: &BTreeMap<String, Vec<ChunkExtraction>>,
    ) -> Result<PathBuf, SummaryError> {
        fs::create_dir_all(&self.evidence_dir)
            .map_err(|err| SummaryError::io(&self.evidence_dir, err))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = self.evidence_dir.join(format!("extractions_{stamp}.json"));
        let body = serde_json::to_string_pretty(extractions)?;
        fs::write(&path, body).map_err(|err| SummaryError::io(&path, err))?;
        debug!(path = ?path, chapters = extractions.len(), "extraction evidence written");
        Ok(path)
    }

    /// Directory receiving the report and evidence files.
    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }
}

/// Turns the accepted text into a [`ChapterSummary`]. Sections the reply did
/// not provide are filled from the chapter's own material so the result is
/// always complete.
fn structure_summary(
    chapter: &Chapter,
    text: &str,
    recall_set: &RecallSet,
    extractions: &[ChunkExtraction],
) -> ChapterSummary {
    let mut parsed = match parse_sections(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(chapter = %chapter.number, error = %err, "summary sections not found; keeping whole reply");
            ParsedSections {
                summary: text.to_string(),
                ..Default::default()
            }
        }
    };
    // The stored body must carry every marker on its own.
    let body_audit = MarkerAuditor.audit(&parsed.summary, recall_set, &chapter.number);
    if !body_audit.passed {
        warn!(
            chapter = %chapter.number,
            missing = ?body_audit.missing_markers,
            "markers outside the summary section; keeping whole reply"
        );
        parsed.summary = text.to_string();
    }

    let mut key_points = parsed.key_points;
    if key_points.is_empty() {
        key_points = recall_set
            .critical_items
            .iter()
            .chain(&recall_set.supporting_items)
            .take(FALLBACK_KEY_POINTS)
            .map(|item| item.content.clone())
            .collect();
    }
    if key_points.is_empty() {
        key_points.push(chapter.title.clone());
    }

    let mut examples = parsed.examples;
    if examples.is_empty() {
        examples = extractions
            .iter()
            .flat_map(|extraction| extraction.examples.iter().cloned())
            .take(FALLBACK_EXAMPLES)
            .collect();
    }
    if examples.is_empty() {
        examples.push(format!("No examples identified in chapter {}", chapter.number));
    }

    let mut quotes = parsed.quotes;
    if quotes.is_empty() {
        quotes.extend(first_sentence(&chapter.text));
    }
    if quotes.is_empty() {
        quotes.push(chapter.title.clone());
    }

    ChapterSummary {
        number: chapter.number.clone(),
        title: chapter.title.clone(),
        word_count: word_count(&chapter.text),
        summary_word_count: word_count(&parsed.summary),
        summary: parsed.summary,
        marked_text: text.to_string(),
        key_points,
        quotes,
        examples,
    }
}

/// First sentence of the chapter body, skipping Markdown heading lines.
fn first_sentence(text: &str) -> Option<String> {
    let body = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    let body = body.trim();
    let end = body
        .find(['.', '!', '?'])
        .map(|idx| idx + 1)
        .unwrap_or(body.len());
    let sentence = collapse_whitespace(&body[..end]);
    (!sentence.is_empty()).then_some(sentence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall_set::{Criticality, CriticalityReason, RecallItem};
    use std::collections::BTreeSet;

    fn chapter() -> Chapter {
        Chapter::new("2", "Deltas", "# Deltas\nRivers drop silt at the mouth. Deltas grow.")
    }

    fn recall_set() -> RecallSet {
        RecallSet {
            chapter_number: "2".into(),
            critical_items: vec![RecallItem {
                item_id: "RS:cap2:abcdef".into(),
                content: "Silt".into(),
                criticality: Criticality::Critical,
                reason: Some(CriticalityReason::MultiChunk),
                source_chunks: BTreeSet::from([0, 1]),
                frequency: 2,
            }],
            supporting_items: Vec::new(),
        }
    }

    #[test]
    fn labelled_reply_is_used_as_is() {
        let reply = "SUMMARY:\nSilt builds land [[RS:cap2:abcdef|chunks:0]].\nKEY POINTS:\n- silt\nQUOTES:\n\"drop silt\"\nEXAMPLES:\n- Nile";
        let summary = structure_summary(&chapter(), reply, &recall_set(), &[]);
        assert_eq!(summary.summary, "Silt builds land [[RS:cap2:abcdef|chunks:0]].");
        assert_eq!(summary.marked_text, reply);
        assert_eq!(summary.summary_word_count, 4);
        assert_eq!(summary.key_points, vec!["silt"]);
        assert_eq!(summary.quotes, vec!["drop silt"]);
        assert_eq!(summary.examples, vec!["Nile"]);
    }

    #[test]
    fn missing_sections_are_filled_from_the_chapter() {
        let extraction = ChunkExtraction {
            chunk_id: 0,
            examples: vec!["Mississippi".into()],
            ..Default::default()
        };
        let summary = structure_summary(&chapter(), "Plain prose only.", &recall_set(), &[extraction]);
        assert_eq!(summary.summary, "Plain prose only.");
        assert_eq!(summary.key_points, vec!["Silt"]);
        assert_eq!(summary.examples, vec!["Mississippi"]);
        assert_eq!(summary.quotes, vec!["Rivers drop silt at the mouth."]);
    }

    #[test]
    fn markers_outside_summary_section_keep_whole_reply() {
        let reply = "SUMMARY:\nRivers build land.\n\nKEY POINTS:\n- Silt [[RS:cap2:abcdef|chunks:0,1]]";
        let summary = structure_summary(&chapter(), reply, &recall_set(), &[]);
        assert_eq!(summary.summary, reply);
        assert_eq!(summary.key_points, vec!["Silt [[RS:cap2:abcdef|chunks:0,1]]"]);
        let stored = MarkerAuditor.audit(&summary.summary, &recall_set(), "2");
        assert!(stored.passed, "{stored:?}");
    }

    #[test]
    fn first_sentence_handles_unterminated_text() {
        assert_eq!(first_sentence("# Title\n  no   stop here"), Some("no stop here".into()));
        assert_eq!(first_sentence("# Only a heading"), None);
    }
}
