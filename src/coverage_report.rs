//! `coverage_report.json`: the job-level coverage artifact and the quality
//! gate that reads it.
//!
//! The report is built once, after every chapter is done. The gate only ever
//! looks at the persisted file and never recomputes coverage.
//!
//! Loading walks the raw JSON before deserializing so a missing or mistyped
//! field is reported with its dotted path (`chapters[1].auditResult.passed`).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::checkpoint::PartialCoverage;
use crate::error::{SchemaError, SummaryError};

/// Schema version written into every report.
pub const REPORT_VERSION: &str = "1.0";
/// File name of the persisted report.
pub const REPORT_FILE: &str = "coverage_report.json";
/// File name of the Markdown digest.
pub const REPORT_MARKDOWN_FILE: &str = "report.md";

/// Audit figures for one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterAuditSummary {
    /// Final audit verdict.
    pub passed: bool,
    /// Failed full-summary attempts.
    pub regeneration_count: usize,
    /// Addendum attempts.
    pub addendum_count: usize,
    /// Critical items without a marker.
    pub missing_markers: Vec<String>,
    /// Invalid citations.
    pub invalid_chunks: Vec<String>,
}

/// Recall Set figures for one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallSetCoverage {
    /// Critical items selected.
    pub critical_items_total: usize,
    /// Critical items with a marker.
    pub critical_items_covered: usize,
    /// Supporting items.
    pub supporting_items_total: usize,
    /// Critical items without a marker.
    pub missing_critical_item_ids: Vec<String>,
}

/// One chapter entry of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterCoverage {
    /// Chapter number.
    pub chapter_number: String,
    /// Chapter title.
    pub chapter_title: String,
    /// Chunks produced.
    pub total_chunks: usize,
    /// Chunks extracted.
    pub processed_chunks: usize,
    /// `processed / total * 100`, 0 without chunks.
    pub chunk_coverage_percentage: f64,
    /// Recall Set figures.
    pub recall_set: RecallSetCoverage,
    /// Audit figures; `passed` also requires full chunk coverage.
    pub audit_result: ChapterAuditSummary,
}

/// Job-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    /// Chapters in the report.
    pub total_chapters: usize,
    /// Chapters that passed.
    pub chapters_with_100_percent: usize,
    /// Chapters that did not pass.
    pub chapters_failed: usize,
    /// Chapters that needed an addendum.
    pub chapters_using_addendum: usize,
    /// Sum of addendum attempts.
    pub total_addendums_used: usize,
    /// Mean addendum attempts per chapter.
    pub avg_addendums_per_chapter: f64,
}

/// The persisted coverage artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    /// Schema version.
    pub version: String,
    /// RFC 3339 creation time.
    pub generated_at: String,
    /// Covered critical items over all critical items, in percent.
    pub overall_coverage_percentage: f64,
    /// Job verdict.
    pub passed: bool,
    /// Per-chapter entries in processing order.
    pub chapters: Vec<ChapterCoverage>,
    /// Totals.
    pub summary: ReportSummary,
}

impl CoverageReport {
    /// Builds the report from every chapter's partial coverage.
    pub fn build(chapters: &[PartialCoverage]) -> Self {
        let mut total_critical = 0usize;
        let mut total_covered = 0usize;
        let mut entries = Vec::with_capacity(chapters.len());

        for partial in chapters {
            let critical_total = partial.recall_set.critical_items.len();
            let missing = partial.audit_result.missing_markers.clone();
            let covered = critical_total.saturating_sub(missing.len());
            total_critical += critical_total;
            total_covered += covered;

            let chunk_coverage = chunk_coverage(partial.processed_chunks, partial.total_chunks);
            let mut audit_result = partial.audit_result.clone();
            audit_result.passed = audit_result.passed && chunk_coverage == 100.0;

            entries.push(ChapterCoverage {
                chapter_number: partial.chapter_number.clone(),
                chapter_title: partial.chapter_title.clone(),
                total_chunks: partial.total_chunks,
                processed_chunks: partial.processed_chunks,
                chunk_coverage_percentage: chunk_coverage,
                recall_set: RecallSetCoverage {
                    critical_items_total: critical_total,
                    critical_items_covered: covered,
                    supporting_items_total: partial.recall_set.supporting_items.len(),
                    missing_critical_item_ids: missing,
                },
                audit_result,
            });
        }

        let overall = if total_critical == 0 {
            100.0
        } else {
            total_covered as f64 / total_critical as f64 * 100.0
        };
        let chapters_passed = entries.iter().filter(|c| c.audit_result.passed).count();
        let chapters_failed = entries.len() - chapters_passed;
        let chapters_using_addendum = entries
            .iter()
            .filter(|c| c.audit_result.addendum_count > 0)
            .count();
        let total_addendums: usize = entries.iter().map(|c| c.audit_result.addendum_count).sum();
        let avg_addendums = if entries.is_empty() {
            0.0
        } else {
            total_addendums as f64 / entries.len() as f64
        };
        let passed = overall == 100.0
            && chapters_failed == 0
            && entries.iter().all(|c| c.chunk_coverage_percentage == 100.0);

        Self {
            version: REPORT_VERSION.to_string(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            overall_coverage_percentage: overall,
            passed,
            summary: ReportSummary {
                total_chapters: entries.len(),
                chapters_with_100_percent: chapters_passed,
                chapters_failed,
                chapters_using_addendum,
                total_addendums_used: total_addendums,
                avg_addendums_per_chapter: avg_addendums,
            },
            chapters: entries,
        }
    }

    /// Writes the report as pretty JSON into `dir`, returning the file path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, SummaryError> {
        fs::create_dir_all(dir).map_err(|err| SummaryError::io(dir, err))?;
        let path = dir.join(REPORT_FILE);
        let body = serde_json::to_string_pretty(self)?;
        fs::write(&path, body).map_err(|err| SummaryError::io(&path, err))?;
        Ok(path)
    }

    /// Loads a report, failing on any missing field or wrong type.
    pub fn load(path: &Path) -> Result<Self, SummaryError> {
        let raw = fs::read_to_string(path).map_err(|err| SummaryError::io(path, err))?;
        Self::from_json_str(&raw).map_err(|source| SummaryError::Schema {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Strict parse of a report document.
    pub fn from_json_str(raw: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(raw)?;
        validate_report(&value)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Human readable digest.
    pub fn render_markdown(&self) -> String {
        let verdict = |passed: bool| if passed { "PASSED" } else { "FAILED" };
        let mut lines = vec![
            "# Coverage Report".to_string(),
            String::new(),
            format!("**Generated at:** {}", self.generated_at),
            format!("**Version:** {}", self.version),
            String::new(),
            "## Overview".to_string(),
            String::new(),
            format!("- **Overall coverage:** {:.1}%", self.overall_coverage_percentage),
            format!("- **Status:** {}", verdict(self.passed)),
            format!("- **Chapters:** {}", self.summary.total_chapters),
            format!("- **Chapters at 100%:** {}", self.summary.chapters_with_100_percent),
            format!("- **Chapters failed:** {}", self.summary.chapters_failed),
            format!(
                "- **Addendums:** {} over {} chapters",
                self.summary.total_addendums_used, self.summary.chapters_using_addendum
            ),
            String::new(),
            "## Chapters".to_string(),
            String::new(),
        ];
        for chapter in &self.chapters {
            lines.push(format!(
                "### Chapter {}: {}",
                chapter.chapter_number, chapter.chapter_title
            ));
            lines.push(String::new());
            lines.push(format!(
                "- **Chunks:** {}/{} ({:.1}%)",
                chapter.processed_chunks, chapter.total_chunks, chapter.chunk_coverage_percentage
            ));
            lines.push(format!(
                "- **Critical items:** {}/{}",
                chapter.recall_set.critical_items_covered, chapter.recall_set.critical_items_total
            ));
            lines.push(format!("- **Status:** {}", verdict(chapter.audit_result.passed)));
            lines.push(format!(
                "- **Regenerations:** {}",
                chapter.audit_result.regeneration_count
            ));
            if !chapter.recall_set.missing_critical_item_ids.is_empty() {
                lines.push(format!(
                    "- **Missing items:** {}",
                    chapter.recall_set.missing_critical_item_ids.join(", ")
                ));
            }
            if !chapter.audit_result.invalid_chunks.is_empty() {
                lines.push(format!(
                    "- **Invalid chunks:** {}",
                    chapter.audit_result.invalid_chunks.join(", ")
                ));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

fn chunk_coverage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        processed as f64 / total as f64 * 100.0
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Str,
    Number,
    Integer,
    Bool,
    Object,
    StrArray,
    ObjArray,
}

impl Kind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Kind::Str => value.is_string(),
            Kind::Number => value.is_number(),
            Kind::Integer => value.is_u64(),
            Kind::Bool => value.is_boolean(),
            Kind::Object => value.is_object(),
            Kind::StrArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Kind::ObjArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_object)),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Kind::Str => "a string",
            Kind::Number => "a number",
            Kind::Integer => "a non-negative integer",
            Kind::Bool => "a boolean",
            Kind::Object => "an object",
            Kind::StrArray => "an array of strings",
            Kind::ObjArray => "an array of objects",
        }
    }
}

const ROOT_FIELDS: &[(&str, Kind)] = &[
    ("version", Kind::Str),
    ("generatedAt", Kind::Str),
    ("overallCoveragePercentage", Kind::Number),
    ("passed", Kind::Bool),
    ("chapters", Kind::ObjArray),
    ("summary", Kind::Object),
];

const CHAPTER_FIELDS: &[(&str, Kind)] = &[
    ("chapterNumber", Kind::Str),
    ("chapterTitle", Kind::Str),
    ("totalChunks", Kind::Integer),
    ("processedChunks", Kind::Integer),
    ("chunkCoveragePercentage", Kind::Number),
    ("recallSet", Kind::Object),
    ("auditResult", Kind::Object),
];

const RECALL_FIELDS: &[(&str, Kind)] = &[
    ("criticalItemsTotal", Kind::Integer),
    ("criticalItemsCovered", Kind::Integer),
    ("supportingItemsTotal", Kind::Integer),
    ("missingCriticalItemIds", Kind::StrArray),
];

const AUDIT_FIELDS: &[(&str, Kind)] = &[
    ("passed", Kind::Bool),
    ("regenerationCount", Kind::Integer),
    ("addendumCount", Kind::Integer),
    ("missingMarkers", Kind::StrArray),
    ("invalidChunks", Kind::StrArray),
];

const SUMMARY_FIELDS: &[(&str, Kind)] = &[
    ("totalChapters", Kind::Integer),
    ("chaptersWith100Percent", Kind::Integer),
    ("chaptersFailed", Kind::Integer),
    ("chaptersUsingAddendum", Kind::Integer),
    ("totalAddendumsUsed", Kind::Integer),
    ("avgAddendumsPerChapter", Kind::Number),
];

fn check_fields<'a>(
    object: &'a Map<String, Value>,
    prefix: &str,
    fields: &[(&str, Kind)],
) -> Result<&'a Map<String, Value>, SchemaError> {
    for (name, kind) in fields {
        let path = if prefix.is_empty() {
            (*name).to_string()
        } else {
            format!("{prefix}.{name}")
        };
        let value = object
            .get(*name)
            .ok_or_else(|| SchemaError::MissingField(path.clone()))?;
        if !kind.matches(value) {
            return Err(SchemaError::WrongType {
                field: path,
                expected: kind.describe(),
            });
        }
    }
    Ok(object)
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, SchemaError> {
    value.as_object().ok_or_else(|| SchemaError::WrongType {
        field: path.to_string(),
        expected: Kind::Object.describe(),
    })
}

fn validate_report(value: &Value) -> Result<(), SchemaError> {
    let root = check_fields(as_object(value, "$")?, "", ROOT_FIELDS)?;
    if let Some(chapters) = root.get("chapters").and_then(Value::as_array) {
        for (idx, chapter) in chapters.iter().enumerate() {
            let prefix = format!("chapters[{idx}]");
            let chapter = check_fields(as_object(chapter, &prefix)?, &prefix, CHAPTER_FIELDS)?;
            for (key, fields) in [("recallSet", RECALL_FIELDS), ("auditResult", AUDIT_FIELDS)] {
                let path = format!("{prefix}.{key}");
                if let Some(nested) = chapter.get(key) {
                    check_fields(as_object(nested, &path)?, &path, fields)?;
                }
            }
        }
    }
    if let Some(summary) = root.get("summary") {
        check_fields(as_object(summary, "summary")?, "summary", SUMMARY_FIELDS)?;
    }
    Ok(())
}

/// Verdict of the quality gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    /// Whether the report clears the gate.
    pub passed: bool,
    /// Reasons for failure; empty on success.
    pub errors: Vec<String>,
}

/// Pass/fail decision over a persisted coverage report.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityGate;

impl QualityGate {
    /// Passes iff overall coverage is exactly 100 and the report says it passed.
    pub fn evaluate(&self, report: &CoverageReport) -> GateVerdict {
        let mut errors = Vec::new();
        if report.overall_coverage_percentage != 100.0 {
            errors.push(format!(
                "overall coverage is {:.1}%, expected 100%",
                report.overall_coverage_percentage
            ));
        }
        if !report.passed {
            errors.push("report is marked as not passed".to_string());
        }
        for chapter in report.chapters.iter().filter(|c| !c.audit_result.passed) {
            errors.push(format!(
                "chapter {} failed: missing {:?}, invalid {:?}",
                chapter.chapter_number,
                chapter.audit_result.missing_markers,
                chapter.audit_result.invalid_chunks
            ));
        }
        let passed = report.overall_coverage_percentage == 100.0 && report.passed;
        GateVerdict { passed, errors }
    }

    /// Loads `path` strictly and evaluates it; unreadable or invalid files fail.
    pub fn check_file(&self, path: &Path) -> GateVerdict {
        match CoverageReport::load(path) {
            Ok(report) => {
                let verdict = self.evaluate(&report);
                if verdict.passed {
                    info!(path = ?path, "quality gate passed");
                } else {
                    error!(path = ?path, errors = ?verdict.errors, "quality gate failed");
                }
                verdict
            }
            Err(err) => {
                error!(path = ?path, error = %err, "coverage report rejected");
                GateVerdict {
                    passed: false,
                    errors: vec![err.to_string()],
                }
            }
        }
    }
}
