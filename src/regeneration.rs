//! Drives the generator toward full marker coverage within fixed budgets.
//!
//! Phase one asks for complete summaries; phase two asks only for bullets
//! covering the items still missing and appends them under a coverage
//! heading. Every candidate is judged by [`MarkerAuditor`] alone.

use tracing::{info, warn};

use crate::attempts::{AttemptPhase, AttemptRecord, AttemptRecorder, AttemptStrategy};
use crate::auditor::{scan_missing_hashes, AuditResult, MarkerAuditor};
use crate::error::{CoverageError, SummaryError};
use crate::providers::{CompletionClient, CompletionRequest};
use crate::recall_set::{RecallItem, RecallSet};

/// Heading placed above appended addendum bullets.
pub const COVERAGE_HEADING: &str = "## Coverage (critical items)";

const SUMMARY_SYSTEM: &str = "You are an assistant that writes precise, informative book \
     summaries. Do not invent facts. If something is not in the text, do not claim it.";
const ADDENDUM_SYSTEM: &str = "You generate concise bullets. Your only task is to return \
     bullets carrying the EXACT markers requested. Do not add explanations, only the bullets.";
const SUMMARY_MAX_TOKENS: usize = 2000;
const SUMMARY_TEMPERATURE: f32 = 0.3;
const ADDENDUM_MAX_TOKENS: usize = 500;
const CHAPTER_PROMPT_CHARS: usize = 5000;

/// Attempt budgets for one chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Full-summary attempts.
    pub max_attempts: usize,
    /// Addendum attempts once full attempts are spent.
    pub max_addendums: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_addendums: 2,
        }
    }
}

/// The chapter as the controller needs to see it.
#[derive(Debug, Clone, Copy)]
pub struct ChapterContext<'a> {
    /// Chapter number as it appears in markers.
    pub number: &'a str,
    /// Chapter title.
    pub title: &'a str,
    /// Full chapter text.
    pub text: &'a str,
}

/// Accepted text plus the budget it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageOutcome {
    /// Summary, possibly followed by the coverage addendum.
    pub text: String,
    /// Audit of `text`; always passed.
    pub audit: AuditResult,
    /// Failed full-summary attempts.
    pub regeneration_count: usize,
    /// Addendum attempts made.
    pub addendum_count: usize,
}

impl CoverageOutcome {
    /// Whether phase two was needed.
    pub fn used_addendum(&self) -> bool {
        self.addendum_count > 0
    }
}

enum State {
    Generating { attempt: usize },
    Addendum { attempt: usize, base: String, missing: Vec<String> },
    Exhausted { missing: Vec<String> },
}

/// Generation/audit loop for a single chapter.
pub struct RegenerationController<'a> {
    client: &'a dyn CompletionClient,
    recorder: &'a dyn AttemptRecorder,
    auditor: MarkerAuditor,
    config: ControllerConfig,
}

impl<'a> RegenerationController<'a> {
    /// Controller using `client` for generation and `recorder` for the attempt log.
    pub fn new(
        client: &'a dyn CompletionClient,
        recorder: &'a dyn AttemptRecorder,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            recorder,
            auditor: MarkerAuditor,
            config,
        }
    }

    /// Runs both phases until the audit passes or the budgets run out.
    pub async fn run(
        &self,
        chapter: ChapterContext<'_>,
        recall_set: &RecallSet,
    ) -> Result<CoverageOutcome, SummaryError> {
        let mut regeneration_count = 0usize;
        let mut addendum_count = 0usize;
        let mut last_summary = String::new();
        let mut last_audit = AuditResult::default();
        let mut state = State::Generating { attempt: 1 };

        loop {
            state = match state {
                State::Generating { attempt } if attempt <= self.config.max_attempts => {
                    info!(
                        chapter = chapter.number,
                        attempt,
                        max = self.config.max_attempts,
                        "generating summary"
                    );
                    let text = self.generate_summary(chapter, recall_set).await?;
                    let audit = self.auditor.audit(&text, recall_set, chapter.number);
                    self.record(
                        chapter.number,
                        AttemptPhase::Regeneration,
                        attempt,
                        AttemptStrategy::Full,
                        SUMMARY_TEMPERATURE,
                        &audit,
                        &text,
                    );
                    if audit.passed {
                        info!(chapter = chapter.number, attempt, "summary accepted");
                        return Ok(CoverageOutcome {
                            text,
                            audit,
                            regeneration_count,
                            addendum_count,
                        });
                    }
                    warn!(
                        chapter = chapter.number,
                        attempt,
                        missing = audit.missing_markers.len(),
                        invalid = audit.invalid_chunks.len(),
                        invented = audit.invented_markers.len(),
                        "summary rejected"
                    );
                    regeneration_count = attempt;
                    last_summary = text;
                    last_audit = audit;
                    State::Generating { attempt: attempt + 1 }
                }
                State::Generating { .. } => {
                    if last_audit.missing_markers.is_empty() || self.config.max_addendums == 0 {
                        State::Exhausted {
                            missing: last_audit.missing_markers.clone(),
                        }
                    } else {
                        State::Addendum {
                            attempt: 1,
                            base: std::mem::take(&mut last_summary),
                            missing: last_audit.missing_markers.clone(),
                        }
                    }
                }
                State::Addendum {
                    attempt,
                    base,
                    missing,
                } if attempt <= self.config.max_addendums => {
                    addendum_count = attempt;
                    let strategy = addendum_strategy(attempt);
                    let temperature = addendum_temperature(strategy);
                    let items: Vec<&RecallItem> = recall_set
                        .critical_items
                        .iter()
                        .filter(|item| missing.contains(&item.item_id))
                        .collect();
                    info!(
                        chapter = chapter.number,
                        attempt,
                        missing = ?missing,
                        "generating addendum"
                    );
                    let addendum = self
                        .generate_addendum(chapter.number, &items, strategy, temperature)
                        .await?;
                    let absent = scan_missing_hashes(&addendum, &missing);
                    if !absent.is_empty() {
                        warn!(
                            chapter = chapter.number,
                            attempt,
                            absent = ?absent,
                            "addendum lacks expected markers"
                        );
                    }

                    let candidate = append_addendum(&base, &addendum);
                    let audit = self.auditor.audit(&candidate, recall_set, chapter.number);
                    self.record(
                        chapter.number,
                        AttemptPhase::Addendum,
                        attempt,
                        strategy,
                        temperature,
                        &audit,
                        &addendum,
                    );
                    if audit.passed {
                        info!(chapter = chapter.number, attempt, "addendum closed coverage");
                        return Ok(CoverageOutcome {
                            text: candidate,
                            audit,
                            regeneration_count,
                            addendum_count,
                        });
                    }
                    // Keep the bullets only if they made progress without adding bad markers.
                    let base_audit = self.auditor.audit(&base, recall_set, chapter.number);
                    let keeps = audit.missing_markers.len() < base_audit.missing_markers.len()
                        && audit.invalid_chunks.len() <= base_audit.invalid_chunks.len()
                        && audit.invented_markers.len() <= base_audit.invented_markers.len();
                    warn!(
                        chapter = chapter.number,
                        attempt,
                        missing = ?audit.missing_markers,
                        kept = keeps,
                        "addendum did not close coverage"
                    );
                    let (base, missing) = if keeps {
                        (candidate, audit.missing_markers.clone())
                    } else {
                        (base, missing)
                    };
                    last_audit = audit;
                    if missing.is_empty() {
                        State::Exhausted { missing }
                    } else {
                        State::Addendum {
                            attempt: attempt + 1,
                            base,
                            missing,
                        }
                    }
                }
                State::Addendum { missing, .. } => State::Exhausted { missing },
                State::Exhausted { missing } => {
                    let missing = if missing.is_empty() {
                        last_audit.missing_markers
                    } else {
                        missing
                    };
                    return Err(CoverageError::Exhausted {
                        chapter: chapter.number.to_string(),
                        regenerations: regeneration_count,
                        addendums: addendum_count,
                        missing,
                    }
                    .into());
                }
            };
        }
    }

    async fn generate_summary(
        &self,
        chapter: ChapterContext<'_>,
        recall_set: &RecallSet,
    ) -> Result<String, SummaryError> {
        let prompt = summary_prompt(chapter, recall_set);
        let text = self
            .client
            .complete(&CompletionRequest {
                system: SUMMARY_SYSTEM,
                user: &prompt,
                max_output_tokens: SUMMARY_MAX_TOKENS,
                temperature: SUMMARY_TEMPERATURE,
            })
            .await?;
        Ok(text.trim().to_string())
    }

    async fn generate_addendum(
        &self,
        chapter_number: &str,
        items: &[&RecallItem],
        strategy: AttemptStrategy,
        temperature: f32,
    ) -> Result<String, SummaryError> {
        let prompt = addendum_prompt(chapter_number, items, strategy);
        let text = self
            .client
            .complete(&CompletionRequest {
                system: ADDENDUM_SYSTEM,
                user: &prompt,
                max_output_tokens: ADDENDUM_MAX_TOKENS,
                temperature,
            })
            .await?;
        Ok(text.trim().to_string())
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        chapter: &str,
        phase: AttemptPhase,
        attempt: usize,
        strategy: AttemptStrategy,
        temperature: f32,
        audit: &AuditResult,
        text: &str,
    ) {
        self.recorder.record(&AttemptRecord::new(
            chapter,
            phase,
            attempt,
            strategy,
            temperature,
            audit.passed,
            audit.missing_markers.clone(),
            text,
        ));
    }
}

fn addendum_strategy(attempt: usize) -> AttemptStrategy {
    if attempt == 1 {
        AttemptStrategy::Direct
    } else {
        AttemptStrategy::CopyExactly
    }
}

fn addendum_temperature(strategy: AttemptStrategy) -> f32 {
    match strategy {
        AttemptStrategy::Direct => 0.1,
        _ => 0.0,
    }
}

/// `summary` followed by the coverage heading and `addendum`. Appending to
/// text that already carries the heading only adds the new bullets.
pub fn append_addendum(summary: &str, addendum: &str) -> String {
    if summary.contains(COVERAGE_HEADING) {
        format!("{summary}\n{addendum}")
    } else {
        format!("{summary}\n\n{COVERAGE_HEADING}\n\n{addendum}")
    }
}

fn bullet_list(chapter_number: &str, items: &[&RecallItem]) -> String {
    items
        .iter()
        .map(|item| format!("- {} {}", item.content, item.marker(chapter_number)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summary_prompt(chapter: ChapterContext<'_>, recall_set: &RecallSet) -> String {
    let excerpt: String = chapter.text.chars().take(CHAPTER_PROMPT_CHARS).collect();
    let words = chapter.text.split_whitespace().count();
    let items: Vec<&RecallItem> = recall_set.critical_items.iter().collect();
    let count = items.len();
    let list = bullet_list(chapter.number, &items);
    format!(
        "You are summarizing chapter {number}: \"{title}\"\n\n\
         Chapter text ({words} words):\n{excerpt}\n\n\
         MANDATORY: include ALL {count} critical items below in the summary, each with its EXACT marker:\n\n\
         {list}\n\n\
         RULES:\n\
         1. Every one of the {count} critical items above MUST appear in the summary.\n\
         2. Each item MUST carry its exact marker in the form [[RS:cap{number}:hash|chunks:N,M]].\n\
         3. Do not alter the markers.\n\
         4. Write 300-500 words that weave the markers in naturally.\n\n\
         Answer with these sections:\n\
         SUMMARY:\n<prose with every marker>\n\n\
         KEY POINTS:\n- <point>\n\n\
         QUOTES:\n\"<exact quote from the text>\"\n\n\
         EXAMPLES:\n- <example>\n",
        number = chapter.number,
        title = chapter.title,
    )
}

fn addendum_prompt(chapter_number: &str, items: &[&RecallItem], strategy: AttemptStrategy) -> String {
    let count = items.len();
    let list = bullet_list(chapter_number, items);
    match strategy {
        AttemptStrategy::Direct | AttemptStrategy::Full => format!(
            "Produce EXACTLY {count} bullets, one per item below. Each bullet MUST contain the EXACT marker shown.\n\n\
             REQUIRED FORMAT (copy exactly):\n{list}\n\n\
             RULES:\n\
             1. Exactly {count} bullets.\n\
             2. Each bullet starts with \"- \".\n\
             3. Do not change the markers; copy them as shown.\n\
             4. Add a short sentence (10-20 words) about the item before its marker.\n\n\
             BULLETS:"
        ),
        AttemptStrategy::CopyExactly => format!(
            "COPY EXACTLY the {count} bullets below, including their EXACT markers:\n\n{list}\n\n\
             Copy each line, add a short phrase before the marker, and return the lines.\n\n\
             BULLETS:"
        ),
    }
}
