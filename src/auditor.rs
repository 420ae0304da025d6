//! Marker audit of generated text against a [`RecallSet`].
//!
//! The audit only looks at the text: it never trusts what the generator says
//! about its own coverage. Every check is a regex match plus set arithmetic.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalizer::hash_of;
use crate::recall_set::RecallSet;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\[RS:cap(\d+):([a-f0-9]{6})\|(chunks|src):([^\]]*)\]\]")
            .expect("marker pattern")
    })
}

fn strict_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\[RS:cap\d+:([a-f0-9]{6})\|chunks:[^\]]+\]\]")
            .expect("marker pattern")
    })
}

/// A marker as written in the text, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Declared chapter number.
    pub chapter: String,
    /// Six lowercase hex characters.
    pub hash: String,
    /// Reference kind (`chunks` or `src`).
    pub reference: String,
    /// Raw chunk field, possibly empty or garbage.
    pub chunks_field: String,
}

impl Marker {
    /// Item id this marker claims to cover.
    pub fn item_id(&self) -> String {
        format!("RS:cap{}:{}", self.chapter, self.hash)
    }

    /// Comma separated pieces that are plain non-negative integers.
    pub fn cited_chunks(&self) -> Vec<usize> {
        self.chunks_field
            .split(',')
            .map(str::trim)
            .filter(|piece| !piece.is_empty() && piece.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|piece| piece.parse().ok())
            .collect()
    }
}

/// Every marker occurring in `text`, in order.
pub fn parse_markers(text: &str) -> Vec<Marker> {
    marker_pattern()
        .captures_iter(text)
        .map(|caps| Marker {
            chapter: caps[1].to_string(),
            hash: caps[2].to_string(),
            reference: caps[3].to_string(),
            chunks_field: caps[4].to_string(),
        })
        .collect()
}

/// Cheap addendum self-check: which expected item ids have no well-formed
/// `chunks:` marker in `text`. Chapter numbers are not checked here.
pub fn scan_missing_hashes(text: &str, expected_ids: &[String]) -> Vec<String> {
    let found: BTreeSet<&str> = strict_marker_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    expected_ids
        .iter()
        .filter(|id| !found.contains(hash_of(id)))
        .cloned()
        .collect()
}

/// Outcome of one audit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    /// True only when every other list is empty.
    pub passed: bool,
    /// Critical items with no marker at all.
    pub missing_markers: Vec<String>,
    /// `"{id}:"` for empty citations, `"{id}:{c1,c2}"` for foreign chunks.
    pub invalid_chunks: Vec<String>,
    /// Markers whose id is not a critical item.
    pub invented_markers: Vec<String>,
    /// Human readable description of every failure.
    pub errors: Vec<String>,
}

/// Audits generated text against one chapter's Recall Set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerAuditor;

impl MarkerAuditor {
    /// Runs every check over `text` for `chapter_number`.
    pub fn audit(&self, text: &str, recall_set: &RecallSet, chapter_number: &str) -> AuditResult {
        let mut result = AuditResult::default();
        let mut found: BTreeSet<String> = BTreeSet::new();

        for marker in parse_markers(text) {
            let id = marker.item_id();
            if marker.chapter != chapter_number {
                result.errors.push(format!(
                    "marker {id} points to chapter {}, expected {chapter_number}",
                    marker.chapter
                ));
            }
            let Some(item) = recall_set.critical(&id) else {
                result.errors.push(format!("invented marker {id}: not in the recall set"));
                result.invented_markers.push(id);
                continue;
            };
            found.insert(id.clone());

            let cited = marker.cited_chunks();
            if cited.is_empty() {
                result.errors.push(format!("marker {id} cites no chunks"));
                result.invalid_chunks.push(format!("{id}:"));
                continue;
            }
            let foreign: Vec<String> = cited
                .iter()
                .filter(|chunk| !item.source_chunks.contains(*chunk))
                .map(usize::to_string)
                .collect();
            if !foreign.is_empty() {
                result.errors.push(format!(
                    "marker {id} cites chunks [{}] outside its sources {:?}",
                    foreign.join(","),
                    item.source_chunks
                ));
                result.invalid_chunks.push(format!("{id}:{}", foreign.join(",")));
            }
        }

        for item in &recall_set.critical_items {
            if !found.contains(&item.item_id) {
                result
                    .errors
                    .push(format!("critical item {} has no marker", item.item_id));
                result.missing_markers.push(item.item_id.clone());
            }
        }

        result.passed = result.missing_markers.is_empty()
            && result.invalid_chunks.is_empty()
            && result.invented_markers.is_empty()
            && result.errors.is_empty();
        debug!(
            chapter = chapter_number,
            passed = result.passed,
            missing = result.missing_markers.len(),
            invalid = result.invalid_chunks.len(),
            invented = result.invented_markers.len(),
            "audit complete"
        );
        result
    }
}
