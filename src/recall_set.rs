//! Chapter-level Recall Set: which extracted items the summary must cover.
//!
//! Selection is purely mechanical so that two runs over the same extractions
//! always demand the same markers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::extraction::{ChunkExtraction, ItemKind};
use crate::normalizer::{hash_of, item_id};

/// Default maximum number of critical items per chapter.
pub const DEFAULT_HARD_CAP: usize = 12;

const DEFINITION_KEYWORDS: &[&str] = &[
    "define",
    "defines",
    "defined",
    "definition",
    "means",
    "is",
    "are",
    "represents",
    "characterizes",
    "definição",
    "significa",
    "é",
    "são",
    "representa",
    "caracteriza",
];

const LAW_KEYWORDS: &[&str] = &[
    "law",
    "laws",
    "rule",
    "rules",
    "principle",
    "principles",
    "norm",
    "lei",
    "regra",
    "princípio",
    "norma",
    "mandamento",
    "preceito",
];

/// Whether an item must be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Must carry a marker in the summary.
    Critical,
    /// Context only.
    Supporting,
}

/// Rule that made an item critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriticalityReason {
    /// Contains a definition keyword.
    DefinitionMarker,
    /// Contains a law/rule keyword.
    LawMarker,
    /// Seen in two or more chunks.
    MultiChunk,
    /// Seen in a structural chunk.
    StructuralPosition,
}

impl CriticalityReason {
    /// Tie-break rank used by the hard cap; lower wins.
    pub fn priority(self) -> u8 {
        match self {
            CriticalityReason::DefinitionMarker => 0,
            CriticalityReason::LawMarker => 1,
            CriticalityReason::MultiChunk => 2,
            CriticalityReason::StructuralPosition => 3,
        }
    }
}

/// A deduplicated item of the chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallItem {
    /// `RS:cap{chapter}:{hash6}`.
    pub item_id: String,
    /// First-seen surface form.
    pub content: String,
    /// Critical or supporting.
    pub criticality: Criticality,
    /// Why the item is critical, if it is.
    pub reason: Option<CriticalityReason>,
    /// Chunks the item was extracted from, ascending.
    pub source_chunks: BTreeSet<usize>,
    /// Number of occurrences across all chunks.
    pub frequency: usize,
}

impl RecallItem {
    /// Hash suffix of the item id.
    pub fn hash(&self) -> &str {
        hash_of(&self.item_id)
    }

    /// Exact marker the summary must contain for this item.
    pub fn marker(&self, chapter_number: &str) -> String {
        let chunks = self
            .source_chunks
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("[[RS:cap{}:{}|chunks:{}]]", chapter_number, self.hash(), chunks)
    }

    fn hard_cap_key(&self) -> (std::cmp::Reverse<usize>, u8, std::cmp::Reverse<usize>, &str) {
        (
            std::cmp::Reverse(self.frequency),
            self.reason.map(CriticalityReason::priority).unwrap_or(4),
            std::cmp::Reverse(self.source_chunks.len()),
            self.item_id.as_str(),
        )
    }
}

/// Items the summary of one chapter is held to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallSet {
    /// Chapter the set belongs to.
    pub chapter_number: String,
    /// Items requiring a marker, at most the hard cap, in selection order.
    pub critical_items: Vec<RecallItem>,
    /// Remaining items, ordered by id.
    pub supporting_items: Vec<RecallItem>,
}

impl RecallSet {
    /// Looks up a critical item by id.
    pub fn critical(&self, item_id: &str) -> Option<&RecallItem> {
        self.critical_items.iter().find(|item| item.item_id == item_id)
    }

    /// Ids of all critical items, in selection order.
    pub fn critical_ids(&self) -> Vec<String> {
        self.critical_items.iter().map(|i| i.item_id.clone()).collect()
    }
}

impl fmt::Display for RecallSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chapter {}: {} critical, {} supporting",
            self.chapter_number,
            self.critical_items.len(),
            self.supporting_items.len()
        )
    }
}

/// Pluggable Recall Set construction.
pub trait RecallSetBuilder: Send + Sync {
    /// Builds the set for `chapter_number` from its chunk extractions.
    fn build(&self, extractions: &[ChunkExtraction], chapter_number: &str) -> RecallSet;
}

/// Keyword, spread and position rules with a deterministic hard cap.
#[derive(Debug, Clone)]
pub struct MechanicalRecallSetBuilder {
    hard_cap: usize,
}

impl Default for MechanicalRecallSetBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_CAP)
    }
}

impl MechanicalRecallSetBuilder {
    /// Builder keeping at most `hard_cap` critical items.
    pub fn new(hard_cap: usize) -> Self {
        Self { hard_cap }
    }

    /// Configured cap.
    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }
}

struct Aggregate {
    content: String,
    source_chunks: BTreeSet<usize>,
    frequency: usize,
    is_structural: bool,
}

impl RecallSetBuilder for MechanicalRecallSetBuilder {
    fn build(&self, extractions: &[ChunkExtraction], chapter_number: &str) -> RecallSet {
        let mut aggregates: BTreeMap<String, Aggregate> = BTreeMap::new();
        for item in extractions.iter().flat_map(ChunkExtraction::items) {
            if item.kind == ItemKind::Example {
                continue;
            }
            let id = item_id(&item.content, chapter_number);
            let entry = aggregates.entry(id).or_insert_with(|| Aggregate {
                content: item.content.clone(),
                source_chunks: BTreeSet::new(),
                frequency: 0,
                is_structural: false,
            });
            entry.source_chunks.insert(item.chunk_id);
            entry.frequency += 1;
            entry.is_structural |= item.is_heading;
        }

        let mut critical = Vec::new();
        let mut supporting = Vec::new();
        for (item_id, agg) in aggregates {
            let reason = classify(&agg.content, agg.source_chunks.len(), agg.is_structural);
            let item = RecallItem {
                item_id,
                content: agg.content,
                criticality: if reason.is_some() {
                    Criticality::Critical
                } else {
                    Criticality::Supporting
                },
                reason,
                source_chunks: agg.source_chunks,
                frequency: agg.frequency,
            };
            match item.criticality {
                Criticality::Critical => critical.push(item),
                Criticality::Supporting => supporting.push(item),
            }
        }

        critical.sort_by(|a, b| a.hard_cap_key().cmp(&b.hard_cap_key()));
        if critical.len() > self.hard_cap {
            let dropped: Vec<String> = critical
                .drain(self.hard_cap..)
                .map(|item| item.item_id)
                .collect();
            info!(
                chapter = chapter_number,
                cap = self.hard_cap,
                dropped = ?dropped,
                "hard cap applied to critical items"
            );
        }

        RecallSet {
            chapter_number: chapter_number.to_string(),
            critical_items: critical,
            supporting_items: supporting,
        }
    }
}

/// First matching rule wins: definition, law, spread, position.
pub fn classify(content: &str, chunk_count: usize, is_structural: bool) -> Option<CriticalityReason> {
    let lowered = content.to_lowercase();
    let has_any = |keywords: &[&str]| {
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| keywords.contains(&token))
    };
    if has_any(DEFINITION_KEYWORDS) {
        Some(CriticalityReason::DefinitionMarker)
    } else if has_any(LAW_KEYWORDS) {
        Some(CriticalityReason::LawMarker)
    } else if chunk_count >= 2 {
        Some(CriticalityReason::MultiChunk)
    } else if is_structural {
        Some(CriticalityReason::StructuralPosition)
    } else {
        None
    }
}
