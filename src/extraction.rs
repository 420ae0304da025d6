//! Per-chunk concept extraction through the completion service.
//!
//! The generator is treated as an untrusted JSON producer: anything that does
//! not parse degrades to a best-effort extraction instead of failing the
//! chapter.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::normalizer::Chunk;
use crate::providers::{CompletionClient, CompletionRequest};

const EXTRACTION_SYSTEM: &str =
    "You are a structured information extractor. Reply with valid JSON only.";
const EXTRACTION_MAX_TOKENS: usize = 500;
const EXTRACTION_TEMPERATURE: f32 = 0.2;
const CHUNK_PROMPT_CHARS: usize = 2000;
const FALLBACK_CONCEPTS: usize = 5;

/// Category of an extracted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Names, technical terms, definitions.
    Concept,
    /// Claims made by the author.
    Idea,
    /// Cases, studies, people mentioned.
    Example,
}

/// One candidate item attributed to a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedItem {
    /// Item text as produced by the generator.
    pub content: String,
    /// Item category.
    pub kind: ItemKind,
    /// Chunk the item came from.
    pub chunk_id: usize,
    /// Whether that chunk is structural.
    pub is_heading: bool,
}

/// Everything extracted from a single chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkExtraction {
    /// Source chunk id.
    pub chunk_id: usize,
    /// Concepts found.
    pub concepts: Vec<String>,
    /// Ideas found.
    pub ideas: Vec<String>,
    /// Examples found.
    pub examples: Vec<String>,
    /// Structural flag inherited from the chunk.
    pub is_heading: bool,
    /// Set when the generator output was unusable and a fallback was applied.
    #[serde(default)]
    pub degraded: bool,
}

impl ChunkExtraction {
    /// Flattens the extraction into typed items.
    pub fn items(&self) -> Vec<ExtractedItem> {
        let tagged = self
            .concepts
            .iter()
            .map(|c| (c, ItemKind::Concept))
            .chain(self.ideas.iter().map(|i| (i, ItemKind::Idea)))
            .chain(self.examples.iter().map(|e| (e, ItemKind::Example)));
        tagged
            .map(|(content, kind)| ExtractedItem {
                content: content.clone(),
                kind,
                chunk_id: self.chunk_id,
                is_heading: self.is_heading,
            })
            .collect()
    }

    fn empty_for(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            is_heading: chunk.is_heading,
            degraded: true,
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    concepts: Vec<Value>,
    #[serde(default)]
    ideas: Vec<Value>,
    #[serde(default)]
    examples: Vec<Value>,
}

/// Parses a generator reply for `chunk`.
///
/// The JSON object may be wrapped in prose or a code fence; non-string list
/// entries are ignored.
pub fn parse_extraction(chunk: &Chunk, response: &str) -> Result<ChunkExtraction, ExtractionError> {
    let malformed = |reason: String| ExtractionError::Malformed {
        chunk_id: chunk.id,
        reason,
    };
    let body = locate_json_object(response).ok_or_else(|| malformed("no JSON object".into()))?;
    let raw: RawExtraction =
        serde_json::from_str(body).map_err(|err| malformed(err.to_string()))?;
    Ok(ChunkExtraction {
        chunk_id: chunk.id,
        concepts: strings(raw.concepts),
        ideas: strings(raw.ideas),
        examples: strings(raw.examples),
        is_heading: chunk.is_heading,
        degraded: false,
    })
}

/// Best-effort extraction used when the reply is malformed: capitalised words
/// longer than five characters, at most five of them.
pub fn fallback_extraction(chunk: &Chunk) -> ChunkExtraction {
    let mut concepts: Vec<String> = Vec::new();
    for word in chunk.text.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        let starts_upper = word.chars().next().is_some_and(char::is_uppercase);
        if starts_upper && word.chars().count() > 5 && !concepts.iter().any(|c| c == word) {
            concepts.push(word.to_string());
            if concepts.len() == FALLBACK_CONCEPTS {
                break;
            }
        }
    }
    ChunkExtraction {
        concepts,
        ..ChunkExtraction::empty_for(chunk)
    }
}

fn strings(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|value| match value {
            Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn locate_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

fn extraction_prompt(chunk: &Chunk) -> String {
    let excerpt: String = chunk.text.chars().take(CHUNK_PROMPT_CHARS).collect();
    format!(
        "Extract from the text below:\n\
         - Main concepts (names, technical terms, definitions)\n\
         - Central ideas (claims made by the author)\n\
         - Examples mentioned\n\n\
         Text:\n{excerpt}\n\n\
         JSON format:\n\
         {{\"concepts\": [\"concept1\"], \"ideas\": [\"idea1\"], \"examples\": [\"example1\"]}}"
    )
}

/// Fans extraction requests out over a chapter's chunks.
pub struct ConceptExtractor<'a> {
    client: &'a dyn CompletionClient,
    permits: Semaphore,
}

impl<'a> ConceptExtractor<'a> {
    /// Creates an extractor allowing `concurrency` requests in flight.
    pub fn new(client: &'a dyn CompletionClient, concurrency: usize) -> Self {
        Self {
            client,
            permits: Semaphore::new(concurrency.max(1)),
        }
    }

    /// Extracts a single chunk, degrading on malformed output or transport
    /// failure.
    pub async fn extract_chunk(&self, chunk: &Chunk) -> ChunkExtraction {
        match self.try_extract_chunk(chunk).await {
            Ok(extraction) => extraction,
            Err(ExtractionError::Malformed { chunk_id, reason }) => {
                warn!(chunk = chunk_id, %reason, "malformed extraction; using fallback");
                fallback_extraction(chunk)
            }
            Err(ExtractionError::Transport(err)) => {
                warn!(chunk = chunk.id, error = %err, "extraction request failed; chunk left empty");
                ChunkExtraction::empty_for(chunk)
            }
        }
    }

    /// Extracts a single chunk, surfacing the failure kind.
    pub async fn try_extract_chunk(&self, chunk: &Chunk) -> Result<ChunkExtraction, ExtractionError> {
        let prompt = extraction_prompt(chunk);
        let response = {
            // A closed semaphore only happens on shutdown; proceed without a permit.
            let _permit = self.permits.acquire().await.ok();
            self.client
                .complete(&CompletionRequest {
                    system: EXTRACTION_SYSTEM,
                    user: &prompt,
                    max_output_tokens: EXTRACTION_MAX_TOKENS,
                    temperature: EXTRACTION_TEMPERATURE,
                })
                .await?
        };
        let extraction = parse_extraction(chunk, &response)?;
        debug!(
            chunk = chunk.id,
            concepts = extraction.concepts.len(),
            ideas = extraction.ideas.len(),
            "chunk extracted"
        );
        Ok(extraction)
    }

    /// Issues every chunk's request, then waits for all of them. Results are
    /// in chunk order.
    pub async fn extract_chapter(&self, chunks: &[Chunk]) -> Vec<ChunkExtraction> {
        join_all(chunks.iter().map(|chunk| self.extract_chunk(chunk))).await
    }
}
