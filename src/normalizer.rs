//! Content identity and word-window chunking for chapter text.
//!
//! Identity is a pure function of the normalized content and the chapter
//! number, so the same concept hashes to the same marker across runs, chunk
//! boundaries and regeneration attempts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Number of hex characters kept from the SHA-256 digest.
pub const ITEM_HASH_LEN: usize = 6;

/// Canonical form used for hashing: lowercase, no diacritics, no punctuation,
/// single spaces, trimmed.
pub fn normalize_content(content: &str) -> String {
    let lowered = content.to_lowercase();
    let stripped: String = lowered
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .filter(|ch| ch.is_alphanumeric() || *ch == '_' || ch.is_whitespace())
        .collect();
    collapse_whitespace(&stripped)
}

/// First [`ITEM_HASH_LEN`] hex characters of `sha256(normalize_content(content))`.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(normalize_content(content).as_bytes());
    let mut hex = String::with_capacity(ITEM_HASH_LEN);
    for byte in digest.iter().take(ITEM_HASH_LEN.div_ceil(2)) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(ITEM_HASH_LEN);
    hex
}

/// Stable identifier `RS:cap{chapter}:{hash6}` for a piece of content.
pub fn item_id(content: &str, chapter_number: &str) -> String {
    format!("RS:cap{}:{}", chapter_number, content_hash(content))
}

/// Returns the hash suffix of an item id (`RS:cap1:9f3a1c` -> `9f3a1c`).
pub fn hash_of(item_id: &str) -> &str {
    item_id.rsplit(':').next().unwrap_or(item_id)
}

/// A word-bounded window of chapter text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Sequential id starting at 0.
    pub id: usize,
    /// Words of the window joined by single spaces.
    pub text: String,
    /// Half-open word range `[start, end)` within the chapter.
    pub word_range: (usize, usize),
    /// Whether the window sits in a structural position (heading-like).
    pub is_heading: bool,
}

/// Sizing for [`Chunker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Words per chunk.
    pub target_words: usize,
    /// Words shared between consecutive chunks.
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: 1000,
            overlap_words: 100,
        }
    }
}

/// Splits chapter text into overlapping word windows.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Builds a chunker; the overlap is clamped below the target size.
    pub fn new(config: ChunkingConfig) -> Self {
        let target_words = config.target_words.max(1);
        let overlap_words = config.overlap_words.min(target_words - 1);
        Self {
            config: ChunkingConfig {
                target_words,
                overlap_words,
            },
        }
    }

    /// Effective configuration after clamping.
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Produces chunks covering every word of `text` in order.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let spans = word_spans(text);
        if spans.is_empty() {
            return Vec::new();
        }
        let step = self.config.target_words - self.config.overlap_words;
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < spans.len() {
            let end = (start + self.config.target_words).min(spans.len());
            let words: Vec<&str> = spans[start..end]
                .iter()
                .map(|&(from, to)| &text[from..to])
                .collect();
            let source = &text[spans[start].0..spans[end - 1].1];
            chunks.push(Chunk {
                id: chunks.len(),
                text: words.join(" "),
                word_range: (start, end),
                is_heading: is_structural(source),
            });
            if end == spans.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// Byte ranges of the whitespace-separated words of `text`.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        match (ch.is_whitespace(), open) {
            (true, Some(from)) => {
                spans.push((from, idx));
                open = None;
            }
            (false, None) => open = Some(idx),
            _ => {}
        }
    }
    if let Some(from) = open {
        spans.push((from, text.len()));
    }
    spans
}

/// A window is structural when it opens with a Markdown heading or spans
/// fewer than three source lines.
fn is_structural(source: &str) -> bool {
    let trimmed = source.trim();
    trimmed.starts_with('#') || trimmed.lines().count() < 3
}

/// Collapses runs of whitespace into single spaces and trims the ends.
pub(crate) fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim_end().to_string()
}

/// Word count used for summary statistics.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_case_accents_and_punctuation() {
        assert_eq!(
            normalize_content("  A   Dopamina, é IMPORTANTE!  "),
            "a dopamina e importante"
        );
        assert_eq!(normalize_content("snake_case stays"), "snake_case stays");
        assert_eq!(normalize_content(""), "");
    }

    #[test]
    fn item_id_has_expected_shape() {
        let id = item_id("A dopamina é importante", "1");
        assert!(id.starts_with("RS:cap1:"));
        let hash = hash_of(&id);
        assert_eq!(hash.len(), ITEM_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn item_id_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf...
        assert_eq!(item_id("ABC", "3"), "RS:cap3:ba7816");
    }

    #[test]
    fn item_id_ignores_surface_variation() {
        assert_eq!(
            item_id("A dopamina é importante", "2"),
            item_id("a DOPAMINA e importante.", "2")
        );
        assert_ne!(item_id("dopamina", "1"), item_id("dopamina", "2"));
    }

    #[test]
    fn chunks_with_overlap() {
        let text = (0..25).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunker = Chunker::new(ChunkingConfig {
            target_words: 10,
            overlap_words: 2,
        });
        let chunks = chunker.chunk(&text);
        let ranges: Vec<_> = chunks.iter().map(|c| c.word_range).collect();
        assert_eq!(ranges, vec![(0, 10), (8, 18), (16, 25)]);
        assert_eq!(chunks[1].id, 1);
        assert!(chunks[1].text.starts_with("w8 w9"));
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let chunker = Chunker::new(ChunkingConfig::default());
        assert!(chunker.chunk("   \n ").is_empty());
    }

    #[test]
    fn overlap_is_clamped() {
        let chunker = Chunker::new(ChunkingConfig {
            target_words: 4,
            overlap_words: 9,
        });
        assert_eq!(chunker.config().overlap_words, 3);
        let chunks = chunker.chunk("a b c d e f");
        assert_eq!(chunks.last().map(|c| c.word_range.1), Some(6));
    }

    #[test]
    fn heading_windows_are_structural() {
        let chunker = Chunker::new(ChunkingConfig {
            target_words: 50,
            overlap_words: 0,
        });
        let heading = chunker.chunk("# Rivers\nrivers carry water");
        assert!(heading[0].is_heading);
        let body = chunker.chunk("line one here\nline two here\nline three here\nline four");
        assert!(!body[0].is_heading);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(input in "[a-zA-Z\u{e0}-\u{fc} ,.!_]{0,40}") {
            let once = normalize_content(&input);
            prop_assert_eq!(normalize_content(&once), once.clone());
        }

        #[test]
        fn item_id_is_deterministic(input in "[a-zA-Z ,.!]{1,40}", chapter in 1u32..50) {
            let chapter = chapter.to_string();
            prop_assert_eq!(item_id(&input, &chapter), item_id(&input, &chapter));
        }
    }
}
