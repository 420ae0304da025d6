//! Chapter input: already-split chapters read from JSONL or Markdown.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SummaryError;

/// Title given to a document that has no `# ` headings.
pub const FULL_TEXT_TITLE: &str = "Full Text";

/// One chapter of the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter number used in item ids and markers.
    pub number: String,
    /// Chapter title.
    pub title: String,
    /// Full chapter text.
    pub text: String,
}

impl Chapter {
    /// Builds a chapter.
    pub fn new(number: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            title: title.into(),
            text: text.into(),
        }
    }

    /// Chapter numbers end up in `[[RS:cap{N}:..]]` markers and checkpoint
    /// file names, so only ASCII digits are accepted.
    pub fn check_number(&self) -> Result<(), SummaryError> {
        if !self.number.is_empty() && self.number.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(());
        }
        Err(SummaryError::InvalidInput(format!(
            "chapter {:?} ({}) must be numbered with ASCII digits",
            self.number, self.title
        )))
    }
}

/// Reads chapters from a JSONL file, one chapter object per line.
pub fn read_jsonl(path: &Path) -> Result<Vec<Chapter>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut chapters = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let chapter: Chapter = serde_json::from_str(&line)
            .with_context(|| format!("invalid chapter at line {}", line_no + 1))?;
        chapter
            .check_number()
            .with_context(|| format!("invalid chapter at line {}", line_no + 1))?;
        chapters.push(chapter);
    }
    Ok(chapters)
}

/// Splits Markdown on level-1 headings. Chapters are numbered from 1 in
/// document order; text before the first heading is dropped.
pub fn split_markdown(markdown: &str) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut body: Vec<&str> = Vec::new();
    let mut title: Option<String> = None;

    for line in markdown.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            if let Some(previous) = title.take() {
                push_chapter(&mut chapters, previous, &body);
            }
            body.clear();
            title = Some(heading.trim().to_string());
            continue;
        }
        body.push(line);
    }

    match title {
        Some(previous) => push_chapter(&mut chapters, previous, &body),
        None => chapters.push(Chapter::new("1", FULL_TEXT_TITLE, markdown.trim())),
    }
    chapters
}

fn push_chapter(chapters: &mut Vec<Chapter>, title: String, body: &[&str]) {
    let number = (chapters.len() + 1).to_string();
    let text = format!("# {title}\n{}", body.join("\n"));
    chapters.push(Chapter::new(number, title, text.trim_end()));
}

/// Reads `path` as JSONL when its extension is `jsonl`, otherwise as Markdown.
pub fn read_chapters(path: &Path) -> Result<Vec<Chapter>> {
    if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
        return read_jsonl(path);
    }
    let markdown = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(split_markdown(&markdown))
}
