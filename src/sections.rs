//! Parser for the labelled sections of a generated chapter summary.
//!
//! The reply is scanned line by line. A label line (`SUMMARY:`, `KEY POINTS:`,
//! `QUOTES:`, `EXAMPLES:` or their Portuguese forms) switches the current
//! section; the coverage heading appended by the addendum phase switches back
//! to the summary so its bullets stay attached to the prose they complete.

use std::fmt;

use crate::regeneration::COVERAGE_HEADING;

/// Section a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Text before any label.
    Preamble,
    /// Prose summary carrying the markers.
    Summary,
    /// Bulleted key points.
    KeyPoints,
    /// Verbatim quotes.
    Quotes,
    /// Examples from the text.
    Examples,
}

const LABELS: &[(&str, Section)] = &[
    ("SUMMARY", Section::Summary),
    ("RESUMO", Section::Summary),
    ("KEY POINTS", Section::KeyPoints),
    ("KEY-POINTS", Section::KeyPoints),
    ("PONTOS-CHAVE", Section::KeyPoints),
    ("PONTOS CHAVE", Section::KeyPoints),
    ("QUOTES", Section::Quotes),
    ("CITAÇÕES", Section::Quotes),
    ("CITACOES", Section::Quotes),
    ("EXAMPLES", Section::Examples),
    ("EXEMPLOS", Section::Examples),
];

/// Structured view of a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSections {
    /// Lines before the first label.
    pub preamble: String,
    /// Summary body, including any coverage addendum.
    pub summary: String,
    /// One entry per bullet.
    pub key_points: Vec<String>,
    /// Quotes without their quotation marks.
    pub quotes: Vec<String>,
    /// One entry per bullet.
    pub examples: Vec<String>,
}

/// Why a reply could not be split into sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionParseError {
    /// No label line at all.
    Unlabelled,
    /// A summary label exists but nothing follows it.
    EmptySummary,
    /// Labels exist but none of them is a summary label.
    NoSummary,
}

impl fmt::Display for SectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionParseError::Unlabelled => write!(f, "reply has no section labels"),
            SectionParseError::EmptySummary => write!(f, "summary section is empty"),
            SectionParseError::NoSummary => write!(f, "reply has no summary section"),
        }
    }
}

impl std::error::Error for SectionParseError {}

/// Splits `reply` into its labelled sections.
pub fn parse_sections(reply: &str) -> Result<ParsedSections, SectionParseError> {
    let mut parsed = ParsedSections::default();
    let mut current = Section::Preamble;
    let mut saw_label = false;
    let mut saw_summary = false;
    let mut preamble: Vec<&str> = Vec::new();
    let mut summary: Vec<&str> = Vec::new();

    for line in reply.lines() {
        let trimmed = line.trim();
        if trimmed == COVERAGE_HEADING {
            current = Section::Summary;
            summary.push("");
            summary.push(trimmed);
            continue;
        }
        if let Some((section, rest)) = label_of(trimmed) {
            saw_label = true;
            saw_summary |= section == Section::Summary;
            current = section;
            if rest.is_empty() {
                continue;
            }
            push_line(&mut parsed, &mut preamble, &mut summary, current, rest);
            continue;
        }
        push_line(&mut parsed, &mut preamble, &mut summary, current, line);
    }

    if !saw_label {
        return Err(SectionParseError::Unlabelled);
    }
    if !saw_summary {
        return Err(SectionParseError::NoSummary);
    }
    parsed.preamble = preamble.join("\n").trim().to_string();
    parsed.summary = summary.join("\n").trim().to_string();
    if parsed.summary.is_empty() {
        return Err(SectionParseError::EmptySummary);
    }
    Ok(parsed)
}

fn push_line<'a>(
    parsed: &mut ParsedSections,
    preamble: &mut Vec<&'a str>,
    summary: &mut Vec<&'a str>,
    section: Section,
    line: &'a str,
) {
    match section {
        Section::Preamble => preamble.push(line),
        Section::Summary => summary.push(line),
        Section::KeyPoints => push_entry(&mut parsed.key_points, strip_bullet(line)),
        Section::Examples => push_entry(&mut parsed.examples, strip_bullet(line)),
        Section::Quotes => push_entry(&mut parsed.quotes, strip_quotes(strip_bullet(line))),
    }
}

fn push_entry(entries: &mut Vec<String>, entry: &str) {
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
}

/// Recognises `LABEL:` lines, tolerating Markdown emphasis or heading marks.
fn label_of(line: &str) -> Option<(Section, &str)> {
    let bare = line.trim_start_matches(['#', '*', ' ']);
    let colon = bare.find(':')?;
    let name = bare[..colon].trim_end_matches(['*', ' ']).to_uppercase();
    let (_, section) = LABELS.iter().find(|(label, _)| *label == name)?;
    let rest = bare[colon + 1..].trim_start_matches(['*', ' ']).trim();
    Some((*section, rest))
}

fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("• "))
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| trimmed.strip_prefix('•'))
        .unwrap_or(trimmed)
        .trim()
}

fn strip_quotes(line: &str) -> &str {
    line.trim_matches(|c| matches!(c, '"' | '“' | '”' | '\''))
        .trim()
}
