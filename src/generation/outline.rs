//! Outline parsing for chapter generation

use regex::Regex;
use std::sync::OnceLock;

/// One heading of a Markdown outline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineHeading {
    /// Number of leading `#` characters
    pub level: usize,
    pub title: String,
}

/// A chapter to generate, derived from an outline heading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRequest {
    /// Zero-based chapter index, used as `chapter_index` on chunks
    pub index: usize,
    pub title: String,
    /// Whether deeper headings follow this one before the next sibling
    pub has_subsections: bool,
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(#+)\s*(.*?)\s*$").expect("valid heading regex"))
}

/// Every heading line of an outline, in document order
///
/// Leading whitespace is ignored. Headings without a title are skipped.
pub fn parse_headings(outline: &str) -> Vec<OutlineHeading> {
    outline
        .lines()
        .filter_map(|line| {
            let captures = heading_pattern().captures(line.trim())?;
            let title = captures.get(2)?.as_str();
            if title.is_empty() {
                return None;
            }
            Some(OutlineHeading {
                level: captures.get(1)?.as_str().len(),
                title: title.to_string(),
            })
        })
        .collect()
}

/// Chapters of an outline
///
/// Every heading becomes a chapter, numbered in document order.
///
/// # Examples
///
/// ```
/// use chapterflow::generation::outline::split_chapters;
///
/// let chapters = split_chapters("# Intro\n## Scope\n# Results");
/// let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
/// assert_eq!(titles, ["Intro", "Scope", "Results"]);
/// assert!(chapters[0].has_subsections);
/// assert!(!chapters[1].has_subsections);
/// ```
pub fn split_chapters(outline: &str) -> Vec<ChapterRequest> {
    let headings = parse_headings(outline);
    headings
        .iter()
        .enumerate()
        .map(|(index, heading)| ChapterRequest {
            index,
            title: heading.title.clone(),
            has_subsections: headings
                .get(index + 1)
                .map(|next| next.level > heading.level)
                .unwrap_or(false),
        })
        .collect()
}

/// Hash stored on a job to detect later outline edits
pub fn snapshot_hash(outline: &str) -> String {
    crate::storage::jobs::outline_hash(outline)
}
