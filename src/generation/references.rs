//! Numbered source lists and citation renumbering

use super::collaborators::SearchResult;
use crate::storage::{ChapterReferences, Reference};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("valid citation regex"))
}

/// Render sources as `[n]` blocks numbered from 1
pub fn format_sources(sources: &[SearchResult]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(idx, source)| {
            let snippets = source
                .snippets
                .iter()
                .map(|snippet| format!("- {}", snippet))
                .collect::<Vec<_>>()
                .join("\n");
            format!("[{}]{}", idx + 1, snippets)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renumber the citations in `content` and collect the cited sources
///
/// Sources that are cited keep their relative order and are renumbered
/// densely from 1. Citations that point past the end of `sources` are left
/// untouched and produce no reference entry.
///
/// # Examples
///
/// ```
/// use chapterflow::generation::{references::process_references, SearchResult};
///
/// let sources = vec![
///     SearchResult { url: "a".into(), title: "A".into(), snippets: vec!["first".into()] },
///     SearchResult { url: "b".into(), title: "B".into(), snippets: vec!["second".into()] },
/// ];
/// let (text, refs) = process_references("Only B [2].", &sources);
/// assert_eq!(text, "Only B [1].");
/// assert_eq!(refs["1"].url, "b");
/// ```
pub fn process_references(content: &str, sources: &[SearchResult]) -> (String, ChapterReferences) {
    if sources.is_empty() {
        return (content.to_string(), ChapterReferences::new());
    }

    let cited: BTreeSet<usize> = citation_pattern()
        .captures_iter(content)
        .filter_map(|caps| caps[1].parse().ok())
        .filter(|n| (1..=sources.len()).contains(n))
        .collect();

    let renumbered: BTreeMap<usize, usize> = cited
        .iter()
        .enumerate()
        .map(|(idx, old)| (*old, idx + 1))
        .collect();

    let text = citation_pattern()
        .replace_all(content, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|old| renumbered.get(&old))
                .map(|new| format!("[{}]", new))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();

    let references = renumbered
        .iter()
        .map(|(old, new)| {
            let source = &sources[old - 1];
            (
                new.to_string(),
                Reference {
                    content: source.snippets.first().cloned().unwrap_or_default(),
                    title: source.title.clone(),
                    url: source.url.clone(),
                },
            )
        })
        .collect();

    (text, references)
}
