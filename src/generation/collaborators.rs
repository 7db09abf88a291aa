//! Interfaces to the services chapter generation depends on
//!
//! The language model, web search and private document retrieval live
//! outside this crate. Implementations are handed to the
//! [`ChapterWorker`](super::worker::ChapterWorker) as trait objects, which
//! keeps the pipeline testable with in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Maximum number of keywords taken from a keyword response
pub const MAX_KEYWORDS: usize = 3;

/// A web search hit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippets: Vec<String>,
}

/// A passage returned by private document retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub content: String,
    /// Document the passage came from
    pub source: String,
}

impl From<RetrievedPassage> for SearchResult {
    fn from(passage: RetrievedPassage) -> Self {
        Self {
            url: passage.source.clone(),
            title: passage.source,
            snippets: vec![passage.content],
        }
    }
}

/// Text generation backend
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use chapterflow::generation::LanguageModel;
///
/// struct Echo;
///
/// #[async_trait]
/// impl LanguageModel for Echo {
///     async fn generate(&self, prompt: &str) -> chapterflow::Result<String> {
///         Ok(prompt.to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Web search backend
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn query(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// Retrieval over documents uploaded to a session
#[async_trait]
pub trait PrivateRetrieval: Send + Sync {
    /// Up to `top_k` passages relevant to `query` from the session's documents
    async fn relevant(
        &self,
        query: &str,
        session_key: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>>;
}

/// Everything the chapter prompt is built from
#[derive(Debug, Clone)]
pub struct ChapterContext<'a> {
    pub topic: &'a str,
    pub outline: &'a str,
    pub chapter_title: &'a str,
    pub chapter_index: usize,
    pub has_subsections: bool,
    /// Numbered sources as produced by [`format_sources`](super::references::format_sources)
    pub sources: &'a str,
}

/// Builds prompts and interprets keyword responses
pub trait PromptAssembler: Send + Sync {
    /// Prompt asking the model for search keywords
    fn keyword_prompt(&self, topic: &str, chapter_title: &str) -> String;

    /// Keywords from a model response, or `None` when it cannot be parsed
    fn parse_keywords(&self, response: &str) -> Option<Vec<String>>;

    /// Prompt asking the model to write one chapter
    fn chapter_prompt(&self, context: &ChapterContext<'_>) -> String;
}

/// Prompt wording used when no other assembler is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPromptAssembler;

impl PromptAssembler for DefaultPromptAssembler {
    fn keyword_prompt(&self, topic: &str, chapter_title: &str) -> String {
        format!(
            "I am writing the \"{}\" section of an article on '{}'. \
             Suggest search keywords that capture this section and work well with a search engine. \
             Answer in the form <begin>[keyword1, keyword2, keyword3]<end> with at most {} keywords.",
            chapter_title, topic, MAX_KEYWORDS
        )
    }

    fn parse_keywords(&self, response: &str) -> Option<Vec<String>> {
        let (_, rest) = response.split_once("<begin>")?;
        let (body, _) = rest.split_once("<end>")?;
        let keywords: Vec<String> = body
            .split(',')
            .map(|k| {
                k.trim()
                    .trim_matches(|c| matches!(c, '[' | ']' | '"' | '\''))
                    .trim()
                    .to_string()
            })
            .filter(|k| !k.is_empty())
            .take(MAX_KEYWORDS)
            .collect();
        (!keywords.is_empty()).then_some(keywords)
    }

    fn chapter_prompt(&self, context: &ChapterContext<'_>) -> String {
        let number = context.chapter_index + 1;
        let mut prompt = format!(
            "Write chapter {}: \"{}\" of an article.\n\nTopic:\n{}\n\nOutline:\n{}\n",
            number, context.chapter_title, context.topic, context.outline
        );

        let has_sources = !context.sources.trim().is_empty();
        if has_sources {
            prompt.push_str(&format!("\nSearch Results:\n{}\n", context.sources));
        }

        prompt.push_str("\nRequirements:\n");
        if context.has_subsections {
            prompt.push_str(&format!(
                "- Write only an overview of \"{}\"; do not expand its subsections\n\
                 - Aim for 400-800 words\n",
                context.chapter_title
            ));
        } else {
            prompt.push_str("- Cover the chapter in depth\n- Aim for 800-1500 words\n");
        }
        prompt.push_str("- Keep the language fluent and professional\n");
        if has_sources {
            prompt.push_str(
                "- Cite the search results with [n], where n is the result number\n\
                 - Do not add a reference list at the end\n",
            );
        }
        prompt.push_str(&format!("\nChapter {}:", number));
        prompt
    }
}
