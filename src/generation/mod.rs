//! Streamed chapter generation
//!
//! Turns an outline into article chapters with a language model, optionally
//! grounded on web search and private document retrieval. The pipeline is:
//!
//! 1. `keywords` - ask the model for search keywords for the chapter
//! 2. `retrieval` - look up passages in the session's private documents
//! 3. `search` - query the web for each keyword, unless private content suffices
//! 4. `prompt` - build the chapter prompt from topic, outline and sources
//! 5. `model` - generate the chapter text
//! 6. `references` - renumber citations and collect the cited sources
//!
//! Each step runs under its own deadline (see [`deadline`]). Results are
//! persisted through [`GenerationJobTracker`](crate::storage::GenerationJobTracker)
//! as they are produced.

pub mod collaborators;
pub mod deadline;
pub mod outline;
pub mod references;
pub mod worker;

pub use collaborators::{
    ChapterContext, DefaultPromptAssembler, LanguageModel, PrivateRetrieval, PromptAssembler,
    RetrievedPassage, SearchClient, SearchResult,
};
pub use deadline::{run_step, GenerationStep, StepDeadlines};
pub use outline::{split_chapters, ChapterRequest};
pub use worker::{ChapterOutput, ChapterWorker, Collaborators, GenerationRequest, StreamEvent};
