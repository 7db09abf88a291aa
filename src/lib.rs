//! Chapterflow - session, history and generation job store
//!
//! This library keeps the state of an outline and article writing service:
//! per-client sessions, a bounded history of outline/article snapshots, the
//! conversation attached to each snapshot, and streamed generation jobs.
//! Any number of threads or processes may share one database file.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: SQLite-backed stores (sessions, records, messages, jobs, users)
//! - `session`: Position-addressed facade, session key resolution, caching and identity merging
//! - `generation`: Background chapter generation with per-step deadlines
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `logging`: `tracing` subscriber setup
//! - `cli` / `commands`: Administration command-line interface
//!
//! # Example
//!
//! ```no_run
//! use chapterflow::{Config, Database, SessionFacade, SessionKey};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let facade = SessionFacade::new(Database::from_config(&config.storage)?, &config);
//!     let key = SessionKey::new("u1");
//!     facade.open(&key)?;
//!     facade.create_record(&key)?;
//!     facade.update_outline(&key, 0, "# Intro\n# Method")?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod generation;
pub mod logging;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{ChapterflowError, ErrorKind, Result};
pub use generation::{ChapterWorker, Collaborators, GenerationRequest, StreamEvent};
pub use session::{ClientContext, SessionFacade, SessionKey};
pub use storage::{Database, GenerationJobTracker, MessageSequencer, RecordStore, SessionStore};

#[cfg(test)]
pub mod test_utils;
