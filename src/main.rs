//! Chapterflow - session, history and generation job store
//!
#![doc = "Chapterflow - session, history and generation job store"]
#![doc = "Main entry point for the Chapterflow administration CLI."]

use anyhow::Result;

use chapterflow::cli::{Cli, Commands};
use chapterflow::commands;
use chapterflow::config::Config;
use chapterflow::error::ChapterflowError;
use chapterflow::logging::init_logging;

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    init_logging(&config.logging)?;

    let outcome = match cli.command {
        Commands::Init => commands::sessions::init(&config),
        Commands::Sessions { limit } => commands::sessions::list_sessions(&config, limit),
        Commands::Records { session, json } => {
            commands::sessions::show_records(&config, &session, json)
        }
        Commands::Messages { session, position } => {
            commands::sessions::show_messages(&config, &session, position)
        }
        Commands::Jobs {
            session,
            status,
            limit,
        } => commands::jobs::list_jobs(&config, &session, status.as_deref(), limit),
        Commands::Job {
            id,
            by_chapter,
            json,
        } => commands::jobs::show_job(&config, &id, by_chapter, json),
        Commands::Sweep {
            max_sessions,
            retention_days,
        } => {
            tracing::info!("Running retention sweep");
            commands::sessions::sweep(&config, max_sessions, retention_days)
        }
    };

    // Fatal storage details stay in the log
    outcome.map_err(|e| match e.downcast_ref::<ChapterflowError>() {
        Some(inner) => anyhow::anyhow!(inner.public_message()),
        None => e,
    })
}
