//! Command-line interface definition for Chapterflow
//!
//! This module defines the CLI structure using clap's derive API. The binary
//! is an administration tool over the session and job database.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chapterflow - session, history and generation job store
///
/// Inspect sessions, history records, conversations and generation jobs,
/// and run the retention sweeps.
#[derive(Parser, Debug, Clone)]
#[command(name = "chapterflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Database file (overrides config and CHAPTERFLOW_DB)
    #[arg(long = "db", env = "CHAPTERFLOW_DB")]
    pub db_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: None,
            db_path: None,
            verbose: false,
            command: Commands::Init,
        }
    }
}

/// Available commands for Chapterflow
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create the database or upgrade its schema
    Init,

    /// List sessions, most recently updated first
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the history records of a session
    Records {
        /// Session key
        #[arg(short, long)]
        session: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the conversation attached to one record
    Messages {
        /// Session key
        #[arg(short, long)]
        session: String,

        /// Zero-based record position within the session
        #[arg(short, long)]
        position: usize,
    },

    /// List the generation jobs of a session
    Jobs {
        /// Session key
        #[arg(short, long)]
        session: String,

        /// Only show jobs in this status (queued, running, succeeded, failed, canceled)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the content generated by a job
    Job {
        /// Job identifier
        #[arg(long)]
        id: String,

        /// Print each chapter separately
        #[arg(long)]
        by_chapter: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete old sessions and finished jobs
    Sweep {
        /// Sessions to keep (defaults to storage.max_sessions)
        #[arg(long)]
        max_sessions: Option<u32>,

        /// Days to keep finished jobs (defaults to generation.job_retention_days)
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_sessions_default_limit() {
        let cli = Cli::try_parse_from(["chapterflow", "sessions"]).unwrap();
        assert_eq!(cli.command, Commands::Sessions { limit: 20 });
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parse_global_options() {
        let cli = Cli::try_parse_from([
            "chapterflow",
            "--db",
            "/tmp/x.db",
            "-v",
            "records",
            "--session",
            "u1",
        ])
        .unwrap();
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
        assert!(cli.verbose);
        assert_eq!(
            cli.command,
            Commands::Records {
                session: "u1".into(),
                json: false
            }
        );
    }

    #[test]
    fn test_cli_parse_job() {
        let cli = Cli::try_parse_from(["chapterflow", "job", "--id", "abc", "--by-chapter"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Job {
                id: "abc".into(),
                by_chapter: true,
                json: false
            }
        );
    }

    #[test]
    fn test_cli_parse_sweep() {
        let cli = Cli::try_parse_from([
            "chapterflow",
            "sweep",
            "--max-sessions",
            "10",
            "--retention-days",
            "3",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Sweep {
                max_sessions: Some(10),
                retention_days: Some(3)
            }
        );
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["chapterflow"]).is_err());
    }
}
