//! Session, record and conversation commands

use super::{open_database, truncate};
use crate::config::Config;
use crate::error::{ChapterflowError, Result};
use crate::session::{SessionFacade, SessionKey};
use crate::storage::{SessionStatus, SessionStore, SCHEMA_VERSION};
use colored::Colorize;
use prettytable::{format, row, Table};

/// Create or upgrade the database
pub fn init(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let version = db.schema_version()?;
    println!(
        "{} {} (schema version {}/{})",
        "Database ready:".green(),
        db.path().display(),
        version,
        SCHEMA_VERSION
    );
    Ok(())
}

/// Print the most recently updated sessions
pub fn list_sessions(config: &Config, limit: usize) -> Result<()> {
    let sessions = SessionStore::new(open_database(config)?).list_sessions(limit)?;

    if sessions.is_empty() {
        println!("{}", "No sessions found.".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(row![
        "Key".bold(),
        "Status".bold(),
        "Records".bold(),
        "Max".bold(),
        "Current".bold(),
        "Last Updated".bold()
    ]);

    for session in sessions {
        let status = match session.status {
            SessionStatus::Active => session.status.as_str().green(),
            _ => session.status.as_str().dimmed(),
        };
        let current = session
            .current_record_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(row![
            truncate(&session.key, 40).cyan(),
            status,
            session.record_count,
            session.max_history,
            current,
            session.updated_at.format("%Y-%m-%d %H:%M")
        ]);
    }

    println!("\nSessions:");
    table.printstd();
    println!();
    Ok(())
}

/// Print the records summary of one session
pub fn show_records(config: &Config, session: &str, json: bool) -> Result<()> {
    let facade = SessionFacade::new(open_database(config)?, config);
    let summary = facade.records_summary(&SessionKey::new(session))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.is_empty() {
        println!("{}", format!("Session {} has no records.", session).yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(row![
        "Pos".bold(),
        "Id".bold(),
        "Topic".bold(),
        "Outline".bold(),
        "Chapters".bold(),
        "Updated".bold()
    ]);

    for record in &summary {
        let position = if record.is_current {
            format!("*{}", record.position).green()
        } else {
            record.position.to_string().normal()
        };
        table.add_row(row![
            position,
            record.id,
            record.topic_preview,
            truncate(&record.outline_preview.replace('\n', " "), 40),
            record.article_count,
            record.updated_at.format("%Y-%m-%d %H:%M")
        ]);
    }

    println!("\nRecords of {}:", session.cyan());
    table.printstd();
    println!("{}", "* marks the current record".dimmed());
    Ok(())
}

/// Print the conversation attached to the record at `position`
pub fn show_messages(config: &Config, session: &str, position: usize) -> Result<()> {
    let facade = SessionFacade::new(open_database(config)?, config);
    let messages = facade.messages(&SessionKey::new(session), position)?;

    if messages.is_empty() {
        println!("{}", "No messages for this record.".yellow());
        return Ok(());
    }

    for message in messages {
        println!(
            "{} {} {}",
            format!("#{}", message.message_order).dimmed(),
            message.role.as_str().bold(),
            message.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
        println!("{}\n", message.content);
    }
    Ok(())
}

/// Run both retention sweeps, falling back to the configured limits
pub fn sweep(config: &Config, max_sessions: Option<u32>, retention_days: Option<u32>) -> Result<()> {
    let max_sessions = max_sessions.unwrap_or(config.storage.max_sessions);
    let retention_days = retention_days.unwrap_or(config.generation.job_retention_days);
    if max_sessions == 0 || retention_days == 0 {
        return Err(ChapterflowError::Validation(
            "max sessions and retention days must be greater than 0".into(),
        )
        .into());
    }

    let facade = SessionFacade::new(open_database(config)?, config);
    let report = facade.sweep(max_sessions, retention_days)?;
    println!(
        "{}",
        format!(
            "Deleted {} session(s) and {} job(s)",
            report.sessions_deleted, report.jobs_deleted
        )
        .green()
    );
    Ok(())
}
