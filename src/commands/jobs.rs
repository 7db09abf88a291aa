//! Generation job commands

use super::open_database;
use crate::config::Config;
use crate::error::{ChapterflowError, Result};
use crate::storage::{GenerationJobTracker, JobStatus};
use colored::Colorize;
use prettytable::{format, row, Table};

fn parse_status(status: &str) -> Result<JobStatus> {
    JobStatus::from_str_opt(&status.to_lowercase()).ok_or_else(|| {
        ChapterflowError::Validation(format!(
            "unknown job status '{}' (expected queued, running, succeeded, failed or canceled)",
            status
        ))
        .into()
    })
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    match status {
        JobStatus::Queued => status.as_str().normal(),
        JobStatus::Running => status.as_str().cyan(),
        JobStatus::Succeeded => status.as_str().green(),
        JobStatus::Failed => status.as_str().red(),
        JobStatus::Canceled => status.as_str().yellow(),
    }
}

/// Print the jobs of a session, newest first
pub fn list_jobs(
    config: &Config,
    session: &str,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let status = status.map(parse_status).transpose()?;
    let tracker = GenerationJobTracker::new(open_database(config)?);
    let jobs = tracker.get_session_jobs(session, status, limit)?;

    if jobs.is_empty() {
        println!("{}", format!("No jobs for session {}.", session).yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(row![
        "Job".bold(),
        "Status".bold(),
        "Record".bold(),
        "Topic".bold(),
        "Created".bold(),
        "Completed".bold()
    ]);

    for job in &jobs {
        table.add_row(row![
            job.id.cyan(),
            colored_status(job.status),
            job.record_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            job.topic.as_deref().unwrap_or("-"),
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.completed_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".into())
        ]);
    }

    let stats = tracker.get_job_statistics(session)?;
    println!("\nJobs of {}:", session.cyan());
    table.printstd();
    println!(
        "{} total, {} running, {} succeeded, {} failed, {} canceled",
        stats.total_jobs, stats.running, stats.succeeded, stats.failed, stats.canceled
    );
    Ok(())
}

/// Print the content a job produced
pub fn show_job(config: &Config, job_id: &str, by_chapter: bool, json: bool) -> Result<()> {
    let tracker = GenerationJobTracker::new(open_database(config)?);
    let job = tracker
        .get_job(job_id)?
        .ok_or_else(|| ChapterflowError::not_found("job", job_id))?;

    if json {
        let value = if by_chapter {
            serde_json::json!({
                "job": job,
                "chapters": tracker.get_job_content_by_chapter(job_id)?,
            })
        } else {
            serde_json::json!({
                "job": job,
                "content": tracker.get_job_content(job_id)?,
            })
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{} {} [{}]",
        "Job".bold(),
        job.id.cyan(),
        colored_status(job.status)
    );
    if !tracker.has_final_chunk(job_id)? {
        println!("{}", "(no final chunk yet)".dimmed());
    }
    println!();

    if by_chapter {
        for (chapter, content) in tracker.get_job_content_by_chapter(job_id)? {
            println!("{}", format!("--- chapter {} ---", chapter + 1).bold());
            println!("{}\n", content);
        }
    } else {
        println!("{}", tracker.get_job_content(job_id)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::assert_error_kind;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("Running").unwrap(), JobStatus::Running);
        assert_error_kind(parse_status("done"), ErrorKind::Validation);
    }
}
