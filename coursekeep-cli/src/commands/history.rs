//! `history`: list finished downloads or forget one.

use console::style;
use coursekeep::config::format_size;
use coursekeep::download::{DownloadJob, DownloadStatus, JobId};

use crate::error::CliError;
use crate::runner::CliRunner;

pub fn run(runner: &CliRunner, remove: Option<u64>) -> Result<(), CliError> {
    let monitor = runner.monitor()?;
    let manager = runner.download_manager(&monitor)?;

    if let Some(id) = remove {
        manager.remove_from_history(JobId(id))?;
        println!("Removed download {} from history", id);
        return Ok(());
    }

    let mut jobs = manager.get_all_downloads();
    jobs.sort_by_key(|job| std::cmp::Reverse(job.id));

    println!("Download History");
    println!("================");
    println!();
    if jobs.is_empty() {
        println!("No downloads yet.");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", history_row(job));
    }
    println!();
    println!("{} job(s)", jobs.len());
    Ok(())
}

fn history_row(job: &DownloadJob) -> String {
    let status = match job.status {
        DownloadStatus::Completed => style(job.status.to_string()).green(),
        DownloadStatus::Error => style(job.status.to_string()).red(),
        _ => style(job.status.to_string()).yellow(),
    };
    let when = job
        .finished_at
        .unwrap_or(job.created_at)
        .format("%Y-%m-%d %H:%M");
    let mut row = format!(
        "{:>5}  {:<10}  {:<24}  {:>9}  {}",
        job.id,
        status,
        job.target_entity_id,
        format_size(job.total_bytes),
        when
    );
    if let Some(error) = &job.error {
        row.push_str(&format!("\n       {}", style(&error.message).dim()));
    }
    row
}
