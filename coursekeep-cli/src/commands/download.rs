//! `download`: fetch a course for offline use with a live progress bar.
//!
//! The command keeps the connectivity monitor running, so a dropped
//! connection pauses the transfer and a restored one resumes it.

use std::time::Duration;

use console::style;
use coursekeep::config::format_size;
use coursekeep::download::{
    DownloadEvent, DownloadJob, DownloadOptions, DownloadStatus, JobId, ProgressUpdate,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CliError;
use crate::runner::{cancel_on_ctrlc, CliRunner};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:<24} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}";

/// Arguments for `download`.
#[derive(Debug, Clone)]
pub struct DownloadArgs {
    pub course_id: String,
    pub package: bool,
    pub timeout_secs: Option<u64>,
}

/// How the wait for a job ended.
#[derive(Debug, PartialEq, Eq)]
enum Finish {
    Done(DownloadStatus),
    Interrupted,
}

pub fn run(runner: &CliRunner, args: DownloadArgs) -> Result<(), CliError> {
    let monitor = runner.monitor()?;
    let online = runner.block_on(monitor.check_connection());
    runner.start_monitoring(&monitor, runner.check_interval())?;
    let manager = runner.download_manager(&monitor)?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrlc(shutdown.clone())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = manager.subscribe(move |event: &DownloadEvent| {
        let _ = tx.send(event.clone());
    });

    let mut options = DownloadOptions::default().with_package(args.package);
    if let Some(secs) = args.timeout_secs {
        options = options.with_operation_timeout(Duration::from_secs(secs));
    }
    let id = manager.download_course(&args.course_id, options)?;

    println!("Downloading {} (job {})", style(&args.course_id).bold(), id);
    if !online {
        println!(
            "{}",
            style("Offline: the download will start when the connection returns.").yellow()
        );
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(BAR_TEMPLATE)
            .map_err(|e| CliError::Runtime(e.to_string()))?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(status_message(DownloadStatus::Queued));

    let finish = runner.block_on(async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Finish::Interrupted,
                event = rx.recv() => {
                    let Some(event) = event else {
                        break Finish::Interrupted;
                    };
                    if event.job_id() != id {
                        continue;
                    }
                    if let Some(status) = apply_event(&bar, &event) {
                        break Finish::Done(status);
                    }
                }
            }
        }
    });

    manager.unsubscribe(listener);
    if finish == Finish::Interrupted {
        manager.cancel_download(id)?;
    }
    let job = manager.get_download_status(id)?;
    manager.shutdown();
    monitor.stop_monitoring();

    report(&bar, id, &job)
}

/// Update the bar. Returns the terminal status once the job has one.
fn apply_event(bar: &ProgressBar, event: &DownloadEvent) -> Option<DownloadStatus> {
    match event {
        DownloadEvent::Progress(update) => {
            apply_progress(bar, update);
            None
        }
        DownloadEvent::StatusChanged { to, .. } => {
            bar.set_message(status_message(*to));
            to.is_terminal().then_some(*to)
        }
        DownloadEvent::Completed { course, .. } => {
            bar.set_message(course.title.clone());
            Some(DownloadStatus::Completed)
        }
        DownloadEvent::Error { .. } => Some(DownloadStatus::Error),
        DownloadEvent::Queued { .. } | DownloadEvent::Started { .. } => None,
    }
}

fn apply_progress(bar: &ProgressBar, update: &ProgressUpdate) {
    if update.total_bytes > 0 {
        bar.set_length(update.total_bytes);
    }
    bar.set_position(update.downloaded_bytes);
    if let Some(file) = &update.current_file {
        bar.set_message(file.clone());
    }
}

fn status_message(status: DownloadStatus) -> String {
    match status {
        DownloadStatus::Queued => "waiting".to_string(),
        DownloadStatus::Paused => "paused (offline)".to_string(),
        other => other.to_string(),
    }
}

fn report(bar: &ProgressBar, id: JobId, job: &DownloadJob) -> Result<(), CliError> {
    match job.status {
        DownloadStatus::Completed => {
            bar.finish_with_message("done");
            println!();
            println!("{} {}", style("Completed").green().bold(), summary(job));
            if let Some(path) = &job.output_path {
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        DownloadStatus::Error => {
            bar.abandon_with_message("failed");
            let reason = job
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            if job.error.as_ref().is_some_and(|e| e.is_retryable()) {
                println!("The failure looks temporary; run the download again to retry.");
            }
            Err(CliError::DownloadFailed { id: id.0, reason })
        }
        status => {
            bar.abandon_with_message(status.to_string());
            println!("Download {} {}", id, status);
            Ok(())
        }
    }
}

fn summary(job: &DownloadJob) -> String {
    let title = job
        .course
        .as_ref()
        .map(|c| c.title.as_str())
        .unwrap_or(job.target_entity_id.as_str());
    format!(
        "{} ({} files, {})",
        title,
        job.files_completed,
        format_size(job.total_bytes)
    )
}
