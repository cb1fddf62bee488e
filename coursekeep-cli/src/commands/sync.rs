//! `sync`: push offline progress and settle conflicts interactively.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use console::style;
use coursekeep::sync::{
    ConflictError, ConflictRecord, ConflictResolutionCoordinator, ProgressData, Side, SyncOutcome,
    SyncReport,
};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Select;
use tracing::warn;

use crate::error::CliError;
use crate::runner::CliRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Side to keep for every conflict without asking.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Prefer {
    /// Keep the progress recorded on this device
    Local,
    /// Keep the progress stored on the server
    Server,
}

impl From<Prefer> for Side {
    fn from(prefer: Prefer) -> Self {
        match prefer {
            Prefer::Local => Side::Local,
            Prefer::Server => Side::Server,
        }
    }
}

pub fn run(runner: &CliRunner, prefer: Option<Prefer>) -> Result<(), CliError> {
    let monitor = runner.monitor()?;
    runner.block_on(monitor.check_connection());
    let orchestrator = runner.sync_orchestrator(&monitor)?;
    let coordinator = Arc::clone(orchestrator.coordinator());

    let (opened_tx, opened_rx) = mpsc::channel();
    let listener = coordinator.subscribe(move |opened| {
        let _ = opened_tx.send(opened.session_id);
    });

    let pass = runner.spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.sync_once().await }
    });

    // Prompts run here, off the runtime, while the pass waits on the session.
    while !pass.is_finished() {
        match opened_rx.recv_timeout(POLL_INTERVAL) {
            Ok(_) => {
                if let Err(e) = settle(&coordinator, prefer) {
                    let _ = coordinator.cancel();
                    coordinator.unsubscribe(listener);
                    return Err(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    coordinator.unsubscribe(listener);

    let report = runner
        .block_on(pass)
        .map_err(|e| CliError::Runtime(e.to_string()))??;
    println!("{}", describe_report(&report));
    Ok(())
}

/// Decide the open session, either from `prefer` or by asking.
fn settle(
    coordinator: &ConflictResolutionCoordinator,
    prefer: Option<Prefer>,
) -> Result<(), CliError> {
    let Some(session) = coordinator.pending_conflicts() else {
        return Ok(());
    };
    let conflicts: Vec<ConflictRecord> = session.conflicts.into_iter().map(|(c, _)| c).collect();

    println!();
    println!(
        "{} {} item(s) changed both here and on the server.",
        style("Conflict:").yellow().bold(),
        conflicts.len()
    );

    if let Some(prefer) = prefer {
        let side = Side::from(prefer);
        coordinator.resolve_all(side).map_err(conflict_error)?;
        println!("Keeping the {} version of everything.", side);
        coordinator.apply().map_err(conflict_error)?;
        return Ok(());
    }

    let theme = ColorfulTheme::default();
    let bulk = Select::with_theme(&theme)
        .with_prompt("How do you want to resolve them?")
        .items(&[
            "Choose for each item",
            "Keep all of mine",
            "Keep all from the server",
            "Cancel sync",
        ])
        .default(0)
        .interact_opt()
        .map_err(|e| CliError::Prompt(e.to_string()))?;

    match bulk {
        Some(0) => {
            for conflict in &conflicts {
                println!();
                println!("{}", describe_conflict(conflict));
                let choice = Select::with_theme(&theme)
                    .with_prompt(format!("Keep which version of {}?", conflict.entity_name))
                    .items(&["Server", "Mine"])
                    .default(0)
                    .interact_opt()
                    .map_err(|e| CliError::Prompt(e.to_string()))?;
                let side = match choice {
                    Some(1) => Side::Local,
                    Some(_) => Side::Server,
                    None => return cancel(coordinator),
                };
                coordinator
                    .select_version(&conflict.id, side)
                    .map_err(conflict_error)?;
            }
        }
        Some(1) => {
            coordinator.resolve_all(Side::Local).map_err(conflict_error)?;
        }
        Some(2) => {
            coordinator.resolve_all(Side::Server).map_err(conflict_error)?;
        }
        _ => return cancel(coordinator),
    }

    coordinator.apply().map_err(conflict_error)?;
    Ok(())
}

fn cancel(coordinator: &ConflictResolutionCoordinator) -> Result<(), CliError> {
    coordinator.cancel().map_err(conflict_error)?;
    println!("Sync cancelled; nothing was changed.");
    Ok(())
}

/// A session that vanished under the prompt was superseded; the pass reports it.
fn conflict_error(e: ConflictError) -> CliError {
    if e == ConflictError::NoPendingSession {
        warn!("Resolution session closed while prompting");
    }
    CliError::Sync(e.into())
}

fn describe_conflict(conflict: &ConflictRecord) -> String {
    format!(
        "{} ({})\n  mine:   {}  edited {}\n  server: {}  edited {}",
        style(&conflict.entity_name).bold(),
        conflict.id,
        describe_data(&conflict.local.data),
        conflict.local.updated_at.format("%Y-%m-%d %H:%M"),
        describe_data(&conflict.server.data),
        conflict.server.updated_at.format("%Y-%m-%d %H:%M"),
    )
}

fn describe_data(data: &ProgressData) -> String {
    let mut parts = Vec::new();
    if let Some(progress) = data.progress {
        parts.push(format!("{:.0}% done", progress));
    }
    if let Some(score) = data.score {
        parts.push(format!("score {:.0}", score));
    }
    if data.completed == Some(true) {
        parts.push("completed".to_string());
    }
    if parts.is_empty() {
        "no progress".to_string()
    } else {
        parts.join(", ")
    }
}

fn describe_report(report: &SyncReport) -> String {
    match report.outcome {
        SyncOutcome::Completed => format!(
            "{} pushed {}, pulled {}, {} conflict(s)",
            style("Synced:").green().bold(),
            report.pushed,
            report.pulled,
            report.conflicts
        ),
        SyncOutcome::Offline => format!(
            "{} changes stay on this device until the connection returns",
            style("Offline:").yellow().bold()
        ),
        SyncOutcome::NothingToSync => "Everything is already in sync.".to_string(),
        SyncOutcome::Skipped => format!(
            "{} conflicts were not resolved, local changes are kept for next time",
            style("Skipped:").yellow().bold()
        ),
    }
}
