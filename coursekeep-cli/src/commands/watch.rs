//! `watch`: keep checking connectivity and report each transition.

use std::time::Duration;

use console::style;
use coursekeep::connectivity::ConnectivityStatus;
use tokio_util::sync::CancellationToken;

use crate::error::CliError;
use crate::runner::{cancel_on_ctrlc, CliRunner};

pub fn run(runner: &CliRunner, interval_secs: Option<u64>) -> Result<(), CliError> {
    let interval = match interval_secs {
        Some(0) => return Err(CliError::Config("--interval must be positive".to_string())),
        Some(secs) => Duration::from_secs(secs),
        None => runner.check_interval(),
    };

    let monitor = runner.monitor()?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrlc(shutdown.clone())?;

    runner.block_on(monitor.check_connection());
    println!("{}", status_line(&monitor.status()));
    println!(
        "Watching every {}s, press Ctrl-C to stop.",
        interval.as_secs()
    );

    let reporter = std::sync::Arc::downgrade(&monitor);
    let listener = monitor.subscribe(move |_online: &bool| {
        if let Some(monitor) = reporter.upgrade() {
            println!("{}", status_line(&monitor.status()));
        }
    });

    runner.start_monitoring(&monitor, interval)?;
    runner.block_on(shutdown.cancelled());

    monitor.stop_monitoring();
    monitor.unsubscribe(listener);
    println!("Stopped watching.");
    Ok(())
}

fn status_line(status: &ConnectivityStatus) -> String {
    let at = status
        .last_checked_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    let state = if status.is_online {
        style("online").green().bold()
    } else {
        style("offline").red().bold()
    };
    format!("[{}] {}", at, state)
}
