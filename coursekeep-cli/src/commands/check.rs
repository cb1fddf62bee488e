//! `check`: run one connectivity check and show each probe's verdict.

use std::time::Duration;

use console::style;
use coursekeep::connectivity::{CheckReport, ProbeOutcome};

use crate::error::CliError;
use crate::runner::CliRunner;

pub fn run(runner: &CliRunner) -> Result<(), CliError> {
    let monitor = runner.monitor()?;
    let report = runner.block_on(monitor.check_connection_detailed());

    println!("Connectivity Check");
    println!("==================");
    println!();
    for outcome in &report.outcomes {
        println!("  {}", describe_outcome(outcome));
    }
    println!();
    println!("{}", verdict_line(&report, runner.config().connectivity.quorum));
    Ok(())
}

fn describe_outcome(outcome: &ProbeOutcome) -> String {
    let mark = if outcome.reachable {
        style("ok").green()
    } else {
        style("--").red()
    };
    let detail = match &outcome.failure {
        Some(failure) => format!(" ({})", failure),
        None => String::new(),
    };
    format!(
        "[{}] {:<6} {:>7}{}",
        mark,
        outcome.name,
        format_elapsed(outcome.elapsed),
        detail
    )
}

fn verdict_line(report: &CheckReport, quorum: usize) -> String {
    let verdict = if report.online {
        style("ONLINE").green().bold()
    } else {
        style("OFFLINE").red().bold()
    };
    format!(
        "{} ({} of {} probes reachable, {} needed)",
        verdict,
        report.reachable_count(),
        report.outcomes.len(),
        quorum
    )
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{}ms", elapsed.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_counts_reachable_probes() {
        let outcome = |name: &str, reachable| ProbeOutcome {
            name: name.to_string(),
            reachable,
            failure: None,
            elapsed: Duration::from_millis(12),
        };
        let report = CheckReport {
            outcomes: vec![outcome("route", true), outcome("http", false), outcome("dns", true)],
            online: true,
            changed: false,
        };
        let line = console::strip_ansi_codes(&verdict_line(&report, 2)).to_string();
        assert_eq!(line, "ONLINE (2 of 3 probes reachable, 2 needed)");

        let probe = console::strip_ansi_codes(&describe_outcome(&report.outcomes[1])).to_string();
        assert!(probe.contains("http"));
        assert!(probe.contains("12ms"));
    }
}
