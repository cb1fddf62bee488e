//! CourseKeep CLI
//!
//! Download courses for offline study, watch connectivity and reconcile
//! progress with the server once back online.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::download::DownloadArgs;
use commands::sync::Prefer;
use error::CliError;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "coursekeep", version, about = "Offline course downloads and progress sync")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check connectivity once and show each probe
    Check,

    /// Keep checking connectivity and print every change
    Watch {
        /// Seconds between checks (defaults to connectivity.check_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Download a course for offline use
    Download {
        /// Course id on the service
        course_id: String,

        /// Bundle the downloaded files into compressed archives
        #[arg(long)]
        package: bool,

        /// Abort when no progress is made for this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show finished downloads
    History {
        /// Forget the download with this id and delete its files
        #[arg(long, value_name = "ID")]
        remove: Option<u64>,
    },

    /// Push offline progress and resolve conflicts
    Sync {
        /// Resolve every conflict this way instead of asking
        #[arg(long, value_enum)]
        prefer: Option<Prefer>,
    },

    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let verbose = cli.verbose;
    match cli.command {
        // Config commands must work even when the file is broken.
        Commands::Config { command } => commands::config::run(command),
        Commands::Check => commands::check::run(&start(verbose, "check")?),
        Commands::Watch { interval } => commands::watch::run(&start(verbose, "watch")?, interval),
        Commands::Download {
            course_id,
            package,
            timeout,
        } => commands::download::run(
            &start(verbose, "download")?,
            DownloadArgs {
                course_id,
                package,
                timeout_secs: timeout,
            },
        ),
        Commands::History { remove } => commands::history::run(&start(verbose, "history")?, remove),
        Commands::Sync { prefer } => commands::sync::run(&start(verbose, "sync")?, prefer),
    }
}

fn start(verbose: bool, command: &str) -> Result<CliRunner, CliError> {
    let runner = CliRunner::new(verbose)?;
    runner.log_startup(command);
    Ok(runner)
}
