//! CLI error type.

use std::fmt;

use coursekeep::config::ConfigError;
use coursekeep::connectivity::ConnectivityError;
use coursekeep::download::DownloadError;
use coursekeep::logging::LoggingError;
use coursekeep::persistence::StoreError;
use coursekeep::sync::SyncError;

/// Everything a command can fail with.
#[derive(Debug)]
pub enum CliError {
    /// Bad or missing configuration, or a bad argument.
    Config(String),
    /// The async runtime or signal handling could not be set up.
    Runtime(String),
    /// The terminal prompt failed.
    Prompt(String),
    ConfigFile(ConfigError),
    Logging(LoggingError),
    Connectivity(ConnectivityError),
    Download(DownloadError),
    Store(StoreError),
    Sync(SyncError),
    /// A download ended in the error state.
    DownloadFailed { id: u64, reason: String },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            CliError::Prompt(msg) => write!(f, "Prompt failed: {}", msg),
            CliError::ConfigFile(e) => write!(f, "{}", e),
            CliError::Logging(e) => write!(f, "Failed to initialise logging: {}", e),
            CliError::Connectivity(e) => write!(f, "Connectivity error: {}", e),
            CliError::Download(e) => write!(f, "Download error: {}", e),
            CliError::Store(e) => write!(f, "Storage error: {}", e),
            CliError::Sync(e) => write!(f, "Sync error: {}", e),
            CliError::DownloadFailed { id, reason } => {
                write!(f, "Download {} failed: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Connectivity(e) => Some(e),
            CliError::Download(e) => Some(e),
            CliError::Store(e) => Some(e),
            CliError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<ConnectivityError> for CliError {
    fn from(e: ConnectivityError) -> Self {
        CliError::Connectivity(e)
    }
}

impl From<DownloadError> for CliError {
    fn from(e: DownloadError) -> Self {
        CliError::Download(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        CliError::Store(e)
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        CliError::Sync(e)
    }
}
