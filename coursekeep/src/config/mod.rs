//! Configuration file handling.
//!
//! Settings live in an INI file at `<config dir>/coursekeep/config.ini`:
//!
//! ```ini
//! [service]
//! base_url = https://courses.example.com/api
//!
//! [connectivity]
//! check_interval_secs = 30
//! quorum = 2
//!
//! [downloads]
//! max_concurrent = 2
//! ```
//!
//! Missing keys take their defaults. Library services never read the file;
//! they take typed configs built from a [`ConfigFile`] via `From`.

mod file;
mod keys;

use std::path::PathBuf;

use thiserror::Error;

pub use file::{
    ConfigFile, ConnectivitySettings, DownloadSettings, LoggingSettings, ServiceSettings,
    SyncSettings, DEFAULT_BASE_URL,
};
pub use keys::ConfigKey;

/// Application directory name under the platform config and data dirs.
pub const APP_DIR: &str = "coursekeep";

/// Errors from loading, saving or editing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid INI.
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// No such `section.key`.
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    /// The value does not fit the key.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.ini")
}

/// Directory for application data: packages, stores, logs.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Human-readable byte count, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
