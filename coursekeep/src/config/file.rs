//! Typed view of the INI file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use tracing::debug;

use super::keys::ConfigKey;
use super::{config_file_path, data_dir, ConfigError};
use crate::connectivity::{MonitorConfig, DEFAULT_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT, DEFAULT_QUORUM};
use crate::download::{
    DownloadManagerConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_PROGRESS_INTERVAL,
};
use crate::persistence::DEFAULT_HISTORY_LIMIT;

/// Service root used when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// `[service]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub base_url: String,
}

/// `[connectivity]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySettings {
    pub check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub quorum: usize,
    pub reachability_addr: String,
}

/// `[downloads]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub directory: PathBuf,
    pub history_file: PathBuf,
    pub max_concurrent: usize,
    pub history_limit: usize,
    pub operation_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

/// `[sync]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub store_path: PathBuf,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    /// Rolling log files are written here when set.
    pub directory: Option<PathBuf>,
}

/// Contents of `config.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub service: ServiceSettings,
    pub connectivity: ConnectivitySettings,
    pub downloads: DownloadSettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let data = data_dir();
        let monitor = MonitorConfig::default();
        Self {
            service: ServiceSettings {
                base_url: DEFAULT_BASE_URL.to_string(),
            },
            connectivity: ConnectivitySettings {
                check_interval_secs: DEFAULT_CHECK_INTERVAL.as_secs(),
                probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
                quorum: DEFAULT_QUORUM,
                reachability_addr: monitor.route_target,
            },
            downloads: DownloadSettings {
                directory: data.join("downloads"),
                history_file: data.join("history.json"),
                max_concurrent: DEFAULT_MAX_CONCURRENT,
                history_limit: DEFAULT_HISTORY_LIMIT,
                operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT.as_secs(),
                progress_interval_ms: DEFAULT_PROGRESS_INTERVAL.as_millis() as u64,
            },
            sync: SyncSettings {
                store_path: data.join("local.json"),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                directory: None,
            },
        }
    }
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(config);
        }

        let ini = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(source) => ConfigError::Io {
                path: path.to_path_buf(),
                source,
            },
            ini::Error::Parse(e) => ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            },
        })?;

        for key in ConfigKey::all() {
            let value = ini
                .section(Some(key.section()))
                .and_then(|section| section.get(key.key_name()));
            if let Some(value) = value {
                key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Write to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Write to `path`, creating parent directories. Unset keys are left out.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            let value = key.get(self);
            if !value.is_empty() {
                ini.with_section(Some(key.section())).set(key.key_name(), value);
            }
        }
        ini.write_to_file(path).map_err(io_error)
    }
}

impl From<&ConfigFile> for MonitorConfig {
    fn from(config: &ConfigFile) -> Self {
        Self {
            check_interval: Duration::from_secs(config.connectivity.check_interval_secs),
            probe_timeout: Duration::from_secs(config.connectivity.probe_timeout_secs),
            quorum: config.connectivity.quorum,
            route_target: config.connectivity.reachability_addr.clone(),
        }
    }
}

impl From<&ConfigFile> for DownloadManagerConfig {
    fn from(config: &ConfigFile) -> Self {
        Self {
            max_concurrent: config.downloads.max_concurrent,
            history_limit: config.downloads.history_limit,
            operation_timeout: Duration::from_secs(config.downloads.operation_timeout_secs),
            progress_interval: Duration::from_millis(config.downloads.progress_interval_ms),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp.path().join("absent.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.connectivity.quorum, 2);
        assert_eq!(config.downloads.max_concurrent, 2);
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.service.base_url = "https://courses.example.com/api".to_string();
        config.downloads.max_concurrent = 4;
        config.logging.directory = Some(temp.path().join("logs"));
        config.save_to(&path).unwrap();

        let reloaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[connectivity]\nquorum = 3\n\n[logging]\nlevel = debug\n").unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.connectivity.quorum, 3);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.downloads, ConfigFile::default().downloads);
    }

    #[test]
    fn test_invalid_value_in_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[downloads]\nmax_concurrent = lots\n").unwrap();

        let err = ConfigFile::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "downloads.max_concurrent"));
    }

    #[test]
    fn test_typed_configs() {
        let mut config = ConfigFile::default();
        config.connectivity.probe_timeout_secs = 3;
        config.downloads.progress_interval_ms = 500;

        let monitor = MonitorConfig::from(&config);
        assert_eq!(monitor.probe_timeout, Duration::from_secs(3));
        assert_eq!(monitor.quorum, 2);

        let downloads = DownloadManagerConfig::from(&config);
        assert_eq!(downloads.progress_interval, Duration::from_millis(500));
        assert_eq!(downloads.operation_timeout, Duration::from_secs(300));
    }
}
