//! Addressable configuration keys for `config get` / `config set`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use reqwest::Url;

use super::file::ConfigFile;
use super::ConfigError;

/// Probes run by a monitor built with the default probe set.
const DEFAULT_PROBE_COUNT: usize = 3;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Every `section.key` in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ServiceBaseUrl,
    ConnectivityCheckIntervalSecs,
    ConnectivityProbeTimeoutSecs,
    ConnectivityQuorum,
    ConnectivityReachabilityAddr,
    DownloadsDirectory,
    DownloadsHistoryFile,
    DownloadsMaxConcurrent,
    DownloadsHistoryLimit,
    DownloadsOperationTimeoutSecs,
    DownloadsProgressIntervalMs,
    SyncStorePath,
    LoggingLevel,
    LoggingDirectory,
}

const ALL_KEYS: [ConfigKey; 14] = [
    ConfigKey::ServiceBaseUrl,
    ConfigKey::ConnectivityCheckIntervalSecs,
    ConfigKey::ConnectivityProbeTimeoutSecs,
    ConfigKey::ConnectivityQuorum,
    ConfigKey::ConnectivityReachabilityAddr,
    ConfigKey::DownloadsDirectory,
    ConfigKey::DownloadsHistoryFile,
    ConfigKey::DownloadsMaxConcurrent,
    ConfigKey::DownloadsHistoryLimit,
    ConfigKey::DownloadsOperationTimeoutSecs,
    ConfigKey::DownloadsProgressIntervalMs,
    ConfigKey::SyncStorePath,
    ConfigKey::LoggingLevel,
    ConfigKey::LoggingDirectory,
];

impl ConfigKey {
    /// All keys, grouped by section in file order.
    pub fn all() -> &'static [ConfigKey] {
        &ALL_KEYS
    }

    /// `section.key`
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceBaseUrl => "service.base_url",
            Self::ConnectivityCheckIntervalSecs => "connectivity.check_interval_secs",
            Self::ConnectivityProbeTimeoutSecs => "connectivity.probe_timeout_secs",
            Self::ConnectivityQuorum => "connectivity.quorum",
            Self::ConnectivityReachabilityAddr => "connectivity.reachability_addr",
            Self::DownloadsDirectory => "downloads.directory",
            Self::DownloadsHistoryFile => "downloads.history_file",
            Self::DownloadsMaxConcurrent => "downloads.max_concurrent",
            Self::DownloadsHistoryLimit => "downloads.history_limit",
            Self::DownloadsOperationTimeoutSecs => "downloads.operation_timeout_secs",
            Self::DownloadsProgressIntervalMs => "downloads.progress_interval_ms",
            Self::SyncStorePath => "sync.store_path",
            Self::LoggingLevel => "logging.level",
            Self::LoggingDirectory => "logging.directory",
        }
    }

    pub fn section(&self) -> &'static str {
        self.split().0
    }

    pub fn key_name(&self) -> &'static str {
        self.split().1
    }

    fn split(&self) -> (&'static str, &'static str) {
        let name = self.name();
        name.split_once('.').unwrap_or((name, ""))
    }

    /// Current value as text. Empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        match self {
            Self::ServiceBaseUrl => config.service.base_url.clone(),
            Self::ConnectivityCheckIntervalSecs => config.connectivity.check_interval_secs.to_string(),
            Self::ConnectivityProbeTimeoutSecs => config.connectivity.probe_timeout_secs.to_string(),
            Self::ConnectivityQuorum => config.connectivity.quorum.to_string(),
            Self::ConnectivityReachabilityAddr => config.connectivity.reachability_addr.clone(),
            Self::DownloadsDirectory => config.downloads.directory.display().to_string(),
            Self::DownloadsHistoryFile => config.downloads.history_file.display().to_string(),
            Self::DownloadsMaxConcurrent => config.downloads.max_concurrent.to_string(),
            Self::DownloadsHistoryLimit => config.downloads.history_limit.to_string(),
            Self::DownloadsOperationTimeoutSecs => config.downloads.operation_timeout_secs.to_string(),
            Self::DownloadsProgressIntervalMs => config.downloads.progress_interval_ms.to_string(),
            Self::SyncStorePath => config.sync.store_path.display().to_string(),
            Self::LoggingLevel => config.logging.level.clone(),
            Self::LoggingDirectory => config
                .logging
                .directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        }
    }

    /// Validate `value` and store it.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match self {
            Self::ServiceBaseUrl => {
                let url = Url::parse(value).map_err(|e| self.invalid(value, e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(self.invalid(value, "expected an http or https URL"));
                }
                config.service.base_url = value.to_string();
            }
            Self::ConnectivityCheckIntervalSecs => {
                config.connectivity.check_interval_secs = self.positive(value)?;
            }
            Self::ConnectivityProbeTimeoutSecs => {
                config.connectivity.probe_timeout_secs = self.positive(value)?;
            }
            Self::ConnectivityQuorum => {
                let quorum = self.positive(value)? as usize;
                if quorum > DEFAULT_PROBE_COUNT {
                    return Err(self.invalid(
                        value,
                        format!("at most {} probes can agree", DEFAULT_PROBE_COUNT),
                    ));
                }
                config.connectivity.quorum = quorum;
            }
            Self::ConnectivityReachabilityAddr => {
                value
                    .parse::<SocketAddr>()
                    .map_err(|e| self.invalid(value, e.to_string()))?;
                config.connectivity.reachability_addr = value.to_string();
            }
            Self::DownloadsDirectory => config.downloads.directory = self.path(value)?,
            Self::DownloadsHistoryFile => config.downloads.history_file = self.path(value)?,
            Self::DownloadsMaxConcurrent => {
                config.downloads.max_concurrent = self.positive(value)? as usize;
            }
            Self::DownloadsHistoryLimit => {
                config.downloads.history_limit = self.positive(value)? as usize;
            }
            Self::DownloadsOperationTimeoutSecs => {
                config.downloads.operation_timeout_secs = self.positive(value)?;
            }
            Self::DownloadsProgressIntervalMs => {
                config.downloads.progress_interval_ms = self.positive(value)?;
            }
            Self::SyncStorePath => config.sync.store_path = self.path(value)?,
            Self::LoggingLevel => {
                let level = value.to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(self.invalid(
                        value,
                        format!("expected one of {}", LOG_LEVELS.join(", ")),
                    ));
                }
                config.logging.level = level;
            }
            Self::LoggingDirectory => {
                config.logging.directory = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
        }
        Ok(())
    }

    fn invalid(&self, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name().to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn positive(&self, value: &str) -> Result<u64, ConfigError> {
        match value.parse::<u64>() {
            Ok(0) => Err(self.invalid(value, "must be greater than zero")),
            Ok(n) => Ok(n),
            Err(e) => Err(self.invalid(value, e.to_string())),
        }
    }

    fn path(&self, value: &str) -> Result<PathBuf, ConfigError> {
        if value.is_empty() {
            return Err(self.invalid(value, "path must not be empty"));
        }
        Ok(PathBuf::from(value))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ALL_KEYS
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_key_round_trips_its_name() {
        for key in ConfigKey::all() {
            assert_eq!(key.name().parse::<ConfigKey>().unwrap(), *key);
            assert_eq!(format!("{}.{}", key.section(), key.key_name()), key.name());
        }
        assert!(matches!(
            "downloads.colour".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_sections_are_contiguous() {
        let mut seen: Vec<&str> = Vec::new();
        for key in ConfigKey::all() {
            if seen.last() != Some(&key.section()) {
                assert!(!seen.contains(&key.section()), "{} split", key.section());
                seen.push(key.section());
            }
        }
        assert_eq!(seen, vec!["service", "connectivity", "downloads", "sync", "logging"]);
    }

    #[test]
    fn test_set_and_get() {
        let mut config = ConfigFile::default();
        ConfigKey::DownloadsMaxConcurrent.set(&mut config, " 5 ").unwrap();
        assert_eq!(ConfigKey::DownloadsMaxConcurrent.get(&config), "5");

        ConfigKey::LoggingLevel.set(&mut config, "DEBUG").unwrap();
        assert_eq!(config.logging.level, "debug");

        ConfigKey::LoggingDirectory.set(&mut config, "/var/log/ck").unwrap();
        assert_eq!(ConfigKey::LoggingDirectory.get(&config), "/var/log/ck");
        ConfigKey::LoggingDirectory.set(&mut config, "").unwrap();
        assert_eq!(ConfigKey::LoggingDirectory.get(&config), "");
    }

    #[test]
    fn test_validation() {
        let mut config = ConfigFile::default();
        let rejected = [
            (ConfigKey::ConnectivityQuorum, "0"),
            (ConfigKey::ConnectivityQuorum, "4"),
            (ConfigKey::ConnectivityCheckIntervalSecs, "-1"),
            (ConfigKey::DownloadsHistoryLimit, "0"),
            (ConfigKey::ServiceBaseUrl, "ftp://example.com"),
            (ConfigKey::ServiceBaseUrl, "not a url"),
            (ConfigKey::ConnectivityReachabilityAddr, "1.1.1.1"),
            (ConfigKey::LoggingLevel, "loud"),
            (ConfigKey::SyncStorePath, ""),
        ];
        for (key, value) in rejected {
            assert!(
                matches!(key.set(&mut config, value), Err(ConfigError::InvalidValue { .. })),
                "{} accepted {:?}",
                key,
                value
            );
        }
        assert_eq!(config, ConfigFile::default());
    }
}
