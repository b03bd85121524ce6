//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file; command-line flags override it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use esdfs::options::MountOptions;

fn esdfs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("esdfs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("esdfs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    esdfs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/esdfs.pid"),
        |rd| rd.join("esdfs.pid"),
    )
}

fn default_mount_point() -> PathBuf {
    esdfs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/esdfs/mnt"), |rd| rd.join("mnt"))
}

fn default_control_socket() -> PathBuf {
    esdfs_runtime_dir().map_or_else(
        || PathBuf::from("/tmp/esdfs/control.sock"),
        |rd| rd.join("control.sock"),
    )
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Where a daemonized process sends its log output. Discarded if not specified.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: None,
        }
    }
}

impl DaemonConfig {
    /// Open the configured log file for appending, creating it if needed.
    pub fn open_log_file(&self) -> std::io::Result<Option<std::fs::File>> {
        let Some(path) = &self.log_file else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The directory that backs the emulated card.
    #[serde(default)]
    pub lower_path: Option<PathBuf>,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Comma-separated mount options, as accepted by `mount -o`.
    #[serde(default)]
    pub mount_options: String,

    /// Unix socket that accepts package-list updates.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Let users other than the mounting user access the filesystem.
    #[serde(default)]
    pub allow_other: bool,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lower_path: None,
            mount_point: default_mount_point(),
            mount_options: String::new(),
            control_socket: default_control_socket(),
            allow_other: false,
            daemon: DaemonConfig::default(),
        }
    }
}

/// Values given on the command line, applied on top of the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub lower_path: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub mount_options: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match &self.lower_path {
            None => errors.push("No lower directory configured (set lower-path or --lower).".to_owned()),
            Some(path) if !path.is_dir() => errors.push(format!(
                "Lower path '{}' is not a directory.",
                path.display()
            )),
            Some(_) => {}
        }

        if let Err(e) = self.mount_options.parse::<MountOptions>() {
            errors.push(format!("Invalid mount options '{}': {e}", self.mount_options));
        }

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if self.control_socket.parent().is_none() {
            errors.push(format!(
                "Control socket path '{}' has no parent directory.",
                self.control_socket.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The configuration itself once [`Config::validate`] passes.
    pub fn validated(self) -> Result<Self, ConfigError> {
        match self.validate() {
            Ok(()) => {
                debug!("Configuration is valid.");
                Ok(self)
            }
            Err(validation_errors) => Err(ConfigError::ValidationErrors(validation_errors)),
        }
    }

    /// Parsed mount options. Only fails on a configuration that did not pass [`Config::validate`].
    pub fn parsed_mount_options(&self) -> Result<MountOptions, esdfs::options::MountOptionError> {
        self.mount_options.parse()
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(lower) = overrides.lower_path {
            self.lower_path = Some(lower);
        }
        if let Some(mount_point) = overrides.mount_point {
            self.mount_point = mount_point;
        }
        if let Some(opts) = overrides.mount_options {
            self.mount_options = opts;
        }
        self
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("esdfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("esdfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/esdfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, otherwise from the first config file
    /// found. Falls back to defaults when no file exists; a malformed file is an error.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_file() {
        let config: Config = toml::from_str(
            r#"
            lower-path = "/data/media"
            mount-point = "/mnt/runtime/default/emulated"
            mount-options = "derive=unified,confine"
            allow-other = true

            [daemon]
            pid-file = "/run/esdfs.pid"
            log-file = "/var/log/esdfs.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.lower_path, Some(PathBuf::from("/data/media")));
        assert!(config.allow_other);
        assert_eq!(config.daemon.log_file, Some(PathBuf::from("/var/log/esdfs.log")));
        let opts = config.parsed_mount_options().unwrap();
        assert!(opts.unified());
        assert!(opts.confined());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn validate_collects_every_error() {
        let config = Config {
            mount_options: "derive=sideways".to_owned(),
            ..Config::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors[0].contains("lower"));
        assert!(errors[1].contains("derive=sideways"));
    }

    #[test]
    fn validated_reports_every_message() {
        let config = Config {
            mount_options: "derive=sideways".to_owned(),
            ..Config::default()
        };
        match config.validated() {
            Err(ConfigError::ValidationErrors(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_existing_lower() {
        let lower = tempfile::tempdir().unwrap();
        let config = Config::default().with_overrides(Overrides {
            lower_path: Some(lower.path().to_path_buf()),
            ..Overrides::default()
        });
        assert!(config.validate().is_ok());
        assert!(config.validated().is_ok());
    }

    #[test]
    fn overrides_replace_file_values() {
        let config = Config {
            mount_options: "derive=legacy".to_owned(),
            ..Config::default()
        }
        .with_overrides(Overrides {
            mount_point: Some(PathBuf::from("/mnt/sdcard")),
            mount_options: Some("derive=multi".to_owned()),
            ..Overrides::default()
        });
        assert_eq!(config.mount_point, PathBuf::from("/mnt/sdcard"));
        assert_eq!(config.mount_options, "derive=multi");
    }
}
