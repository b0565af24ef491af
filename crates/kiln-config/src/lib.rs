//! Shared configuration for the kiln host.
//!
//! [`Config`] is layered by `ortho_config`: built-in defaults, then a TOML
//! file named with `--config-path`, then `KILN_*` environment variables,
//! then command-line flags. The plugin subsystem never reads it directly;
//! the daemon maps it onto the plugin crate's own settings types.

mod defaults;
mod logging;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_BIN_DIR, DEFAULT_BUILD_SCRIPT_DIR, DEFAULT_BUILD_SCRIPT_FILE,
    DEFAULT_BUILD_TIMEOUT_MINUTES, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_ENTRY_SOURCE,
    DEFAULT_LOG_FILTER, DEFAULT_MANIFEST_FILE, DEFAULT_PLUGINS_DIR, DEFAULT_START_TIMEOUT_MS,
    default_log_filter, default_log_filter_string, default_log_format, default_plugins_dir,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "KILN")]
pub struct Config {
    /// Root scanned by discovery and auto-start.
    #[ortho_config(default = defaults::default_plugins_dir())]
    plugins_dir: Utf8PathBuf,
    /// Manifest file name inside each plugin directory.
    #[ortho_config(default = DEFAULT_MANIFEST_FILE.to_owned())]
    manifest_file: String,
    /// Binary directory used when a manifest leaves `binary` empty.
    #[ortho_config(default = DEFAULT_BIN_DIR.to_owned())]
    bin_dir: String,
    /// Entry source marking a plugin as buildable.
    #[ortho_config(default = DEFAULT_ENTRY_SOURCE.to_owned())]
    entry_source: String,
    /// Directory holding an optional custom build script.
    #[ortho_config(default = DEFAULT_BUILD_SCRIPT_DIR.to_owned())]
    build_script_dir: String,
    /// Custom build script file name.
    #[ortho_config(default = DEFAULT_BUILD_SCRIPT_FILE.to_owned())]
    build_script_file: String,
    /// Bound on each build step, in minutes.
    #[ortho_config(default = DEFAULT_BUILD_TIMEOUT_MINUTES)]
    build_timeout_minutes: u64,
    /// Handshake bound for manifests that set none, in milliseconds.
    #[ortho_config(default = DEFAULT_START_TIMEOUT_MS)]
    start_timeout_ms: u64,
    /// RPC bound for callers that set none, in milliseconds.
    #[ortho_config(default = DEFAULT_CALL_TIMEOUT_MS)]
    call_timeout_ms: u64,
    /// Disables auto-start at daemon boot.
    #[ortho_config(default = false)]
    skip_auto_start: bool,
    /// `EnvFilter` expression for the daemon's subscriber.
    #[ortho_config(default = defaults::default_log_filter_string())]
    log_filter: String,
    /// Output format for the daemon's subscriber.
    #[ortho_config(default = defaults::default_log_format())]
    log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_owned(),
            bin_dir: DEFAULT_BIN_DIR.to_owned(),
            entry_source: DEFAULT_ENTRY_SOURCE.to_owned(),
            build_script_dir: DEFAULT_BUILD_SCRIPT_DIR.to_owned(),
            build_script_file: DEFAULT_BUILD_SCRIPT_FILE.to_owned(),
            build_timeout_minutes: DEFAULT_BUILD_TIMEOUT_MINUTES,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            skip_auto_start: false,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

/// A loaded configuration the host cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A duration that must be positive was set to zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Offending field.
        field: &'static str,
    },
    /// A name that must be non-empty was blank.
    #[error("{field} must not be empty")]
    Empty {
        /// Offending field.
        field: &'static str,
    },
}

impl Config {
    /// Root scanned by discovery and auto-start.
    #[must_use]
    pub fn plugins_dir(&self) -> &Utf8Path {
        &self.plugins_dir
    }

    /// Manifest file name inside each plugin directory.
    #[must_use]
    pub fn manifest_file(&self) -> &str {
        &self.manifest_file
    }

    /// Binary directory used when a manifest leaves `binary` empty.
    #[must_use]
    pub fn bin_dir(&self) -> &str {
        &self.bin_dir
    }

    /// Entry source marking a plugin as buildable.
    #[must_use]
    pub fn entry_source(&self) -> &str {
        &self.entry_source
    }

    /// Directory holding an optional custom build script.
    #[must_use]
    pub fn build_script_dir(&self) -> &str {
        &self.build_script_dir
    }

    /// Custom build script file name.
    #[must_use]
    pub fn build_script_file(&self) -> &str {
        &self.build_script_file
    }

    /// Bound on each build step.
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_minutes.saturating_mul(60))
    }

    /// Handshake bound for manifests that set none.
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// RPC bound for callers that set none.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Whether the daemon skips auto-start at boot.
    #[must_use]
    pub const fn skip_auto_start(&self) -> bool {
        self.skip_auto_start
    }

    /// `EnvFilter` expression for the daemon's subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Output format for the daemon's subscriber.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Overrides the plugins directory.
    #[must_use]
    pub fn with_plugins_dir(mut self, plugins_dir: impl Into<Utf8PathBuf>) -> Self {
        self.plugins_dir = plugins_dir.into();
        self
    }

    /// Overrides the auto-start flag.
    #[must_use]
    pub const fn with_skip_auto_start(mut self, skip: bool) -> Self {
        self.skip_auto_start = skip;
        self
    }

    /// Rejects values the plugin subsystem cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first zero timeout or blank name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("build_timeout_minutes", self.build_timeout_minutes),
            ("start_timeout_ms", self.start_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ];
        if let Some(&(field, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration { field });
        }
        let names = [
            ("plugins_dir", self.plugins_dir.as_str()),
            ("manifest_file", self.manifest_file.as_str()),
            ("bin_dir", self.bin_dir.as_str()),
            ("entry_source", self.entry_source.as_str()),
        ];
        if let Some(&(field, _)) = names.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::Empty { field });
        }
        Ok(())
    }
}
