//! Built-in configuration values.

use camino::Utf8PathBuf;

use crate::LogFormat;

/// Directory scanned for plugins, relative to the working directory.
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";
/// Manifest file inside each plugin directory.
pub const DEFAULT_MANIFEST_FILE: &str = "plugin.json";
/// Binary directory used when a manifest leaves `binary` empty.
pub const DEFAULT_BIN_DIR: &str = "bin";
/// Entry source whose presence makes a plugin buildable.
pub const DEFAULT_ENTRY_SOURCE: &str = "src/main.rs";
/// Directory holding a plugin's custom build script.
pub const DEFAULT_BUILD_SCRIPT_DIR: &str = "scripts";
/// Custom build script file name.
pub const DEFAULT_BUILD_SCRIPT_FILE: &str = "build.sh";
/// Upper bound on each build step, in minutes.
pub const DEFAULT_BUILD_TIMEOUT_MINUTES: u64 = 5;
/// Handshake bound applied when a manifest sets none, in milliseconds.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 60_000;
/// RPC bound applied when a caller supplies none, in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
/// Filter expression used when none is configured.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Returns the default plugins directory.
#[must_use]
pub fn default_plugins_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_PLUGINS_DIR)
}

/// Returns the default log filter.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Returns the default log filter as an owned string.
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Returns the default log format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}
