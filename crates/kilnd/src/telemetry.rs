//! Structured telemetry initialisation for the daemon.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use kiln_config::{Config, LogFormat};
use kiln_plugins::PLUGIN_OUTPUT_TARGET;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Proof that the global subscriber is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter expression did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Another subscriber already owns the global default.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber on first use.
///
/// Later calls return a handle without touching global state, so the
/// filter and format of the first call win.
///
/// # Errors
///
/// Returns [`TelemetryError`] if the filter is invalid or a foreign
/// subscriber is already installed.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

/// Extends the configured filter so plugin output stays visible.
///
/// Plugin stdout and stderr are logged at info under
/// [`PLUGIN_OUTPUT_TARGET`]. Unless the configured filter names that target
/// itself, an `info` directive for it is appended, so a quiet host level
/// such as `warn` does not swallow what plugins print. Writing
/// `kiln_plugins::output=off` silences it.
pub(crate) fn filter_directives(configured: &str) -> String {
    if configured.contains(PLUGIN_OUTPUT_TARGET) {
        return configured.to_owned();
    }
    let base = configured.trim().trim_end_matches(',');
    if base.is_empty() {
        format!("{PLUGIN_OUTPUT_TARGET}=info")
    } else {
        format!("{base},{PLUGIN_OUTPUT_TARGET}=info")
    }
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(filter_directives(config.log_filter()))
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = |env_filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
