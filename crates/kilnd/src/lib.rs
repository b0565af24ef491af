//! Host daemon for kiln plugins.
//!
//! `kilnd` loads [`kiln_config::Config`], installs structured logging,
//! builds a [`kiln_plugins::PluginRegistry`], starts auto-start plugins and
//! then waits for a termination signal before stopping every plugin.

pub mod bootstrap;
pub mod settings;
pub mod shutdown;
pub mod telemetry;

#[cfg(test)]
mod tests;

use std::io::{self, Write};
use std::process::ExitCode;

use tracing::error;

pub use self::bootstrap::{
    BootstrapError, ConfigLoader, Daemon, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use self::shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};

pub(crate) const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Runs the daemon with the system loader and signal listener.
#[must_use]
pub fn run() -> ExitCode {
    run_with(&SystemConfigLoader, &SystemShutdownSignal)
}

/// Runs the daemon with the supplied collaborators.
///
/// Failures before telemetry is installed go to stderr directly.
#[must_use]
pub fn run_with(loader: &dyn ConfigLoader, signal: &dyn ShutdownSignal) -> ExitCode {
    let daemon = match bootstrap_with(loader) {
        Ok(daemon) => daemon,
        Err(bootstrap_error) => {
            writeln!(io::stderr().lock(), "kilnd: {bootstrap_error}").ok();
            return ExitCode::FAILURE;
        }
    };
    match daemon.run(signal) {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(run_error) => {
            error!(target: DAEMON_TARGET, error = %run_error, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
