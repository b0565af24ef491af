//! Daemon bootstrap and lifecycle.

use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::{info, warn};

use kiln_config::{Config, ConfigError};
use kiln_plugins::{
    AutoStartReport, PluginError, PluginLauncher, PluginRegistry, ProcessSupervisor,
    ShutdownReport,
};

use crate::DAEMON_TARGET;
use crate::settings;
use crate::shutdown::{ShutdownError, ShutdownSignal};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    ///
    /// # Errors
    ///
    /// Returns the layered loader's error.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced while bringing the daemon up or down.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration loaded but holds unusable values.
    #[error("invalid configuration: {source}")]
    Invalid {
        /// Validation failure.
        #[source]
        source: ConfigError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The plugins directory could not be scanned.
    #[error("failed to auto-start plugins: {source}")]
    AutoStart {
        /// Scan failure.
        #[source]
        source: PluginError,
    },
    /// The shutdown listener could not be installed.
    #[error("failed to wait for shutdown: {source}")]
    Shutdown {
        /// Listener failure.
        #[source]
        source: ShutdownError,
    },
}

/// A bootstrapped daemon owning its plugin registry.
pub struct Daemon<L: PluginLauncher = ProcessSupervisor> {
    config: Config,
    registry: PluginRegistry<L>,
    telemetry: TelemetryHandle,
}

impl<L: PluginLauncher> Daemon<L> {
    /// Assembles a daemon from its parts.
    pub const fn new(config: Config, registry: PluginRegistry<L>, telemetry: TelemetryHandle) -> Self {
        Self {
            config,
            registry,
            telemetry,
        }
    }

    /// The resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The registry serving plugin calls.
    #[must_use]
    pub const fn registry(&self) -> &PluginRegistry<L> {
        &self.registry
    }

    /// The telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Starts auto-start plugins unless the configuration disables it.
    ///
    /// Returns `None` when auto-start is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::AutoStart`] if the plugins directory exists
    /// but cannot be read. Individual plugin failures are only reported.
    pub fn start_plugins(&self) -> Result<Option<AutoStartReport>, BootstrapError> {
        if self.config.skip_auto_start() {
            info!(target: DAEMON_TARGET, "auto-start disabled by configuration");
            return Ok(None);
        }
        let report = self
            .registry
            .start_auto_plugins()
            .map_err(|source| BootstrapError::AutoStart { source })?;
        for (id, error) in report.failed() {
            warn!(target: DAEMON_TARGET, plugin = %id, %error, "plugin did not auto-start");
        }
        Ok(Some(report))
    }

    /// Starts plugins, blocks on `signal`, then stops every plugin.
    ///
    /// The registry is shut down even when waiting fails.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::AutoStart`] or [`BootstrapError::Shutdown`].
    pub fn run(self, signal: &dyn ShutdownSignal) -> Result<ShutdownReport, BootstrapError> {
        let started = self.start_plugins();
        let waited = match started {
            Ok(_) => {
                info!(
                    target: DAEMON_TARGET,
                    plugins = self.registry.len(),
                    "daemon ready"
                );
                signal
                    .wait()
                    .map_err(|source| BootstrapError::Shutdown { source })
            }
            Err(error) => Err(error),
        };
        let report = self.registry.shutdown();
        info!(
            target: DAEMON_TARGET,
            stopped = report.stopped().len(),
            failed = report.failed().len(),
            "daemon stopped"
        );
        waited.map(|()| report)
    }
}

/// Loads configuration, installs telemetry and builds the registry.
///
/// # Errors
///
/// Returns [`BootstrapError`] if configuration is missing or invalid, or
/// telemetry cannot be installed.
pub fn bootstrap_with(loader: &dyn ConfigLoader) -> Result<Daemon, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    config
        .validate()
        .map_err(|source| BootstrapError::Invalid { source })?;
    let handle =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    info!(
        target: DAEMON_TARGET,
        plugins_dir = %config.plugins_dir(),
        "daemon configured"
    );
    let registry = settings::build_registry(&config);
    Ok(Daemon::new(config, registry, handle))
}
