//! Maps [`Config`] onto the plugin crate's own settings types.

use kiln_config::Config;
use kiln_plugins::{
    BuildPipeline, PluginLayout, PluginRegistry, ProcessSupervisor, RegistrySettings, Toolchain,
};

/// Directory names and file names a plugin is expected to use.
#[must_use]
pub fn plugin_layout(config: &Config) -> PluginLayout {
    PluginLayout::default()
        .with_manifest_file(config.manifest_file())
        .with_bin_dir(config.bin_dir())
        .with_entry_source(config.entry_source())
        .with_build_script(config.build_script_dir(), config.build_script_file())
}

/// Cargo-driven pipeline bounded by the configured build timeout.
#[must_use]
pub fn build_pipeline(config: &Config) -> BuildPipeline {
    BuildPipeline::new(plugin_layout(config), Toolchain::cargo()).with_timeout(config.build_timeout())
}

/// Registry settings: plugins root and default call bound.
#[must_use]
pub fn registry_settings(config: &Config) -> RegistrySettings {
    RegistrySettings::default()
        .with_plugins_dir(config.plugins_dir().as_std_path())
        .with_call_timeout(config.call_timeout())
}

/// Supervisor using the default handshake and the configured start bound.
#[must_use]
pub fn supervisor(config: &Config) -> ProcessSupervisor {
    ProcessSupervisor::default().with_default_start_timeout(config.start_timeout())
}

/// Builds the registry the daemon owns for its lifetime.
#[must_use]
pub fn build_registry(config: &Config) -> PluginRegistry {
    PluginRegistry::with_launcher(
        registry_settings(config),
        build_pipeline(config),
        supervisor(config),
    )
}
