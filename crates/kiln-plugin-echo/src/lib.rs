//! Reference plugin for the kiln host.
//!
//! Implements three methods over the `kiln-plugins` serve SDK:
//!
//! - `greet` answers `{"message": "Hello, <name>!"}`, defaulting the name
//!   to `World`.
//! - `info` reports the plugin's own manifest.
//! - `echo` returns its arguments unchanged.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use kiln_plugins::serve::{MethodError, PluginService};
use kiln_plugins::{PluginManifest, Value, ValueMap};
use tracing::debug;

const ECHO_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::service");

/// The echo plugin service.
#[derive(Debug, Clone)]
pub struct EchoPlugin {
    manifest_path: PathBuf,
}

impl Default for EchoPlugin {
    /// Reads `plugin.json` from the working directory, which the host sets
    /// to the plugin directory.
    fn default() -> Self {
        Self::new("plugin.json")
    }
}

impl EchoPlugin {
    /// Creates a plugin that reports the manifest at `manifest_path`.
    #[must_use]
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
        }
    }

    /// Path `info` reads.
    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    fn greet(args: &ValueMap) -> ValueMap {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or("World");
        let mut result = ValueMap::new();
        result.insert("message".to_owned(), Value::from(format!("Hello, {name}!")));
        result
    }

    fn info(&self) -> Result<ValueMap, MethodError> {
        let manifest = PluginManifest::load(&self.manifest_path)
            .map_err(|error| MethodError::new(format!("cannot read manifest: {error}")))?;
        let mut result = ValueMap::new();
        for (key, value) in [
            ("id", manifest.id()),
            ("name", manifest.name()),
            ("version", manifest.version()),
            ("author", manifest.author()),
            ("description", manifest.description()),
            ("type", manifest.kind().as_str()),
        ] {
            result.insert(key.to_owned(), Value::from(value));
        }
        Ok(result)
    }
}

impl PluginService for EchoPlugin {
    fn execute(&self, method: &str, args: ValueMap) -> Result<ValueMap, MethodError> {
        debug!(target: ECHO_TARGET, method, "handling call");
        match method {
            "greet" => Ok(Self::greet(&args)),
            "info" => self.info(),
            "echo" => Ok(args),
            other => Err(MethodError::unknown_method(other)),
        }
    }
}
