//! Plugin manifest types describing identity and launch configuration.
//!
//! A [`PluginManifest`] mirrors the `plugin.json` file found in every plugin
//! directory. Unknown fields are ignored so older hosts keep reading newer
//! manifests, and every field except `id` is optional.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Role a plugin plays inside the host application.
///
/// # Example
///
/// ```
/// use kiln_plugins::PluginKind;
///
/// let kind = PluginKind::default();
/// assert_eq!(kind.as_str(), "handler");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Supplies content or data to the host.
    Provider,
    /// Transforms content flowing through the host.
    Filter,
    /// Responds to explicit method calls.
    #[default]
    Handler,
    /// Reacts to host events.
    Notifier,
}

impl PluginKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Filter => "filter",
            Self::Handler => "handler",
            Self::Notifier => "notifier",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity fields shared by every plugin.
///
/// Groups the id, name and version into a parameter object for
/// [`PluginManifest::new`].
///
/// # Example
///
/// ```
/// use kiln_plugins::PluginMetadata;
///
/// let meta = PluginMetadata::new("echo", "Echo", "1.0.0");
/// assert_eq!(meta.id(), "echo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    id: String,
    name: String,
    version: String,
}

impl PluginMetadata {
    /// Creates a new metadata bundle.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Returns the plugin id.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }
}

/// Declarative description of a plugin as read from `plugin.json`.
///
/// # Example
///
/// ```
/// use kiln_plugins::{PluginKind, PluginManifest};
///
/// let manifest = PluginManifest::parse(r#"{"id": "echo", "auto_start": true}"#)
///     .expect("manifest parses");
/// assert_eq!(manifest.id(), "echo");
/// assert_eq!(manifest.kind(), PluginKind::Handler);
/// assert!(manifest.auto_start());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    repository: String,
    #[serde(default)]
    binary: String,
    #[serde(default, rename = "type")]
    kind: PluginKind,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    start_timeout: u64,
    #[serde(default)]
    min_port: u16,
    #[serde(default)]
    max_port: u16,
    #[serde(default)]
    auto_mtls: bool,
    #[serde(default)]
    managed: bool,
}

impl PluginManifest {
    /// Creates a manifest with every optional field at its default.
    #[must_use]
    pub fn new(metadata: PluginMetadata, kind: PluginKind) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name,
            version: metadata.version,
            author: String::new(),
            description: String::new(),
            repository: String::new(),
            binary: String::new(),
            kind,
            auto_start: false,
            start_timeout: 0,
            min_port: 0,
            max_port: 0,
            auto_mtls: false,
            managed: false,
        }
    }

    /// Reads and validates the manifest stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] when the file cannot be read,
    /// [`PluginError::ManifestParse`] when it is not valid manifest JSON, and
    /// [`PluginError::Manifest`] when it fails validation.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let raw = fs::read_to_string(path).map_err(|source| PluginError::io(path, source))?;
        let manifest: Self =
            serde_json::from_str(&raw).map_err(|error| PluginError::ManifestParse {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parses and validates a manifest from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] for malformed JSON and
    /// [`PluginError::Manifest`] when validation fails.
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        let manifest: Self =
            serde_json::from_str(raw).map_err(|error| PluginError::ManifestParse {
                path: PathBuf::from("<inline>"),
                message: error.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validates the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Manifest`] if the id is blank or the port range
    /// is inverted.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::Manifest {
                message: String::from("plugin id must not be empty"),
            });
        }
        if self.min_port != 0 && self.max_port != 0 && self.min_port > self.max_port {
            return Err(PluginError::Manifest {
                message: format!(
                    "plugin '{}' declares min_port {} above max_port {}",
                    self.id, self.min_port, self.max_port
                ),
            });
        }
        Ok(())
    }

    /// Sets the author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the repository URL.
    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    /// Sets the binary path, relative to the plugin directory.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Marks the plugin for start-up by [`crate::PluginRegistry::start_auto_plugins`].
    #[must_use]
    pub const fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Overrides the handshake timeout in milliseconds. Zero selects the host
    /// default.
    #[must_use]
    pub const fn with_start_timeout_ms(mut self, start_timeout: u64) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// Restricts the port range the plugin may bind its listener to.
    #[must_use]
    pub const fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Requests mutual TLS on the RPC channel.
    #[must_use]
    pub const fn with_auto_mtls(mut self, auto_mtls: bool) -> Self {
        self.auto_mtls = auto_mtls;
        self
    }

    /// Marks the process as managed: the host waits for it to exit on stop.
    #[must_use]
    pub const fn with_managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    /// Returns the plugin id.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Returns the display name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the version string.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Returns the author.
    #[must_use]
    pub const fn author(&self) -> &str {
        self.author.as_str()
    }

    /// Returns the description.
    #[must_use]
    pub const fn description(&self) -> &str {
        self.description.as_str()
    }

    /// Returns the repository URL.
    #[must_use]
    pub const fn repository(&self) -> &str {
        self.repository.as_str()
    }

    /// Returns the binary path as written in the manifest. Empty means the
    /// layout default.
    #[must_use]
    pub const fn binary(&self) -> &str {
        self.binary.as_str()
    }

    /// Returns the plugin role.
    #[must_use]
    pub const fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Whether the plugin starts with the host.
    #[must_use]
    pub const fn auto_start(&self) -> bool {
        self.auto_start
    }

    /// Handshake timeout in milliseconds; zero means the host default.
    #[must_use]
    pub const fn start_timeout_ms(&self) -> u64 {
        self.start_timeout
    }

    /// Lower bound of the listener port range; zero means unrestricted.
    #[must_use]
    pub const fn min_port(&self) -> u16 {
        self.min_port
    }

    /// Upper bound of the listener port range; zero means unrestricted.
    #[must_use]
    pub const fn max_port(&self) -> u16 {
        self.max_port
    }

    /// Whether mutual TLS was requested.
    #[must_use]
    pub const fn auto_mtls(&self) -> bool {
        self.auto_mtls
    }

    /// Whether the host owns the process lifetime.
    #[must_use]
    pub const fn managed(&self) -> bool {
        self.managed
    }
}
