//! Directory layout contract for plugin directories.
//!
//! Each plugin lives in `<plugins_dir>/<name>/` and holds a manifest, a
//! binary directory, an entry-source file marking it as buildable, and an
//! optional custom build script. [`PluginLayout`] names those locations so
//! discovery, the build pipeline and the registry agree on them.

use std::path::{Path, PathBuf};

use crate::manifest::PluginManifest;

/// Default manifest file name.
pub const DEFAULT_MANIFEST_FILE: &str = "plugin.json";
/// Default binary directory, relative to the plugin directory.
pub const DEFAULT_BIN_DIR: &str = "bin";
/// Default entry-source file, relative to the plugin directory.
pub const DEFAULT_ENTRY_SOURCE: &str = "src/main.rs";
/// Default custom build script directory.
pub const DEFAULT_BUILD_SCRIPT_DIR: &str = "scripts";
/// Default custom build script file name.
pub const DEFAULT_BUILD_SCRIPT_FILE: &str = "build.sh";

/// Names of the well-known files inside a plugin directory.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use kiln_plugins::{PluginKind, PluginLayout, PluginManifest, PluginMetadata};
///
/// let layout = PluginLayout::default();
/// let manifest = PluginManifest::new(PluginMetadata::new("echo", "Echo", "1"), PluginKind::Handler);
/// assert_eq!(
///     layout.binary_path(Path::new("/plugins/echo"), &manifest),
///     Path::new("/plugins/echo/bin/echo"),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLayout {
    manifest_file: String,
    bin_dir: PathBuf,
    entry_source: PathBuf,
    build_script_dir: PathBuf,
    build_script_file: String,
}

impl Default for PluginLayout {
    fn default() -> Self {
        Self {
            manifest_file: String::from(DEFAULT_MANIFEST_FILE),
            bin_dir: PathBuf::from(DEFAULT_BIN_DIR),
            entry_source: PathBuf::from(DEFAULT_ENTRY_SOURCE),
            build_script_dir: PathBuf::from(DEFAULT_BUILD_SCRIPT_DIR),
            build_script_file: String::from(DEFAULT_BUILD_SCRIPT_FILE),
        }
    }
}

impl PluginLayout {
    /// Overrides the manifest file name.
    #[must_use]
    pub fn with_manifest_file(mut self, manifest_file: impl Into<String>) -> Self {
        self.manifest_file = manifest_file.into();
        self
    }

    /// Overrides the binary directory.
    #[must_use]
    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = bin_dir.into();
        self
    }

    /// Overrides the entry-source file.
    #[must_use]
    pub fn with_entry_source(mut self, entry_source: impl Into<PathBuf>) -> Self {
        self.entry_source = entry_source.into();
        self
    }

    /// Overrides the custom build script location.
    #[must_use]
    pub fn with_build_script(
        mut self,
        dir: impl Into<PathBuf>,
        file: impl Into<String>,
    ) -> Self {
        self.build_script_dir = dir.into();
        self.build_script_file = file.into();
        self
    }

    /// Path of the manifest inside `plugin_dir`.
    #[must_use]
    pub fn manifest_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join(&self.manifest_file)
    }

    /// Path of the entry-source file inside `plugin_dir`.
    #[must_use]
    pub fn entry_source_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join(&self.entry_source)
    }

    /// Path of the custom build script inside `plugin_dir`.
    #[must_use]
    pub fn build_script_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir
            .join(&self.build_script_dir)
            .join(&self.build_script_file)
    }

    /// Resolves the plugin binary.
    ///
    /// An empty `binary` field selects `<plugin_dir>/<bin_dir>/<id>`;
    /// otherwise the field is taken relative to the plugin directory.
    #[must_use]
    pub fn binary_path(&self, plugin_dir: &Path, manifest: &PluginManifest) -> PathBuf {
        if manifest.binary().is_empty() {
            plugin_dir.join(&self.bin_dir).join(manifest.id())
        } else {
            plugin_dir.join(manifest.binary())
        }
    }
}
