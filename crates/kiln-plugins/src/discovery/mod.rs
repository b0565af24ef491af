//! Discovery of plugin directories on disk.
//!
//! [`discover`] walks the immediate subdirectories of a plugins directory,
//! parses each manifest and classifies the plugin by what exists on disk.
//! A broken directory is logged and skipped so it never hides the rest.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{Availability, PluginDescriptor};
use crate::error::PluginError;
use crate::layout::PluginLayout;
use crate::manifest::PluginManifest;

const DISCOVERY_TARGET: &str = "kiln_plugins::discovery";

/// A plugin found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    #[serde(flatten)]
    descriptor: PluginDescriptor,
    path: PathBuf,
    is_registered: bool,
}

impl DiscoveryRecord {
    /// Returns the descriptor, live when the plugin is registered.
    #[must_use]
    pub const fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Consumes the record, returning its descriptor.
    #[must_use]
    pub fn into_descriptor(self) -> PluginDescriptor {
        self.descriptor
    }

    /// Returns the plugin directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the plugin is currently held by the registry.
    #[must_use]
    pub const fn is_registered(&self) -> bool {
        self.is_registered
    }

    /// Replaces the on-disk descriptor with the registry's live one.
    pub(crate) fn substitute_live(&mut self, live: PluginDescriptor) {
        self.descriptor = live;
        self.is_registered = true;
    }
}

/// Scans `plugins_dir` for plugin directories.
///
/// Records are sorted by directory name. Every record is unregistered; the
/// registry overlays live state in [`crate::PluginRegistry::list_plugins`].
///
/// # Errors
///
/// Returns [`PluginError::Io`] if `plugins_dir` cannot be read. Problems
/// inside individual plugin directories are logged as warnings.
pub fn discover(plugins_dir: &Path, layout: &PluginLayout) -> Result<Vec<DiscoveryRecord>, PluginError> {
    let root = std::path::absolute(plugins_dir).map_err(|source| PluginError::io(plugins_dir, source))?;
    let entries = fs::read_dir(&root).map_err(|source| PluginError::io(&root, source))?;

    let mut candidates = Vec::new();
    for entry in entries {
        match entry {
            Ok(dir_entry) => {
                let path = dir_entry.path();
                if path.is_dir() {
                    candidates.push(path);
                }
            }
            Err(error) => warn!(
                target: DISCOVERY_TARGET,
                dir = %root.display(),
                %error,
                "skipping unreadable directory entry"
            ),
        }
    }
    candidates.sort();

    let records: Vec<DiscoveryRecord> = candidates
        .into_iter()
        .filter_map(|dir| inspect(&dir, layout))
        .collect();
    debug!(
        target: DISCOVERY_TARGET,
        dir = %root.display(),
        found = records.len(),
        "discovery complete"
    );
    Ok(records)
}

/// Builds the record for one candidate directory, or `None` if its manifest
/// is missing or invalid.
fn inspect(plugin_dir: &Path, layout: &PluginLayout) -> Option<DiscoveryRecord> {
    let manifest_path = layout.manifest_path(plugin_dir);
    let manifest = match PluginManifest::load(&manifest_path) {
        Ok(manifest) => manifest,
        Err(error) => {
            warn!(
                target: DISCOVERY_TARGET,
                dir = %plugin_dir.display(),
                %error,
                "skipping plugin directory"
            );
            return None;
        }
    };

    let binary_path = layout.binary_path(plugin_dir, &manifest);
    let availability = Availability::classify(
        binary_path.is_file(),
        layout.entry_source_path(plugin_dir).is_file(),
    );
    let descriptor = PluginDescriptor::new(
        manifest,
        plugin_dir.to_path_buf(),
        binary_path,
        availability.into(),
    );
    Some(DiscoveryRecord {
        descriptor,
        path: plugin_dir.to_path_buf(),
        is_registered: false,
    })
}
