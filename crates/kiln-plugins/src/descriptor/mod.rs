//! In-memory plugin records and their lifecycle states.
//!
//! A [`PluginDescriptor`] couples a manifest with the resolved filesystem
//! locations of the plugin and whatever runtime state the supervisor has
//! observed. Runtime fields are only populated between a successful start
//! and the moment the registry drops the entry.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::manifest::PluginManifest;

/// Lifecycle state of a plugin.
///
/// The first three variants are produced by discovery for plugins that are
/// not registered. The remaining variants describe registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// A binary is present; the plugin can start without building.
    Available,
    /// Only the entry source is present; registration will build first.
    SourceOnly,
    /// Neither binary nor entry source is present.
    Incomplete,
    /// The process started and completed its handshake.
    Loaded,
    /// At least one call is in flight.
    Running,
    /// The last call succeeded.
    Ready,
    /// The last call failed.
    Error,
    /// The process was stopped and the entry removed.
    Stopped,
}

impl PluginStatus {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::SourceOnly => "source_only",
            Self::Incomplete => "incomplete",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Whether this status describes a live registry entry with a process.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Loaded | Self::Running | Self::Ready | Self::Error)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an unregistered plugin by filesystem evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Availability {
    /// The binary exists.
    Available,
    /// The binary is missing but the entry source exists.
    SourceOnly,
    /// Neither exists.
    Incomplete,
}

impl Availability {
    /// Classifies a plugin, preferring the binary over the entry source.
    #[must_use]
    pub const fn classify(binary_exists: bool, entry_source_exists: bool) -> Self {
        if binary_exists {
            Self::Available
        } else if entry_source_exists {
            Self::SourceOnly
        } else {
            Self::Incomplete
        }
    }
}

impl From<Availability> for PluginStatus {
    fn from(availability: Availability) -> Self {
        match availability {
            Availability::Available => Self::Available,
            Availability::SourceOnly => Self::SourceOnly,
            Availability::Incomplete => Self::Incomplete,
        }
    }
}

/// Runtime facts reported by the supervisor for a started plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    process_handle: String,
    protocol: String,
    negotiated_version: u32,
    os_pid: u32,
    network_address: String,
    has_exited: bool,
}

impl ProcessInfo {
    /// Creates a record for a process that has just completed its handshake.
    #[must_use]
    pub fn new(
        os_pid: u32,
        negotiated_version: u32,
        protocol: impl Into<String>,
        network_address: impl Into<String>,
    ) -> Self {
        Self {
            process_handle: format!("pid:{os_pid}"),
            protocol: protocol.into(),
            negotiated_version,
            os_pid,
            network_address: network_address.into(),
            has_exited: false,
        }
    }

    /// Records whether the process has exited.
    #[must_use]
    pub const fn with_exited(mut self, has_exited: bool) -> Self {
        self.has_exited = has_exited;
        self
    }

    /// Opaque process handle.
    #[must_use]
    pub const fn process_handle(&self) -> &str {
        self.process_handle.as_str()
    }

    /// RPC protocol name negotiated in the handshake.
    #[must_use]
    pub const fn protocol(&self) -> &str {
        self.protocol.as_str()
    }

    /// Application protocol version negotiated in the handshake.
    #[must_use]
    pub const fn negotiated_version(&self) -> u32 {
        self.negotiated_version
    }

    /// Operating-system process id.
    #[must_use]
    pub const fn os_pid(&self) -> u32 {
        self.os_pid
    }

    /// Address the plugin's RPC listener is bound to.
    #[must_use]
    pub const fn network_address(&self) -> &str {
        self.network_address.as_str()
    }

    /// Whether the process was observed to have exited.
    #[must_use]
    pub const fn has_exited(&self) -> bool {
        self.has_exited
    }
}

/// Identity, configuration and runtime state of one plugin.
///
/// Descriptors handed out by the registry are snapshots: mutating one has no
/// effect on registry-owned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    #[serde(flatten)]
    manifest: PluginManifest,
    binary_path: PathBuf,
    plugin_dir: PathBuf,
    status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process: Option<ProcessInfo>,
}

impl PluginDescriptor {
    /// Creates a descriptor with no runtime state.
    #[must_use]
    pub const fn new(
        manifest: PluginManifest,
        plugin_dir: PathBuf,
        binary_path: PathBuf,
        status: PluginStatus,
    ) -> Self {
        Self {
            manifest,
            binary_path,
            plugin_dir,
            status,
            started_at: None,
            process: None,
        }
    }

    /// Returns the plugin id.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.manifest.id()
    }

    /// Returns the parsed manifest.
    #[must_use]
    pub const fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Returns the binary path.
    #[must_use]
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Returns the plugin directory.
    #[must_use]
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> PluginStatus {
        self.status
    }

    /// Returns the start time in seconds since the Unix epoch.
    #[must_use]
    pub const fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    /// Returns the runtime facts of a live plugin.
    #[must_use]
    pub const fn process(&self) -> Option<&ProcessInfo> {
        self.process.as_ref()
    }

    pub(crate) fn set_paths(&mut self, plugin_dir: PathBuf, binary_path: PathBuf) {
        self.plugin_dir = plugin_dir;
        self.binary_path = binary_path;
    }

    pub(crate) const fn set_status(&mut self, status: PluginStatus) {
        self.status = status;
    }

    /// Stamps runtime state after a successful start.
    pub(crate) fn mark_loaded(&mut self, process: ProcessInfo, started_at: u64) {
        self.status = PluginStatus::Loaded;
        self.started_at = Some(started_at);
        self.process = Some(process);
    }

    pub(crate) fn refresh_exited(&mut self, has_exited: bool) {
        if let Some(process) = self.process.as_mut() {
            process.has_exited = has_exited;
        }
    }

    /// Clears runtime state once the process is gone.
    pub(crate) fn mark_stopped(&mut self) {
        self.status = PluginStatus::Stopped;
        self.process = None;
    }
}
