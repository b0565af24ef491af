//! The live plugin registry.
//!
//! [`PluginRegistry`] owns every registered plugin's descriptor and process
//! handle behind one `RwLock`. Registration reserves the id first, then
//! builds and starts the process with the lock released; a slow build never
//! stalls lookups or calls on other plugins, and two registrations of the
//! same id can never both succeed. Calls flip the status to `running`
//! under the write lock and release it for the RPC wait; an in-flight count
//! keeps the status at `running` until the last concurrent call returns.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::build::{BuildOutcome, BuildPipeline, BuildRequest};
use crate::context::CallContext;
use crate::descriptor::{PluginDescriptor, PluginStatus};
use crate::discovery::{DiscoveryRecord, discover};
use crate::error::PluginError;
use crate::launcher::{PluginHandle, PluginLauncher};
use crate::process::ProcessSupervisor;
use crate::value::ValueMap;

const REGISTRY_TARGET: &str = "kiln_plugins::registry";

/// Default plugins directory, relative to the working directory.
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";
/// Bound applied by [`PluginRegistry::execute_plugin`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    plugins_dir: PathBuf,
    call_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl RegistrySettings {
    /// Sets the directory scanned by discovery and auto-start.
    #[must_use]
    pub fn with_plugins_dir(mut self, plugins_dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = plugins_dir.into();
        self
    }

    /// Sets the bound used when a caller does not supply a context.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Returns the plugins directory.
    #[must_use]
    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Returns the default call bound.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}

/// Outcome of [`PluginRegistry::start_auto_plugins`].
#[derive(Debug, Default)]
pub struct AutoStartReport {
    started: Vec<String>,
    failed: Vec<(String, PluginError)>,
}

impl AutoStartReport {
    /// Ids registered during the scan.
    #[must_use]
    pub fn started(&self) -> &[String] {
        &self.started
    }

    /// Ids that failed, with the reason. The scan continued past each one.
    #[must_use]
    pub fn failed(&self) -> &[(String, PluginError)] {
        &self.failed
    }
}

/// Outcome of [`PluginRegistry::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    stopped: Vec<String>,
    failed: Vec<(String, PluginError)>,
}

impl ShutdownReport {
    /// Ids whose processes stopped cleanly.
    #[must_use]
    pub fn stopped(&self) -> &[String] {
        &self.stopped
    }

    /// Ids whose stop reported an error. They were removed regardless.
    #[must_use]
    pub fn failed(&self) -> &[(String, PluginError)] {
        &self.failed
    }

    /// Whether every process stopped cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An id being built or started outside the registry lock.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

struct RegistryEntry {
    descriptor: PluginDescriptor,
    handle: Arc<dyn PluginHandle>,
    in_flight: usize,
    generation: u64,
}

impl RegistryEntry {
    fn snapshot(&self) -> PluginDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.refresh_exited(self.handle.has_exited());
        descriptor
    }
}

/// Concurrency-safe map of live plugins.
///
/// Dropping the registry shuts every plugin down.
///
/// # Example
///
/// ```rust,no_run
/// use kiln_plugins::{BuildPipeline, PluginRegistry, RegistrySettings, ValueMap};
///
/// let registry = PluginRegistry::new(
///     RegistrySettings::default().with_plugins_dir("plugins"),
///     BuildPipeline::default(),
/// );
/// registry.register_plugin("echo").expect("echo starts");
/// let result = registry
///     .execute_plugin("echo", "greet", &ValueMap::new())
///     .expect("greet succeeds");
/// assert!(result.contains_key("message"));
/// let report = registry.shutdown();
/// assert!(report.is_clean());
/// ```
pub struct PluginRegistry<L: PluginLauncher = ProcessSupervisor> {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    pending: Mutex<HashSet<String>>,
    launcher: L,
    pipeline: BuildPipeline,
    settings: RegistrySettings,
    next_generation: AtomicU64,
}

impl PluginRegistry<ProcessSupervisor> {
    /// Creates a registry that starts plugins with the default supervisor.
    #[must_use]
    pub fn new(settings: RegistrySettings, pipeline: BuildPipeline) -> Self {
        Self::with_launcher(settings, pipeline, ProcessSupervisor::default())
    }
}

impl<L: PluginLauncher> PluginRegistry<L> {
    /// Creates a registry that starts plugins through `launcher`.
    #[must_use]
    pub fn with_launcher(settings: RegistrySettings, pipeline: BuildPipeline, launcher: L) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            launcher,
            pipeline,
            settings,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the registry settings.
    #[must_use]
    pub const fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Returns the build pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &BuildPipeline {
        &self.pipeline
    }

    /// Returns the launcher.
    #[must_use]
    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Builds (if needed), starts and registers the plugin.
    ///
    /// An empty plugin directory defaults to `<plugins_dir>/<id>` and an
    /// empty binary path to the layout's default. Both are made absolute.
    /// Returns a snapshot of the registered descriptor, status `loaded`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyRegistered`] if the id is registered or
    /// being registered, or the build or start failure. Nothing is inserted
    /// on failure and the id is free to register again.
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<PluginDescriptor, PluginError> {
        let id = descriptor.id().to_owned();
        let reservation = self.reserve(&id)?;

        let mut staged = descriptor;
        let (plugin_dir, binary_path) = self.resolve_paths(&staged)?;
        let entry_source = self.pipeline.layout().entry_source_path(&plugin_dir);
        let outcome = self.pipeline.ensure_built(BuildRequest {
            id: &id,
            plugin_dir: &plugin_dir,
            binary_path: &binary_path,
            entry_source: &entry_source,
        });
        match outcome {
            Ok(BuildOutcome::Built) => {
                info!(target: REGISTRY_TARGET, plugin = %id, "plugin built before start");
            }
            Ok(BuildOutcome::AlreadyBuilt) => {}
            Err(error) => {
                warn!(target: REGISTRY_TARGET, plugin = %id, %error, "plugin build failed");
                return Err(error);
            }
        }
        staged.set_paths(plugin_dir, binary_path);

        let handle = self.launcher.launch(&staged).inspect_err(|error| {
            warn!(target: REGISTRY_TARGET, plugin = %id, %error, "plugin start failed");
        })?;
        staged.mark_loaded(handle.process_info(), unix_now());
        let snapshot = staged.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.write_entries();
        entries.insert(
            id.clone(),
            RegistryEntry {
                descriptor: staged,
                handle,
                in_flight: 0,
                generation,
            },
        );
        drop(reservation);
        info!(
            target: REGISTRY_TARGET,
            plugin = %id,
            registered = entries.len(),
            "plugin registered"
        );
        Ok(snapshot)
    }

    /// Discovers the plugins directory and registers the plugin named `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if no manifest declares `id`,
    /// [`PluginError::Io`] if the plugins directory cannot be read, or any
    /// [`PluginRegistry::register`] error.
    pub fn register_plugin(&self, id: &str) -> Result<PluginDescriptor, PluginError> {
        let record = discover(self.settings.plugins_dir(), self.pipeline.layout())?
            .into_iter()
            .find(|record| record.descriptor().id() == id)
            .ok_or_else(|| PluginError::not_found(id))?;
        self.register(record.into_descriptor())
    }

    /// Removes the plugin and stops its process.
    ///
    /// The entry is removed before the process is stopped, so the id is
    /// free again even when stopping fails. Returns the final descriptor,
    /// status `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the id is not registered, or the
    /// stop failure.
    pub fn unregister(&self, id: &str) -> Result<PluginDescriptor, PluginError> {
        let entry = self
            .write_entries()
            .remove(id)
            .ok_or_else(|| PluginError::not_found(id))?;
        let RegistryEntry {
            mut descriptor,
            handle,
            in_flight,
            ..
        } = entry;
        if in_flight > 0 {
            debug!(
                target: REGISTRY_TARGET,
                plugin = id,
                in_flight,
                "unregistering plugin with calls in flight"
            );
        }
        handle.stop().inspect_err(|error| {
            warn!(target: REGISTRY_TARGET, plugin = id, %error, "plugin stop failed");
        })?;
        descriptor.mark_stopped();
        info!(target: REGISTRY_TARGET, plugin = id, "plugin unregistered");
        Ok(descriptor)
    }

    /// Invokes `method` on plugin `id`, bounded by `ctx`.
    ///
    /// The status is `running` while any call is in flight and becomes
    /// `ready` or `error` when the last one returns.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the id is not registered, or the
    /// dispatcher's classification of the failure.
    pub fn execute(
        &self,
        id: &str,
        method: &str,
        args: &ValueMap,
        ctx: &CallContext,
    ) -> Result<ValueMap, PluginError> {
        let (handle, generation) = {
            let mut entries = self.write_entries();
            let entry = entries.get_mut(id).ok_or_else(|| PluginError::not_found(id))?;
            entry.in_flight += 1;
            entry.descriptor.set_status(PluginStatus::Running);
            (Arc::clone(&entry.handle), entry.generation)
        };

        let outcome = handle.invoke(method, args, ctx);

        {
            let mut entries = self.write_entries();
            let current = entries
                .get_mut(id)
                .filter(|entry| entry.generation == generation);
            if let Some(entry) = current {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                if entry.in_flight == 0 {
                    let status = if outcome.is_ok() {
                        PluginStatus::Ready
                    } else {
                        PluginStatus::Error
                    };
                    entry.descriptor.set_status(status);
                }
                entry.descriptor.refresh_exited(handle.has_exited());
            }
        }

        match &outcome {
            Ok(_) => debug!(target: REGISTRY_TARGET, plugin = id, method, "plugin call succeeded"),
            Err(error) => warn!(
                target: REGISTRY_TARGET,
                plugin = id,
                method,
                kind = ?error.kind(),
                %error,
                "plugin call failed"
            ),
        }
        outcome
    }

    /// Invokes `method` bounded by the configured call timeout.
    ///
    /// # Errors
    ///
    /// As for [`PluginRegistry::execute`].
    pub fn execute_plugin(
        &self,
        id: &str,
        method: &str,
        args: &ValueMap,
    ) -> Result<ValueMap, PluginError> {
        let ctx = CallContext::with_timeout(self.settings.call_timeout());
        self.execute(id, method, args, &ctx)
    }

    /// Asks plugin `id` whether it is healthy. The status is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the id is not registered, or the
    /// dispatcher's classification of the failure.
    pub fn health_check(&self, id: &str, ctx: &CallContext) -> Result<(), PluginError> {
        let handle = self
            .read_entries()
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| PluginError::not_found(id))?;
        handle.health_check(ctx)
    }

    /// Returns a snapshot of plugin `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the id is not registered.
    pub fn get(&self, id: &str) -> Result<PluginDescriptor, PluginError> {
        self.read_entries()
            .get(id)
            .map(RegistryEntry::snapshot)
            .ok_or_else(|| PluginError::not_found(id))
    }

    /// Returns snapshots of every registered plugin, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<_> = self
            .read_entries()
            .values()
            .map(RegistryEntry::snapshot)
            .collect();
        descriptors.sort_by(|left, right| left.id().cmp(right.id()));
        descriptors
    }

    /// Discovers the plugins directory, substituting live descriptors for
    /// registered plugins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the plugins directory cannot be read.
    pub fn list_plugins(&self) -> Result<Vec<DiscoveryRecord>, PluginError> {
        let mut records = discover(self.settings.plugins_dir(), self.pipeline.layout())?;
        let entries = self.read_entries();
        for record in &mut records {
            if let Some(entry) = entries.get(record.descriptor().id()) {
                record.substitute_live(entry.snapshot());
            }
        }
        Ok(records)
    }

    /// As [`PluginRegistry::list_plugins`], keeping records in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the plugins directory cannot be read.
    pub fn list_plugins_with_status(
        &self,
        status: PluginStatus,
    ) -> Result<Vec<DiscoveryRecord>, PluginError> {
        let mut records = self.list_plugins()?;
        records.retain(|record| record.descriptor().status() == status);
        Ok(records)
    }

    /// Registers every unregistered plugin whose manifest sets `auto_start`.
    ///
    /// A missing plugins directory yields an empty report. A plugin that
    /// fails to build or start is logged and recorded; the scan continues.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the plugins directory exists but
    /// cannot be read.
    pub fn start_auto_plugins(&self) -> Result<AutoStartReport, PluginError> {
        let plugins_dir = self.settings.plugins_dir();
        let records = match discover(plugins_dir, self.pipeline.layout()) {
            Ok(records) => records,
            Err(PluginError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(
                    target: REGISTRY_TARGET,
                    dir = %plugins_dir.display(),
                    "plugins directory missing; nothing to auto-start"
                );
                return Ok(AutoStartReport::default());
            }
            Err(error) => return Err(error),
        };

        let mut report = AutoStartReport::default();
        for record in records {
            let descriptor = record.into_descriptor();
            let id = descriptor.id().to_owned();
            if !descriptor.manifest().auto_start() || self.contains(&id) {
                continue;
            }
            match self.register(descriptor) {
                Ok(_) => report.started.push(id),
                Err(error) => {
                    warn!(
                        target: REGISTRY_TARGET,
                        plugin = %id,
                        %error,
                        "auto-start failed; continuing"
                    );
                    report.failed.push((id, error));
                }
            }
        }
        info!(
            target: REGISTRY_TARGET,
            started = report.started.len(),
            failed = report.failed.len(),
            "auto-start complete"
        );
        Ok(report)
    }

    /// Stops every plugin and empties the registry. Safe to call repeatedly.
    pub fn shutdown(&self) -> ShutdownReport {
        let drained: Vec<_> = {
            let mut entries = self.write_entries();
            entries.drain().collect()
        };
        let mut report = ShutdownReport::default();
        for (id, entry) in drained {
            match entry.handle.stop() {
                Ok(()) => report.stopped.push(id),
                Err(error) => {
                    warn!(target: REGISTRY_TARGET, plugin = %id, %error, "plugin stop failed");
                    report.failed.push((id, error));
                }
            }
        }
        if !report.stopped.is_empty() || !report.failed.is_empty() {
            info!(
                target: REGISTRY_TARGET,
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "registry shut down"
            );
        }
        report
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.read_entries().contains_key(id)
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// Whether no plugins are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Claims `id` for a registration in progress. The claim is released
    /// when the returned guard drops.
    fn reserve(&self, id: &str) -> Result<Reservation<'_>, PluginError> {
        let entries = self.read_entries();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(id) || !pending.insert(id.to_owned()) {
            return Err(PluginError::AlreadyRegistered { id: id.to_owned() });
        }
        Ok(Reservation {
            pending: &self.pending,
            id: id.to_owned(),
        })
    }

    fn resolve_paths(&self, descriptor: &PluginDescriptor) -> Result<(PathBuf, PathBuf), PluginError> {
        let declared_dir = descriptor.plugin_dir();
        let dir = if declared_dir.as_os_str().is_empty() {
            self.settings.plugins_dir().join(descriptor.id())
        } else {
            declared_dir.to_path_buf()
        };
        let plugin_dir = std::path::absolute(&dir).map_err(|source| PluginError::io(&dir, source))?;

        let declared_binary = descriptor.binary_path();
        let binary = if declared_binary.as_os_str().is_empty() {
            self.pipeline
                .layout()
                .binary_path(&plugin_dir, descriptor.manifest())
        } else {
            declared_binary.to_path_buf()
        };
        let binary_path =
            std::path::absolute(&binary).map_err(|source| PluginError::io(&binary, source))?;
        Ok((plugin_dir, binary_path))
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: PluginLauncher> Drop for PluginRegistry<L> {
    fn drop(&mut self) {
        let populated = !self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        if populated {
            let report = self.shutdown();
            debug!(
                target: REGISTRY_TARGET,
                stopped = report.stopped().len(),
                "registry dropped with live plugins"
            );
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
