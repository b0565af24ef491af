//! On-demand compilation of plugins from source.
//!
//! [`BuildPipeline::ensure_built`] is a no-op when the plugin binary already
//! exists. Otherwise it runs either the plugin's custom build script or the
//! configured [`Toolchain`], each step bounded by one shared deadline, and
//! fails with the combined output of the step that went wrong.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{PluginError, TimedOperation};
use crate::layout::PluginLayout;

const BUILD_TARGET: &str = "kiln_plugins::build";

/// Default bound on a whole build.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A command template run as one build step.
///
/// Arguments may contain the placeholders `{plugin_dir}`, `{output}` and
/// `{output_name}`, which are replaced with absolute paths before the step
/// runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    name: String,
    program: String,
    args: Vec<String>,
}

impl BuildStep {
    /// Creates a step running `program` with `args`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Step name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }
}

/// Dependency-sync and compile commands with their environment.
///
/// # Example
///
/// ```
/// use kiln_plugins::{BuildStep, Toolchain};
///
/// let toolchain = Toolchain::new(BuildStep::new("compile", "make", ["-C", "{plugin_dir}"]))
///     .with_env("CC", "cc");
/// assert!(toolchain.sync_step().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    sync: Option<BuildStep>,
    compile: BuildStep,
    env: Vec<(String, String)>,
    artifact: Option<String>,
}

impl Toolchain {
    /// Creates a toolchain with only a compile step.
    #[must_use]
    pub const fn new(compile: BuildStep) -> Self {
        Self {
            sync: None,
            compile,
            env: Vec::new(),
            artifact: None,
        }
    }

    /// The Cargo toolchain: fetch, release build into a plugin-local target
    /// directory, then copy the binary into place.
    ///
    /// The C runtime is linked statically so the binary runs on hosts other
    /// than the build machine.
    #[must_use]
    pub fn cargo() -> Self {
        Self::new(BuildStep::new(
            "compile",
            "cargo",
            ["build", "--release", "--bin", "{output_name}"],
        ))
        .with_sync(BuildStep::new("sync", "cargo", ["fetch"]))
        .with_env("CARGO_TARGET_DIR", "{plugin_dir}/target")
        .with_env("CARGO_INCREMENTAL", "0")
        .with_env("RUSTFLAGS", "-C target-feature=+crt-static")
        .with_artifact("{plugin_dir}/target/release/{output_name}")
    }

    /// Adds a dependency-sync step run before compiling.
    #[must_use]
    pub fn with_sync(mut self, sync: BuildStep) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Adds an environment override applied to every step.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Names the file the compile step produces; it is copied to the output
    /// path after a successful compile.
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Returns the dependency-sync step.
    #[must_use]
    pub const fn sync_step(&self) -> Option<&BuildStep> {
        self.sync.as_ref()
    }

    /// Returns the compile step.
    #[must_use]
    pub const fn compile_step(&self) -> &BuildStep {
        &self.compile
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::cargo()
    }
}

/// What [`BuildPipeline::ensure_built`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The binary already existed; nothing ran.
    AlreadyBuilt,
    /// The plugin was compiled.
    Built,
}

/// What [`BuildPipeline::run_build_script`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// No script exists.
    NothingToBuild,
    /// The script ran to completion.
    Completed,
}

/// Locations involved in building one plugin.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Plugin id, for diagnostics.
    pub id: &'a str,
    /// Plugin directory.
    pub plugin_dir: &'a Path,
    /// Binary the build must produce.
    pub binary_path: &'a Path,
    /// Entry source whose presence marks the plugin as buildable.
    pub entry_source: &'a Path,
}

/// Compiles plugins with a bounded timeout.
#[derive(Debug, Clone)]
pub struct BuildPipeline {
    toolchain: Toolchain,
    layout: PluginLayout,
    timeout: Duration,
}

impl Default for BuildPipeline {
    fn default() -> Self {
        Self::new(PluginLayout::default(), Toolchain::default())
    }
}

impl BuildPipeline {
    /// Creates a pipeline with the default timeout.
    #[must_use]
    pub const fn new(layout: PluginLayout, toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            layout,
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    /// Overrides the build timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the build timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the directory layout used to find build scripts.
    #[must_use]
    pub const fn layout(&self) -> &PluginLayout {
        &self.layout
    }

    /// Builds the plugin unless its binary already exists.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MissingSource`] if neither the binary nor the
    /// entry source exists, [`PluginError::BuildFailed`] if a step fails or
    /// no binary appears, [`PluginError::Timeout`] if the build overruns and
    /// [`PluginError::Io`] for filesystem failures.
    pub fn ensure_built(&self, request: BuildRequest<'_>) -> Result<BuildOutcome, PluginError> {
        if request.binary_path.is_file() {
            debug!(
                target: BUILD_TARGET,
                plugin = request.id,
                binary = %request.binary_path.display(),
                "binary present, skipping build"
            );
            return Ok(BuildOutcome::AlreadyBuilt);
        }
        if !request.entry_source.is_file() {
            return Err(PluginError::MissingSource {
                id: request.id.to_owned(),
                binary: request.binary_path.to_path_buf(),
                entry_source: request.entry_source.to_path_buf(),
            });
        }

        let plugin_dir = absolute(request.plugin_dir)?;
        let output = absolute(request.binary_path)?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|source| PluginError::io(parent, source))?;
        }

        let started = Instant::now();
        let deadline = started + self.timeout;
        info!(
            target: BUILD_TARGET,
            plugin = request.id,
            dir = %plugin_dir.display(),
            output = %output.display(),
            "building plugin"
        );

        let script = self.layout.build_script_path(&plugin_dir);
        if script.is_file() {
            self.execute_script(request.id, &plugin_dir, &script, deadline)?;
        } else {
            self.compile(request.id, &plugin_dir, &output, deadline)?;
        }

        if !output.is_file() {
            return Err(PluginError::BuildFailed {
                id: request.id.to_owned(),
                step: String::from("verify"),
                status: None,
                output: format!("build finished without producing {}", output.display()),
            });
        }
        info!(
            target: BUILD_TARGET,
            plugin = request.id,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "plugin built"
        );
        Ok(BuildOutcome::Built)
    }

    /// Runs the plugin's custom build script if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::BuildFailed`] or [`PluginError::Timeout`] when
    /// the script fails or overruns, and [`PluginError::Io`] when the plugin
    /// directory cannot be resolved.
    pub fn run_build_script(&self, id: &str, plugin_dir: &Path) -> Result<ScriptOutcome, PluginError> {
        let dir = absolute(plugin_dir)?;
        let script = self.layout.build_script_path(&dir);
        if !script.is_file() {
            debug!(
                target: BUILD_TARGET,
                plugin = id,
                script = %script.display(),
                "no build script, nothing to build"
            );
            return Ok(ScriptOutcome::NothingToBuild);
        }
        self.execute_script(id, &dir, &script, Instant::now() + self.timeout)?;
        Ok(ScriptOutcome::Completed)
    }

    fn execute_script(
        &self,
        id: &str,
        plugin_dir: &Path,
        script: &Path,
        deadline: Instant,
    ) -> Result<(), PluginError> {
        make_executable(script)?;
        let mut command = Command::new("bash");
        command.arg(script).current_dir(plugin_dir);
        self.run_step(id, "script", command, deadline)
    }

    fn compile(
        &self,
        id: &str,
        plugin_dir: &Path,
        output: &Path,
        deadline: Instant,
    ) -> Result<(), PluginError> {
        let placeholders = Placeholders::new(plugin_dir, output);
        let steps = self
            .toolchain
            .sync
            .iter()
            .chain(std::iter::once(&self.toolchain.compile));
        for step in steps {
            let mut command = Command::new(placeholders.expand(&step.program));
            command
                .args(step.args.iter().map(|arg| placeholders.expand(arg)))
                .current_dir(plugin_dir);
            for (key, value) in &self.toolchain.env {
                command.env(key, placeholders.expand(value));
            }
            self.run_step(id, &step.name, command, deadline)?;
        }

        if let Some(artifact) = &self.toolchain.artifact {
            let produced = PathBuf::from(placeholders.expand(artifact));
            if produced != output {
                fs::copy(&produced, output).map_err(|error| PluginError::BuildFailed {
                    id: id.to_owned(),
                    step: String::from("install"),
                    status: None,
                    output: format!("failed to copy {}: {error}", produced.display()),
                })?;
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        id: &str,
        step: &str,
        mut command: Command,
        deadline: Instant,
    ) -> Result<(), PluginError> {
        debug!(target: BUILD_TARGET, plugin = id, step, ?command, "running build step");
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| PluginError::BuildFailed {
                id: id.to_owned(),
                step: step.to_owned(),
                status: None,
                output: format!("failed to spawn: {error}"),
            })?;

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());
        let status = self.wait_with_deadline(id, step, &mut child, deadline)?;
        let output = combine(stdout, stderr);

        if status.success() {
            return Ok(());
        }
        warn!(
            target: BUILD_TARGET,
            plugin = id,
            step,
            code = status.code(),
            "build step failed"
        );
        Err(PluginError::BuildFailed {
            id: id.to_owned(),
            step: step.to_owned(),
            status: status.code(),
            output,
        })
    }

    fn wait_with_deadline(
        &self,
        id: &str,
        step: &str,
        child: &mut Child,
        deadline: Instant,
    ) -> Result<ExitStatus, PluginError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!(
                        target: BUILD_TARGET,
                        plugin = id,
                        step,
                        "build timed out, killing step"
                    );
                    drop(child.kill());
                    drop(child.wait());
                    return Err(PluginError::Timeout {
                        id: id.to_owned(),
                        operation: TimedOperation::Build,
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(error) => {
                    drop(child.kill());
                    return Err(PluginError::BuildFailed {
                        id: id.to_owned(),
                        step: step.to_owned(),
                        status: None,
                        output: format!("failed to wait for step: {error}"),
                    });
                }
            }
        }
    }
}

struct Placeholders {
    plugin_dir: String,
    output: String,
    output_name: String,
}

impl Placeholders {
    fn new(plugin_dir: &Path, output: &Path) -> Self {
        Self {
            plugin_dir: plugin_dir.display().to_string(),
            output: output.display().to_string(),
            output_name: output
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    fn expand(&self, template: &str) -> String {
        template
            .replace("{plugin_dir}", &self.plugin_dir)
            .replace("{output_name}", &self.output_name)
            .replace("{output}", &self.output)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, PluginError> {
    std::path::absolute(path).map_err(|source| PluginError::io(path, source))
}

#[cfg(unix)]
fn make_executable(script: &Path) -> Result<(), PluginError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(script, fs::Permissions::from_mode(0o755))
        .map_err(|source| PluginError::io(script, source))
}

#[cfg(not(unix))]
fn make_executable(_script: &Path) -> Result<(), PluginError> {
    Ok(())
}

/// Drains a pipe on its own thread so a chatty step cannot fill it and
/// stall.
fn capture(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<String>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            drop(reader.read_to_end(&mut buffer));
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn combine(stdout: Option<JoinHandle<String>>, stderr: Option<JoinHandle<String>>) -> String {
    let collect = |handle: Option<JoinHandle<String>>| {
        handle
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    };
    let mut output = collect(stdout);
    let errors = collect(stderr);
    if !output.is_empty() && !errors.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&errors);
    output.trim_end().to_owned()
}
