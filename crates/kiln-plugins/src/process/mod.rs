//! Process supervisor: spawning plugin binaries and completing the handshake.
//!
//! [`ProcessSupervisor`] starts the plugin binary with its working directory
//! set to the plugin directory and the handshake variables in its
//! environment, then waits (bounded by the start timeout) for the handshake
//! line on the child's stdout. Anything the plugin writes afterwards, and
//! everything on stderr, is forwarded to `tracing` at info level under
//! [`PLUGIN_OUTPUT_TARGET`].
//!
//! The supervisor does not watch liveness in the background. A plugin that
//! dies after its handshake is noticed by the next call.

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::descriptor::{PluginDescriptor, ProcessInfo};
use crate::dispatch::{Endpoint, RpcClient};
use crate::error::PluginError;
use crate::handshake::{
    HandshakeConfig, HandshakeLine, MAX_PORT_ENV, MIN_PORT_ENV, PROTOCOL_VERSIONS_ENV,
};
use crate::launcher::{PluginHandle, PluginLauncher};
use crate::value::ValueMap;

/// Tracing target for plugin process operations.
const PROCESS_TARGET: &str = "kiln_plugins::process";

/// Tracing target carrying the lines plugins write to stdout and stderr.
pub const PLUGIN_OUTPUT_TARGET: &str = "kiln_plugins::output";

/// Handshake bound used when a manifest leaves `start_timeout` at zero.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a managed plugin gets to exit after `SIGTERM`.
const STOP_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns plugin processes and performs the handshake.
///
/// # Example
///
/// ```rust,no_run
/// use kiln_plugins::process::ProcessSupervisor;
/// use kiln_plugins::HandshakeConfig;
/// use std::time::Duration;
///
/// let supervisor = ProcessSupervisor::new(HandshakeConfig::default())
///     .with_default_start_timeout(Duration::from_secs(10));
/// // supervisor.start(&descriptor) spawns the plugin and waits for its handshake.
/// ```
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    handshake: HandshakeConfig,
    default_start_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor using `handshake` for every plugin.
    #[must_use]
    pub const fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            default_start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Overrides the handshake bound used when a manifest does not set one.
    #[must_use]
    pub const fn with_default_start_timeout(mut self, timeout: Duration) -> Self {
        self.default_start_timeout = timeout;
        self
    }

    /// Returns the handshake configuration.
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    /// Handshake bound applied when a manifest's `start_timeout` is 0.
    #[must_use]
    pub const fn default_start_timeout(&self) -> Duration {
        self.default_start_timeout
    }

    /// Spawns the plugin and waits for its handshake.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StartFailed`] if the binary is missing, the
    /// process cannot be spawned, exits early, or its handshake line is late,
    /// malformed or incompatible. The child is killed in every failure case.
    pub fn start(&self, descriptor: &PluginDescriptor) -> Result<PluginProcess, PluginError> {
        let id = descriptor.id();
        let manifest = descriptor.manifest();
        let binary = descriptor.binary_path();
        if !binary.is_absolute() || !binary.is_file() {
            return Err(PluginError::start_failed(
                id,
                format!("binary {} is not an existing absolute path", binary.display()),
            ));
        }
        let timeout = match manifest.start_timeout_ms() {
            0 => self.default_start_timeout,
            millis => Duration::from_millis(millis),
        };
        if manifest.auto_mtls() {
            warn!(
                target: PROCESS_TARGET,
                plugin = id,
                "auto_mtls requested but the jsonl transport does not negotiate TLS"
            );
        }

        let mut child = Command::new(binary)
            .current_dir(descriptor.plugin_dir())
            .env(
                self.handshake.magic_cookie_key(),
                self.handshake.magic_cookie_value(),
            )
            .env(PROTOCOL_VERSIONS_ENV, self.handshake.encode_versions())
            .env(MIN_PORT_ENV, manifest.min_port().to_string())
            .env(MAX_PORT_ENV, manifest.max_port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PluginError::StartFailed {
                id: id.to_owned(),
                message: format!("failed to spawn {}", binary.display()),
                source: Some(Arc::new(source)),
            })?;
        let pid = child.id();
        debug!(
            target: PROCESS_TARGET,
            plugin = id,
            pid,
            binary = %binary.display(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "plugin spawned, awaiting handshake"
        );

        if let Some(stderr) = child.stderr.take() {
            forward_lines(id.to_owned(), "stderr", BufReader::new(stderr));
        }
        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(PluginError::start_failed(id, "plugin stdout was not captured"));
        };

        let line = match self.read_handshake(id, stdout, timeout, &mut child) {
            Ok(line) => line,
            Err(error) => {
                warn!(target: PROCESS_TARGET, plugin = id, pid, %error, "plugin failed to start");
                return Err(error);
            }
        };
        let info = ProcessInfo::new(pid, line.app_version(), line.protocol().as_str(), line.address());
        info!(
            target: PROCESS_TARGET,
            plugin = id,
            pid,
            address = line.address(),
            network = %line.network(),
            version = line.app_version(),
            "plugin started"
        );
        Ok(PluginProcess {
            id: id.to_owned(),
            binary: binary.to_path_buf(),
            managed: manifest.managed(),
            client: RpcClient::new(id, Endpoint::from_handshake(&line)),
            info,
            child: Arc::new(Mutex::new(child)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Waits for and checks the handshake line, killing the child on any
    /// failure.
    fn read_handshake(
        &self,
        id: &str,
        stdout: ChildStdout,
        timeout: Duration,
        child: &mut Child,
    ) -> Result<HandshakeLine, PluginError> {
        let raw = match await_first_line(id, stdout, timeout) {
            FirstLine::Line(raw) => raw,
            FirstLine::Closed => {
                let status = reap(child);
                return Err(PluginError::start_failed(
                    id,
                    format!(
                        "plugin exited before completing the handshake ({})",
                        describe_exit(status)
                    ),
                ));
            }
            FirstLine::Failed(source) => {
                reap(child);
                return Err(PluginError::StartFailed {
                    id: id.to_owned(),
                    message: String::from("failed to read the handshake line"),
                    source: Some(Arc::new(source)),
                });
            }
            FirstLine::TimedOut => {
                reap(child);
                return Err(PluginError::start_failed(
                    id,
                    format!(
                        "no handshake within {}ms",
                        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
                    ),
                ));
            }
        };

        let checked = raw
            .parse::<HandshakeLine>()
            .and_then(|line| line.validate(&self.handshake).map(|()| line));
        checked.map_err(|error| {
            reap(child);
            PluginError::start_failed(id, format!("invalid handshake '{}': {error}", raw.trim()))
        })
    }
}

impl PluginLauncher for ProcessSupervisor {
    fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn PluginHandle>, PluginError> {
        Ok(Arc::new(self.start(descriptor)?))
    }
}

/// A running plugin process and its RPC client.
#[derive(Debug)]
pub struct PluginProcess {
    id: String,
    binary: PathBuf,
    managed: bool,
    info: ProcessInfo,
    client: RpcClient,
    child: Arc<Mutex<Child>>,
    stopped: AtomicBool,
}

impl PluginProcess {
    /// Returns the RPC client bound to the plugin's listener.
    #[must_use]
    pub const fn client(&self) -> &RpcClient {
        &self.client
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PluginHandle for PluginProcess {
    fn process_info(&self) -> ProcessInfo {
        self.info.clone().with_exited(self.has_exited())
    }

    fn invoke(
        &self,
        method: &str,
        args: &ValueMap,
        ctx: &CallContext,
    ) -> Result<ValueMap, PluginError> {
        self.client.call(method, args, ctx)
    }

    fn health_check(&self, ctx: &CallContext) -> Result<(), PluginError> {
        self.client.health_check(ctx)
    }

    fn has_exited(&self) -> bool {
        !matches!(self.lock_child().try_wait(), Ok(None))
    }

    fn stop(&self) -> Result<(), PluginError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.client.close_idle();
        let mut child = self.lock_child();
        if !matches!(child.try_wait(), Ok(None)) {
            debug!(target: PROCESS_TARGET, plugin = %self.id, "plugin already exited");
            return Ok(());
        }

        terminate(&mut child).map_err(|source| PluginError::io(&self.binary, source))?;
        if !self.managed {
            debug!(
                target: PROCESS_TARGET,
                plugin = %self.id,
                pid = self.info.os_pid(),
                "termination signalled to unmanaged plugin"
            );
            drop(child);
            reap_when_exited(self.id.clone(), Arc::clone(&self.child));
            return Ok(());
        }

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(target: PROCESS_TARGET, plugin = %self.id, %status, "plugin stopped");
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!(
            target: PROCESS_TARGET,
            plugin = %self.id,
            grace_ms = u64::try_from(STOP_GRACE.as_millis()).unwrap_or(u64::MAX),
            "plugin ignored termination, killing"
        );
        reap(&mut child);
        Ok(())
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        if !self.managed || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut child = self.lock_child();
        if matches!(child.try_wait(), Ok(None)) {
            reap(&mut child);
        }
    }
}

enum FirstLine {
    Line(String),
    Closed,
    Failed(io::Error),
    TimedOut,
}

/// Reads the first stdout line on a helper thread so the wait can be
/// bounded; the thread keeps forwarding later output once the line is in.
fn await_first_line(id: &str, stdout: ChildStdout, timeout: Duration) -> FirstLine {
    let (sender, receiver) = mpsc::channel();
    let plugin = id.to_owned();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut first = String::new();
        let outcome = match reader.read_line(&mut first) {
            Ok(0) => FirstLine::Closed,
            Ok(_) => FirstLine::Line(first),
            Err(error) => FirstLine::Failed(error),
        };
        let handshake_seen = matches!(outcome, FirstLine::Line(_));
        drop(sender.send(outcome));
        if handshake_seen {
            forward_stream(&plugin, "stdout", reader);
        }
    });
    match receiver.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => FirstLine::TimedOut,
        Err(RecvTimeoutError::Disconnected) => FirstLine::Closed,
    }
}

fn forward_lines(plugin: String, stream: &'static str, reader: impl BufRead + Send + 'static) {
    thread::spawn(move || forward_stream(&plugin, stream, reader));
}

fn forward_stream(plugin: &str, stream: &'static str, reader: impl BufRead) {
    for line in reader.lines().map_while(Result::ok) {
        info!(target: PLUGIN_OUTPUT_TARGET, plugin, stream, "{line}");
    }
}

/// Collects the exit status of a signalled plugin on a detached thread, so an
/// unmanaged plugin that exits later does not linger as a zombie.
fn reap_when_exited(plugin: String, child: Arc<Mutex<Child>>) {
    thread::spawn(move || {
        loop {
            let polled = child.lock().unwrap_or_else(PoisonError::into_inner).try_wait();
            match polled {
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Ok(Some(status)) => {
                    debug!(target: PROCESS_TARGET, plugin = %plugin, %status, "unmanaged plugin reaped");
                    break;
                }
                Err(error) => {
                    warn!(target: PROCESS_TARGET, plugin = %plugin, %error, "could not reap plugin");
                    break;
                }
            }
        }
    });
}

/// Kills the child unless it already exited, then reaps it.
fn reap(child: &mut Child) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    drop(child.kill());
    child.wait().ok()
}

fn describe_exit(status: Option<ExitStatus>) -> String {
    status.map_or_else(|| String::from("exit status unknown"), |code| code.to_string())
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(child.id()).map_err(io::Error::other)?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}
