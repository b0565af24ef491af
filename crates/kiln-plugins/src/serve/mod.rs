//! Plugin-side SDK: the other half of the handshake and the RPC loop.
//!
//! A plugin binary implements [`PluginService`] and calls [`serve`] from
//! `main`. `serve` refuses to run unless the host's magic cookie is present,
//! negotiates an application protocol version, binds a listener inside the
//! host's port range, prints the handshake line and then answers requests,
//! one thread per connection.

use std::env;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::handshake::{
    HandshakeConfig, HandshakeLine, MAX_PORT_ENV, MIN_PORT_ENV, Network, PROTOCOL_VERSIONS_ENV,
    decode_versions,
};
use crate::protocol::{HEALTH_METHOD, RpcRequest, RpcResponse};
use crate::value::ValueMap;

const SERVE_TARGET: &str = "kiln_plugins::serve";

/// A failure reported by a plugin method, sent to the host as the
/// response's error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MethodError {
    message: String,
}

impl MethodError {
    /// Creates an error carrying `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The conventional error for a method the plugin does not implement.
    #[must_use]
    pub fn unknown_method(method: &str) -> Self {
        Self::new(format!("unknown method: {method}"))
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The methods a plugin exposes.
///
/// # Example
///
/// ```
/// use kiln_plugins::ValueMap;
/// use kiln_plugins::serve::{MethodError, PluginService};
///
/// struct Upper;
///
/// impl PluginService for Upper {
///     fn execute(&self, method: &str, args: ValueMap) -> Result<ValueMap, MethodError> {
///         match method {
///             "echo" => Ok(args),
///             other => Err(MethodError::unknown_method(other)),
///         }
///     }
/// }
///
/// assert!(Upper.execute("shout", ValueMap::new()).is_err());
/// ```
pub trait PluginService: Send + Sync + 'static {
    /// Runs `method` with `args`.
    ///
    /// # Errors
    ///
    /// Returns a [`MethodError`] the host reports as an execution error.
    fn execute(&self, method: &str, args: ValueMap) -> Result<ValueMap, MethodError>;

    /// Reports whether the plugin is healthy. Healthy by default.
    ///
    /// # Errors
    ///
    /// Returns a [`MethodError`] describing the problem.
    fn health_check(&self) -> Result<(), MethodError> {
        Ok(())
    }
}

/// Failures that stop a plugin from serving.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The magic cookie is absent or wrong: the binary was run by hand.
    #[error(
        "this binary is a kiln plugin and must be launched by the kiln host \
         ({key} is not set to the expected value)"
    )]
    NotLaunchedByHost {
        /// The cookie variable name.
        key: String,
    },
    /// No application protocol version is shared with the host.
    #[error("no common protocol version: host offers {offered:?}, plugin supports {supported:?}")]
    NoCommonVersion {
        /// Versions the host accepts.
        offered: Vec<u32>,
        /// Versions the plugin speaks.
        supported: Vec<u32>,
    },
    /// Every port in the range was taken.
    #[error("no free port between {min_port} and {max_port}")]
    NoPortAvailable {
        /// Lowest port tried.
        min_port: u16,
        /// Highest port tried.
        max_port: u16,
    },
    /// Unix sockets were requested on a platform without them.
    #[error("unix sockets are not supported on this platform")]
    UnixUnsupported,
    /// Binding, accepting or writing the handshake failed.
    #[error("plugin I/O failed while {action}: {source}")]
    Io {
        /// What the plugin was doing.
        action: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ServeError {
    const fn io(action: &'static str, source: io::Error) -> Self {
        Self::Io { action, source }
    }
}

/// Where and how the plugin listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    network: Network,
    min_port: u16,
    max_port: u16,
    socket_dir: PathBuf,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            min_port: 0,
            max_port: 0,
            socket_dir: env::temp_dir(),
        }
    }
}

impl ServeOptions {
    /// TCP options with the port range the host passed in the environment.
    /// Missing or malformed values mean "any port".
    #[must_use]
    pub fn from_env() -> Self {
        let port = |key: &str| {
            env::var(key)
                .ok()
                .and_then(|raw| raw.trim().parse::<u16>().ok())
                .unwrap_or(0)
        };
        Self::default().with_port_range(port(MIN_PORT_ENV), port(MAX_PORT_ENV))
    }

    /// Restricts TCP binding to `min_port..=max_port`. Zero on either side
    /// lets the operating system choose.
    #[must_use]
    pub const fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Listens on a Unix socket created inside `dir`.
    #[must_use]
    pub fn with_unix_socket(mut self, dir: impl Into<PathBuf>) -> Self {
        self.network = Network::Unix;
        self.socket_dir = dir.into();
        self
    }

    /// Returns the network.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.network
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// A bound plugin listener ready to announce itself.
pub struct PluginServer {
    listener: Listener,
    app_version: u32,
    address: String,
}

impl fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginServer")
            .field("address", &self.address)
            .field("app_version", &self.app_version)
            .finish_non_exhaustive()
    }
}

impl PluginServer {
    /// Binds a listener as described by `options`.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::NoPortAvailable`] if the whole TCP range is
    /// taken, [`ServeError::UnixUnsupported`] off Unix, or
    /// [`ServeError::Io`] if the socket cannot be created.
    pub fn bind(options: &ServeOptions, app_version: u32) -> Result<Self, ServeError> {
        match options.network {
            Network::Tcp => {
                let listener = bind_tcp(options.min_port, options.max_port)?;
                let address = listener
                    .local_addr()
                    .map_err(|source| ServeError::io("reading the bound address", source))?
                    .to_string();
                Ok(Self {
                    listener: Listener::Tcp(listener),
                    app_version,
                    address,
                })
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = options
                    .socket_dir
                    .join(format!("kiln-plugin-{}.sock", std::process::id()));
                if path.exists() {
                    std::fs::remove_file(&path)
                        .map_err(|source| ServeError::io("removing a stale socket", source))?;
                }
                let listener = UnixListener::bind(&path)
                    .map_err(|source| ServeError::io("binding the unix socket", source))?;
                Ok(Self {
                    address: path.display().to_string(),
                    listener: Listener::Unix(listener, path),
                    app_version,
                })
            }
            #[cfg(not(unix))]
            Network::Unix => Err(ServeError::UnixUnsupported),
        }
    }

    /// The line to print so the host can connect.
    #[must_use]
    pub fn handshake_line(&self) -> HandshakeLine {
        let network = match self.listener {
            Listener::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            Listener::Unix(..) => Network::Unix,
        };
        HandshakeLine::new(self.app_version, network, self.address.clone())
    }

    /// Accepts connections until the listener fails, serving each on its own
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Io`] if accepting a connection fails.
    pub fn run<S: PluginService>(self, service: Arc<S>) -> Result<(), ServeError> {
        match &self.listener {
            Listener::Tcp(listener) => loop {
                let (stream, peer) = listener
                    .accept()
                    .map_err(|source| ServeError::io("accepting a connection", source))?;
                debug!(target: SERVE_TARGET, %peer, "host connected");
                spawn_tcp(stream, Arc::clone(&service));
            },
            #[cfg(unix)]
            Listener::Unix(listener, _) => loop {
                let (stream, _) = listener
                    .accept()
                    .map_err(|source| ServeError::io("accepting a connection", source))?;
                debug!(target: SERVE_TARGET, "host connected over unix socket");
                spawn_unix(stream, Arc::clone(&service));
            },
        }
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        remove_socket(&self.listener);
    }
}

#[cfg(unix)]
fn remove_socket(listener: &Listener) {
    if let Listener::Unix(_, path) = listener {
        drop(std::fs::remove_file(path));
    }
}

#[cfg(not(unix))]
const fn remove_socket(_: &Listener) {}

fn bind_tcp(min_port: u16, max_port: u16) -> Result<TcpListener, ServeError> {
    if min_port == 0 || max_port == 0 {
        return TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|source| ServeError::io("binding a tcp port", source));
    }
    for port in min_port..=max_port {
        if let Ok(listener) = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))) {
            return Ok(listener);
        }
    }
    Err(ServeError::NoPortAvailable { min_port, max_port })
}

fn spawn_tcp<S: PluginService>(stream: TcpStream, service: Arc<S>) {
    thread::spawn(move || {
        let outcome = stream
            .try_clone()
            .and_then(|writer| handle_connection(BufReader::new(stream), writer, service.as_ref()));
        if let Err(error) = outcome {
            debug!(target: SERVE_TARGET, %error, "connection closed with error");
        }
    });
}

#[cfg(unix)]
fn spawn_unix<S: PluginService>(stream: UnixStream, service: Arc<S>) {
    thread::spawn(move || {
        let outcome = stream
            .try_clone()
            .and_then(|writer| handle_connection(BufReader::new(stream), writer, service.as_ref()));
        if let Err(error) = outcome {
            debug!(target: SERVE_TARGET, %error, "connection closed with error");
        }
    });
}

/// Answers request lines from `reader` on `writer` until the host hangs up.
///
/// A line that is not a valid request is answered with an error under id 0
/// and the connection stays open.
///
/// # Errors
///
/// Returns an I/O error if reading or writing fails.
pub fn handle_connection<R, W, S>(reader: R, mut writer: W, service: &S) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    S: PluginService + ?Sized,
{
    for line in reader.lines() {
        let raw = line?;
        if raw.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&raw) {
            Ok(request) => dispatch(service, request),
            Err(error) => {
                warn!(target: SERVE_TARGET, %error, "malformed request");
                RpcResponse::failure(0, format!("malformed request: {error}"))
            }
        };
        let encoded = response.to_line().map_err(io::Error::other)?;
        writer.write_all(encoded.as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

fn dispatch<S: PluginService + ?Sized>(service: &S, request: RpcRequest) -> RpcResponse {
    let id = request.id();
    if request.method() == HEALTH_METHOD {
        return match service.health_check() {
            Ok(()) => RpcResponse::success(id, ValueMap::new()),
            Err(error) => RpcResponse::failure(id, error.message()),
        };
    }
    let method = request.method().to_owned();
    match service.execute(&method, request.into_args()) {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => {
            debug!(target: SERVE_TARGET, method = %method, %error, "method failed");
            RpcResponse::failure(id, error.message())
        }
    }
}

/// Picks the highest version both sides speak. An empty host list means the
/// host did not say, and the plugin's preference stands.
#[must_use]
pub fn negotiate_version(offered: &[u32], supported: &[u32]) -> Option<u32> {
    if offered.is_empty() {
        return supported.iter().copied().max();
    }
    supported
        .iter()
        .copied()
        .filter(|version| offered.contains(version))
        .max()
}

/// Runs `service` as a plugin of the host described by `config`.
///
/// Checks the cookie, negotiates the protocol version, binds within the
/// host's port range, writes the handshake line to stdout and serves until
/// the listener fails. Does not return on success.
///
/// # Errors
///
/// Returns [`ServeError::NotLaunchedByHost`] when the cookie is missing,
/// [`ServeError::NoCommonVersion`] when negotiation fails, or a bind or
/// I/O failure.
pub fn serve<S: PluginService>(config: &HandshakeConfig, service: S) -> Result<(), ServeError> {
    let cookie = env::var(config.magic_cookie_key()).ok();
    if cookie.as_deref() != Some(config.magic_cookie_value()) {
        return Err(ServeError::NotLaunchedByHost {
            key: config.magic_cookie_key().to_owned(),
        });
    }

    let offered = env::var(PROTOCOL_VERSIONS_ENV)
        .map(|raw| decode_versions(&raw))
        .unwrap_or_default();
    let app_version = negotiate_version(&offered, config.protocol_versions()).ok_or_else(|| {
        ServeError::NoCommonVersion {
            offered: offered.clone(),
            supported: config.protocol_versions().to_vec(),
        }
    })?;

    let server = PluginServer::bind(&ServeOptions::from_env(), app_version)?;
    let line = server.handshake_line();
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")
        .and_then(|()| stdout.flush())
        .map_err(|source| ServeError::io("writing the handshake line", source))?;
    drop(stdout);
    info!(target: SERVE_TARGET, address = line.address(), version = app_version, "plugin serving");

    server.run(Arc::new(service))
}

#[cfg(test)]
mod tests;
