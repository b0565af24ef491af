//! Execution dispatcher: method calls over a plugin's RPC channel.
//!
//! [`RpcClient`] owns a small pool of idle connections to one plugin. A call
//! checks a connection out (opening a new one if the pool is empty), writes
//! one request line and waits for the matching response in short read slices
//! so the caller's deadline and cancellation token are honoured while
//! blocked. A connection that timed out, was cancelled or misbehaved is
//! dropped rather than returned to the pool.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::CallContext;
use crate::error::{PluginError, TimedOperation};
use crate::handshake::{HandshakeLine, Network};
use crate::protocol::{HEALTH_METHOD, RpcRequest, RpcResponse};
use crate::value::ValueMap;

const DISPATCH_TARGET: &str = "kiln_plugins::dispatch";

/// Longest single blocking read before the context is checked again.
const READ_SLICE: Duration = Duration::from_millis(50);
/// Socket timeouts must be non-zero.
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Where a plugin's RPC listener lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP `host:port` address.
    Tcp(String),
    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Derives the endpoint announced in a handshake line.
    #[must_use]
    pub fn from_handshake(line: &HandshakeLine) -> Self {
        match line.network() {
            Network::Tcp => Self::Tcp(line.address().to_owned()),
            Network::Unix => Self::Unix(PathBuf::from(line.address())),
        }
    }

    fn connect(&self, timeout: Duration) -> io::Result<Stream> {
        match self {
            Self::Tcp(address) => {
                let mut last_error = None;
                for candidate in address.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&candidate, timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(Stream::Tcp(stream));
                        }
                        Err(error) => last_error = Some(error),
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")
                }))
            }
            #[cfg(unix)]
            Self::Unix(path) => UnixStream::connect(path).map(Stream::Unix),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp://{address}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(Some(timeout)),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(Some(timeout)),
        }
    }

    fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_write_timeout(Some(timeout)),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_write_timeout(Some(timeout)),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

type Connection = BufReader<Stream>;

/// Client for one plugin's RPC listener.
pub struct RpcClient {
    id: String,
    endpoint: Endpoint,
    idle: Mutex<Vec<Connection>>,
    next_request: AtomicU64,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Creates a client for plugin `id` listening at `endpoint`. No
    /// connection is opened until the first call.
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            idle: Mutex::new(Vec::new()),
            next_request: AtomicU64::new(1),
        }
    }

    /// Returns the endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Invokes `method` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ClientObtainFailed`] when no connection can be
    /// opened, [`PluginError::Transport`] when the connection fails
    /// mid-call, [`PluginError::Protocol`] for malformed or mismatched
    /// responses, [`PluginError::Execution`] for plugin-reported failures
    /// and [`PluginError::Timeout`] or [`PluginError::Cancelled`] when `ctx`
    /// ends the wait.
    pub fn call(
        &self,
        method: &str,
        args: &ValueMap,
        ctx: &CallContext,
    ) -> Result<ValueMap, PluginError> {
        ctx.check(&self.id, TimedOperation::Call)?;
        let request = RpcRequest::new(
            self.next_request.fetch_add(1, Ordering::Relaxed),
            method,
            args.clone(),
        );
        let line = request.to_line().map_err(|error| PluginError::Protocol {
            id: self.id.clone(),
            message: format!("failed to encode request: {error}"),
        })?;

        let started = Instant::now();
        let mut connection = self.checkout(ctx)?;
        let response = self.exchange(&mut connection, &line, request.id(), ctx)?;
        self.checkin(connection);
        debug!(
            target: DISPATCH_TARGET,
            plugin = %self.id,
            method,
            request = request.id(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "plugin call returned"
        );

        response
            .into_outcome()
            .map_err(|failure| PluginError::Execution {
                id: self.id.clone(),
                method: method.to_owned(),
                message: failure.message().to_owned(),
            })
    }

    /// Runs the plugin's health check.
    ///
    /// # Errors
    ///
    /// As for [`RpcClient::call`].
    pub fn health_check(&self, ctx: &CallContext) -> Result<(), PluginError> {
        self.call(HEALTH_METHOD, &ValueMap::new(), ctx).map(drop)
    }

    /// Closes every pooled connection.
    pub fn close_idle(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn checkout(&self, ctx: &CallContext) -> Result<Connection, PluginError> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(connection) = pooled {
            return Ok(connection);
        }
        let stream = self
            .endpoint
            .connect(ctx.remaining().max(MIN_IO_TIMEOUT))
            .map_err(|source| PluginError::ClientObtainFailed {
                id: self.id.clone(),
                message: format!("cannot connect to {}", self.endpoint),
                source: Some(Arc::new(source)),
            })?;
        debug!(
            target: DISPATCH_TARGET,
            plugin = %self.id,
            endpoint = %self.endpoint,
            "opened plugin connection"
        );
        Ok(BufReader::new(stream))
    }

    fn checkin(&self, connection: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }

    fn exchange(
        &self,
        connection: &mut Connection,
        line: &str,
        request_id: u64,
        ctx: &CallContext,
    ) -> Result<RpcResponse, PluginError> {
        let stream = connection.get_mut();
        stream
            .set_write_timeout(ctx.remaining().max(MIN_IO_TIMEOUT))
            .and_then(|()| stream.write_all(line.as_bytes()))
            .and_then(|()| stream.flush())
            .map_err(|source| self.transport("failed to send request", source))?;

        let mut frame = Vec::new();
        loop {
            ctx.check(&self.id, TimedOperation::Call)?;
            let slice = ctx.remaining().clamp(MIN_IO_TIMEOUT, READ_SLICE);
            connection
                .get_ref()
                .set_read_timeout(slice)
                .map_err(|source| self.transport("failed to arm read timeout", source))?;
            match connection.read_until(b'\n', &mut frame) {
                Ok(0) => {
                    return Err(self.transport(
                        "plugin closed the connection",
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ));
                }
                Ok(_) if frame.ends_with(b"\n") => break,
                Ok(_) => {
                    return Err(self.transport(
                        "connection closed mid-response",
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ));
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(error) => return Err(self.transport("failed to read response", error)),
            }
        }

        let response: RpcResponse =
            serde_json::from_slice(&frame).map_err(|error| PluginError::Protocol {
                id: self.id.clone(),
                message: format!("malformed response: {error}"),
            })?;
        if response.id() != request_id {
            return Err(PluginError::Protocol {
                id: self.id.clone(),
                message: format!(
                    "response id {} does not match request id {request_id}",
                    response.id()
                ),
            });
        }
        Ok(response)
    }

    fn transport(&self, message: &str, source: io::Error) -> PluginError {
        PluginError::Transport {
            id: self.id.clone(),
            message: format!("{message}: {source}"),
            source: Some(Arc::new(source)),
        }
    }
}
