//! Domain errors raised by plugin operations.
//!
//! Every failure surfaced by discovery, the build pipeline, the process
//! supervisor, the dispatcher or the registry is a [`PluginError`]. Variants
//! carry structured context so the routing layer can map them onto its own
//! status codes without parsing messages. I/O errors are wrapped in `Arc` to
//! keep the enum cheap to move and to satisfy the `result_large_err` lint.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Operation that was bounded by a deadline when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimedOperation {
    /// A build step (sync, compile or custom script).
    Build,
    /// Waiting for the plugin handshake line.
    Handshake,
    /// A method call dispatched to a running plugin.
    Call,
}

impl TimedOperation {
    /// Returns the lower-case label used in log lines and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Handshake => "handshake",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for TimedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors arising from plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A plugin with the same id is already live in the registry.
    #[error("plugin '{id}' is already registered")]
    AlreadyRegistered {
        /// Conflicting plugin id.
        id: String,
    },

    /// The plugin id is unknown to the registry or to discovery.
    #[error("plugin '{id}' not found")]
    NotFound {
        /// Id that was looked up.
        id: String,
    },

    /// Neither a binary nor an entry source exists, so nothing can be built.
    #[error(
        "plugin '{id}' has no binary at {} and no entry source at {}",
        binary.display(),
        entry_source.display()
    )]
    MissingSource {
        /// Plugin id.
        id: String,
        /// Expected binary path.
        binary: PathBuf,
        /// Expected entry source path.
        entry_source: PathBuf,
    },

    /// A build step exited unsuccessfully or left no binary behind.
    #[error("plugin '{id}' build step '{step}' failed ({}): {output}", describe_status(*status))]
    BuildFailed {
        /// Plugin id.
        id: String,
        /// Name of the failing step.
        step: String,
        /// Exit code of the step, if it exited normally.
        status: Option<i32>,
        /// Combined standard output and standard error of the step.
        output: String,
    },

    /// Spawning the plugin or completing its handshake failed.
    #[error("plugin '{id}' failed to start: {message}")]
    StartFailed {
        /// Plugin id.
        id: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// No RPC channel could be opened to a live plugin.
    #[error("failed to obtain a client for plugin '{id}': {message}")]
    ClientObtainFailed {
        /// Plugin id.
        id: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The RPC channel failed mid-call.
    #[error("transport error talking to plugin '{id}': {message}")]
    Transport {
        /// Plugin id.
        id: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The plugin reported a failure for the requested method.
    #[error("plugin '{id}' failed to execute '{method}': {message}")]
    Execution {
        /// Plugin id.
        id: String,
        /// Method that was invoked.
        method: String,
        /// Message reported by the plugin.
        message: String,
    },

    /// The operation's deadline elapsed.
    #[error("plugin '{id}' {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Plugin id.
        id: String,
        /// Operation that overran its deadline.
        operation: TimedOperation,
        /// Configured budget in milliseconds.
        timeout_ms: u64,
    },

    /// The caller cancelled the operation.
    #[error("plugin '{id}' {operation} was cancelled")]
    Cancelled {
        /// Plugin id.
        id: String,
        /// Operation that was abandoned.
        operation: TimedOperation,
    },

    /// A manifest file could not be decoded.
    #[error("failed to parse manifest {}: {message}", path.display())]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// A manifest decoded but failed validation.
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of the validation failure.
        message: String,
    },

    /// The plugin violated the RPC framing rules.
    #[error("plugin '{id}' broke the RPC protocol: {message}")]
    Protocol {
        /// Plugin id.
        id: String,
        /// Description of the violation.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },
}

fn describe_status(status: Option<i32>) -> String {
    status.map_or_else(
        || String::from("terminated without an exit code"),
        |code| format!("exit status {code}"),
    )
}

/// Coarse classification of [`PluginError`] for callers that map failures
/// onto their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginErrorKind {
    /// See [`PluginError::AlreadyRegistered`].
    AlreadyRegistered,
    /// See [`PluginError::NotFound`].
    NotFound,
    /// See [`PluginError::MissingSource`].
    MissingSource,
    /// See [`PluginError::BuildFailed`].
    BuildFailed,
    /// See [`PluginError::StartFailed`].
    StartFailed,
    /// See [`PluginError::ClientObtainFailed`].
    ClientObtainFailed,
    /// See [`PluginError::Transport`].
    Transport,
    /// See [`PluginError::Execution`].
    Execution,
    /// See [`PluginError::Timeout`].
    Timeout,
    /// See [`PluginError::Cancelled`].
    Cancelled,
    /// See [`PluginError::ManifestParse`] and [`PluginError::Manifest`].
    Manifest,
    /// See [`PluginError::Protocol`].
    Protocol,
    /// See [`PluginError::Io`].
    Io,
}

impl PluginError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> PluginErrorKind {
        match self {
            Self::AlreadyRegistered { .. } => PluginErrorKind::AlreadyRegistered,
            Self::NotFound { .. } => PluginErrorKind::NotFound,
            Self::MissingSource { .. } => PluginErrorKind::MissingSource,
            Self::BuildFailed { .. } => PluginErrorKind::BuildFailed,
            Self::StartFailed { .. } => PluginErrorKind::StartFailed,
            Self::ClientObtainFailed { .. } => PluginErrorKind::ClientObtainFailed,
            Self::Transport { .. } => PluginErrorKind::Transport,
            Self::Execution { .. } => PluginErrorKind::Execution,
            Self::Timeout { .. } => PluginErrorKind::Timeout,
            Self::Cancelled { .. } => PluginErrorKind::Cancelled,
            Self::ManifestParse { .. } | Self::Manifest { .. } => PluginErrorKind::Manifest,
            Self::Protocol { .. } => PluginErrorKind::Protocol,
            Self::Io { .. } => PluginErrorKind::Io,
        }
    }

    /// Whether retrying the same call against the same plugin may succeed.
    ///
    /// Only channel failures and deadline overruns qualify. Plugin-reported
    /// failures are deterministic and are never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            PluginErrorKind::ClientObtainFailed
                | PluginErrorKind::Transport
                | PluginErrorKind::Timeout
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn start_failed(id: &str, message: impl Into<String>) -> Self {
        Self::StartFailed {
            id: id.to_owned(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        Self::NotFound { id: id.to_owned() }
    }
}
