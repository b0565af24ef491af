//! Start-up handshake shared by the host and its plugins.
//!
//! The host passes a magic cookie and the protocol versions it accepts to the
//! child through environment variables. A plugin that recognises the cookie
//! binds its RPC listener and announces it with a single stdout line:
//!
//! ```text
//! <core-version>|<app-version>|<network>|<address>|<protocol>
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;
/// Default magic cookie variable name.
pub const DEFAULT_MAGIC_COOKIE_KEY: &str = "KILN_PLUGIN";
/// Default magic cookie value.
pub const DEFAULT_MAGIC_COOKIE_VALUE: &str = "kiln-plugin";
/// Variable carrying the comma-separated application versions the host
/// accepts.
pub const PROTOCOL_VERSIONS_ENV: &str = "KILN_PLUGIN_PROTOCOL_VERSIONS";
/// Variable carrying the lowest port the plugin may bind.
pub const MIN_PORT_ENV: &str = "KILN_PLUGIN_MIN_PORT";
/// Variable carrying the highest port the plugin may bind.
pub const MAX_PORT_ENV: &str = "KILN_PLUGIN_MAX_PORT";

/// Shared secret and version list agreed between host and plugins.
///
/// # Example
///
/// ```
/// use kiln_plugins::HandshakeConfig;
///
/// let config = HandshakeConfig::default().with_protocol_versions(vec![1, 2]);
/// assert_eq!(config.preferred_version(), Some(2));
/// assert!(config.accepts(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    magic_cookie_key: String,
    magic_cookie_value: String,
    protocol_versions: Vec<u32>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAGIC_COOKIE_KEY, DEFAULT_MAGIC_COOKIE_VALUE)
    }
}

impl HandshakeConfig {
    /// Creates a configuration accepting application protocol version 1.
    #[must_use]
    pub fn new(magic_cookie_key: impl Into<String>, magic_cookie_value: impl Into<String>) -> Self {
        Self {
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
            protocol_versions: vec![1],
        }
    }

    /// Replaces the accepted application protocol versions.
    #[must_use]
    pub fn with_protocol_versions(mut self, versions: Vec<u32>) -> Self {
        self.protocol_versions = versions;
        self
    }

    /// Magic cookie variable name.
    #[must_use]
    pub const fn magic_cookie_key(&self) -> &str {
        self.magic_cookie_key.as_str()
    }

    /// Magic cookie value.
    #[must_use]
    pub const fn magic_cookie_value(&self) -> &str {
        self.magic_cookie_value.as_str()
    }

    /// Accepted application protocol versions.
    #[must_use]
    pub fn protocol_versions(&self) -> &[u32] {
        &self.protocol_versions
    }

    /// Whether `version` is acceptable. An empty list states no preference
    /// and accepts every version.
    #[must_use]
    pub fn accepts(&self, version: u32) -> bool {
        self.protocol_versions.is_empty() || self.protocol_versions.contains(&version)
    }

    /// Highest accepted version.
    #[must_use]
    pub fn preferred_version(&self) -> Option<u32> {
        self.protocol_versions.iter().copied().max()
    }

    /// Encodes the version list for [`PROTOCOL_VERSIONS_ENV`].
    #[must_use]
    pub fn encode_versions(&self) -> String {
        self.protocol_versions
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parses a [`PROTOCOL_VERSIONS_ENV`] value, ignoring malformed entries.
#[must_use]
pub fn decode_versions(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Address family of the plugin's RPC listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// A TCP socket, address `host:port`.
    Tcp,
    /// A Unix domain socket, address is a filesystem path.
    Unix,
}

impl Network {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = HandshakeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(HandshakeError::UnknownNetwork(other.to_owned())),
        }
    }
}

/// RPC framing spoken over the announced address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcProtocol {
    /// One JSON object per line.
    Jsonl,
}

impl RpcProtocol {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for RpcProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcProtocol {
    type Err = HandshakeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "jsonl" => Ok(Self::Jsonl),
            other => Err(HandshakeError::UnknownProtocol(other.to_owned())),
        }
    }
}

/// Failures while parsing or validating a handshake line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The line did not have five `|`-separated fields.
    #[error("expected 5 handshake fields, found {0}")]
    FieldCount(usize),
    /// A version field was not an unsigned integer.
    #[error("invalid {field} version '{value}'")]
    InvalidVersion {
        /// Which version field.
        field: &'static str,
        /// Raw field text.
        value: String,
    },
    /// The core version does not match [`CORE_PROTOCOL_VERSION`].
    #[error(
        "core protocol version {found} is not supported (expected {})",
        CORE_PROTOCOL_VERSION
    )]
    CoreVersion {
        /// Version announced by the plugin.
        found: u32,
    },
    /// The application version is not in the host's accepted list.
    #[error("application protocol version {found} is not one of {accepted:?}")]
    AppVersion {
        /// Version announced by the plugin.
        found: u32,
        /// Versions the host accepts.
        accepted: Vec<u32>,
    },
    /// The network field is neither `tcp` nor `unix`.
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),
    /// The protocol field names an unsupported framing.
    #[error("unknown RPC protocol '{0}'")]
    UnknownProtocol(String),
    /// The address field is empty.
    #[error("handshake address is empty")]
    EmptyAddress,
}

/// The line a plugin writes to announce its listener.
///
/// # Example
///
/// ```
/// use kiln_plugins::{HandshakeLine, Network};
///
/// let line: HandshakeLine = "1|1|tcp|127.0.0.1:4000|jsonl".parse().expect("valid line");
/// assert_eq!(line.network(), Network::Tcp);
/// assert_eq!(line.to_string(), "1|1|tcp|127.0.0.1:4000|jsonl");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    core_version: u32,
    app_version: u32,
    network: Network,
    address: String,
    protocol: RpcProtocol,
}

impl HandshakeLine {
    /// Creates a line using the current core version and `jsonl` framing.
    #[must_use]
    pub fn new(app_version: u32, network: Network, address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network,
            address: address.into(),
            protocol: RpcProtocol::Jsonl,
        }
    }

    /// Checks the line against what the host accepts.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::CoreVersion`] or
    /// [`HandshakeError::AppVersion`] on a version mismatch.
    pub fn validate(&self, config: &HandshakeConfig) -> Result<(), HandshakeError> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion {
                found: self.core_version,
            });
        }
        if !config.accepts(self.app_version) {
            return Err(HandshakeError::AppVersion {
                found: self.app_version,
                accepted: config.protocol_versions().to_vec(),
            });
        }
        Ok(())
    }

    /// Negotiated application protocol version.
    #[must_use]
    pub const fn app_version(&self) -> u32 {
        self.app_version
    }

    /// Listener address family.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.network
    }

    /// Listener address.
    #[must_use]
    pub const fn address(&self) -> &str {
        self.address.as_str()
    }

    /// RPC framing.
    #[must_use]
    pub const fn protocol(&self) -> RpcProtocol {
        self.protocol
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = raw.trim().split('|').collect();
        let [core, app, network, address, protocol] = fields.as_slice() else {
            return Err(HandshakeError::FieldCount(fields.len()));
        };
        let parse_version = |field: &'static str, value: &str| {
            value
                .parse::<u32>()
                .map_err(|_| HandshakeError::InvalidVersion {
                    field,
                    value: value.to_owned(),
                })
        };
        if address.is_empty() {
            return Err(HandshakeError::EmptyAddress);
        }
        Ok(Self {
            core_version: parse_version("core", *core)?,
            app_version: parse_version("app", *app)?,
            network: network.parse()?,
            address: (*address).to_owned(),
            protocol: protocol.parse()?,
        })
    }
}

#[cfg(test)]
mod tests;
