//! RPC frames exchanged with a running plugin.
//!
//! After the handshake the host connects to the announced address and speaks
//! `jsonl`: each [`RpcRequest`] is one JSON line, answered by exactly one
//! [`RpcResponse`] line carrying the same id. A connection carries one call
//! at a time and may be reused for the next.

use serde::{Deserialize, Serialize};

use crate::value::ValueMap;

/// Reserved method name for health checks.
pub const HEALTH_METHOD: &str = "kiln.health";

/// A method call sent from the host to a plugin.
///
/// # Example
///
/// ```
/// use kiln_plugins::protocol::RpcRequest;
/// use kiln_plugins::ValueMap;
///
/// let request = RpcRequest::new(7, "greet", ValueMap::new());
/// let line = request.to_line().expect("encode request");
/// assert_eq!(line, "{\"id\":7,\"method\":\"greet\",\"args\":{}}\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    args: ValueMap,
}

impl RpcRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, args: ValueMap) -> Self {
        Self {
            id,
            method: method.into(),
            args,
        }
    }

    /// Correlation id echoed by the response.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Method name.
    #[must_use]
    pub const fn method(&self) -> &str {
        self.method.as_str()
    }

    /// Arguments.
    #[must_use]
    pub const fn args(&self) -> &ValueMap {
        &self.args
    }

    /// Consumes the request, returning its arguments.
    #[must_use]
    pub fn into_args(self) -> ValueMap {
        self.args
    }

    /// Encodes the request as a newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error if encoding fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        encode_line(self)
    }
}

/// Failure reported by the plugin for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    message: String,
}

impl RpcFailure {
    /// Creates a failure with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Message reported by the plugin.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// A plugin's answer to one [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ValueMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcFailure>,
}

impl RpcResponse {
    /// Creates a successful response.
    #[must_use]
    pub const fn success(id: u64, result: ValueMap) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcFailure::new(message)),
        }
    }

    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Converts the response into the call outcome. A response with neither
    /// field set is an empty success.
    ///
    /// # Errors
    ///
    /// Returns the plugin-reported [`RpcFailure`].
    pub fn into_outcome(self) -> Result<ValueMap, RpcFailure> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(self.result.unwrap_or_default()),
        }
    }

    /// Encodes the response as a newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error if encoding fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        encode_line(self)
    }
}

fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests;
