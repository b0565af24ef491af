//! Seams between the registry and the processes it supervises.
//!
//! The registry never spawns processes or talks to sockets itself. It asks a
//! [`PluginLauncher`] to start a plugin and receives a [`PluginHandle`] it
//! can call, probe and stop. The production implementation is
//! [`ProcessSupervisor`](crate::process::ProcessSupervisor); tests substitute
//! in-memory doubles.

use std::sync::Arc;

use crate::context::CallContext;
use crate::descriptor::{PluginDescriptor, ProcessInfo};
use crate::error::PluginError;
use crate::value::ValueMap;

/// A started plugin.
///
/// # Example
///
/// ```
/// use kiln_plugins::{CallContext, PluginError, PluginHandle, ProcessInfo, ValueMap};
///
/// struct Inline;
///
/// impl PluginHandle for Inline {
///     fn process_info(&self) -> ProcessInfo {
///         ProcessInfo::new(1, 1, "inline", "memory")
///     }
///     fn invoke(&self, _: &str, args: &ValueMap, _: &CallContext) -> Result<ValueMap, PluginError> {
///         Ok(args.clone())
///     }
///     fn health_check(&self, _: &CallContext) -> Result<(), PluginError> {
///         Ok(())
///     }
///     fn has_exited(&self) -> bool {
///         false
///     }
///     fn stop(&self) -> Result<(), PluginError> {
///         Ok(())
///     }
/// }
/// ```
pub trait PluginHandle: Send + Sync {
    /// Runtime facts captured at start, with `has_exited` refreshed.
    fn process_info(&self) -> ProcessInfo;

    /// Invokes `method` with `args`, bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's classification of the failure.
    fn invoke(
        &self,
        method: &str,
        args: &ValueMap,
        ctx: &CallContext,
    ) -> Result<ValueMap, PluginError>;

    /// Asks the plugin whether it is healthy.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's classification of the failure.
    fn health_check(&self, ctx: &CallContext) -> Result<(), PluginError>;

    /// Non-blocking check whether the process has exited.
    fn has_exited(&self) -> bool;

    /// Signals the process to terminate. Managed processes are awaited.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the signal cannot be delivered.
    fn stop(&self) -> Result<(), PluginError>;
}

/// Starts plugins described by registry descriptors.
pub trait PluginLauncher: Send + Sync {
    /// Spawns the plugin and completes its handshake.
    ///
    /// The descriptor's binary path is absolute and exists.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StartFailed`] if the process cannot be spawned
    /// or its handshake is late, malformed or incompatible.
    fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn PluginHandle>, PluginError>;
}
