//! Out-of-process plugin hosting for kiln.
//!
//! The `kiln-plugins` crate discovers plugins on disk, builds them from
//! source when no binary exists, launches each as a child process, completes
//! a start-up handshake and then dispatches method calls to it over a
//! line-delimited JSON RPC channel. A plugin crashing or hanging can only
//! fail its own calls; the host stays up.
//!
//! # Architecture
//!
//! - [`discovery`] scans a plugins directory and classifies each plugin by
//!   what exists on disk.
//! - [`build`] compiles a plugin whose binary is missing, bounded by a
//!   timeout.
//! - [`process`] spawns the binary and waits for its [`handshake`] line.
//! - [`dispatch`] carries calls over the announced endpoint, honouring the
//!   caller's [`CallContext`].
//! - [`registry`] ties these together behind one lock and is the only API a
//!   routing layer needs.
//! - [`serve`] is the plugin-side half: a plugin written in Rust implements
//!   [`serve::PluginService`] and calls [`serve::serve`] from `main`.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_plugins::{BuildPipeline, PluginRegistry, RegistrySettings, Value, ValueMap};
//!
//! let registry = PluginRegistry::new(
//!     RegistrySettings::default().with_plugins_dir("plugins"),
//!     BuildPipeline::default(),
//! );
//! registry.start_auto_plugins().expect("plugins directory readable");
//!
//! let mut args = ValueMap::new();
//! args.insert("name".into(), Value::from("kiln"));
//! let result = registry.execute_plugin("echo", "greet", &args);
//! // result carries the plugin's reply or a classified PluginError.
//! # drop(result);
//! ```

pub mod build;
pub mod context;
pub mod descriptor;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod launcher;
pub mod layout;
pub mod manifest;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod serve;
pub mod value;

#[cfg(test)]
mod tests;

pub use self::build::{BuildOutcome, BuildPipeline, BuildRequest, BuildStep, ScriptOutcome, Toolchain};
pub use self::context::{CallContext, CancellationToken};
pub use self::descriptor::{Availability, PluginDescriptor, PluginStatus, ProcessInfo};
pub use self::discovery::{DiscoveryRecord, discover};
pub use self::dispatch::{Endpoint, RpcClient};
pub use self::error::{PluginError, PluginErrorKind, TimedOperation};
pub use self::handshake::{HandshakeConfig, HandshakeError, HandshakeLine, Network, RpcProtocol};
pub use self::launcher::{PluginHandle, PluginLauncher};
pub use self::layout::PluginLayout;
pub use self::manifest::{PluginKind, PluginManifest, PluginMetadata};
pub use self::process::{PLUGIN_OUTPUT_TARGET, PluginProcess, ProcessSupervisor};
pub use self::registry::{AutoStartReport, PluginRegistry, RegistrySettings, ShutdownReport};
pub use self::value::{Value, ValueMap};
