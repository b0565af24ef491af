//! Crate-level integration and BDD tests.
//!
//! Plugins here run in-process: the launcher binds a [`PluginServer`] on a
//! background thread and hands the registry a handle that talks to it over
//! a real socket, so registry, dispatcher and SDK are exercised together
//! without spawning binaries.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::build::BuildPipeline;
use crate::context::CallContext;
use crate::descriptor::{PluginDescriptor, PluginStatus, ProcessInfo};
use crate::dispatch::{Endpoint, RpcClient};
use crate::error::PluginError;
use crate::launcher::{PluginHandle, PluginLauncher};
use crate::registry::{PluginRegistry, RegistrySettings};
use crate::serve::{MethodError, PluginServer, PluginService, ServeOptions};
use crate::value::{Value, ValueMap};

mod behaviour;

/// Echoes `echo`, fails `fail`, greets on `greet`.
struct DemoService;

impl PluginService for DemoService {
    fn execute(&self, method: &str, args: ValueMap) -> Result<ValueMap, MethodError> {
        match method {
            "echo" => Ok(args),
            "fail" => Err(MethodError::new("requested failure")),
            "greet" => {
                let mut result = ValueMap::new();
                result.insert("message".into(), Value::from("Hello, World!"));
                Ok(result)
            }
            other => Err(MethodError::unknown_method(other)),
        }
    }
}

struct InProcessHandle {
    client: RpcClient,
    info: ProcessInfo,
    stopped: AtomicBool,
}

impl PluginHandle for InProcessHandle {
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
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) -> Result<(), PluginError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.client.close_idle();
        Ok(())
    }
}

struct InProcessLauncher;

impl PluginLauncher for InProcessLauncher {
    fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn PluginHandle>, PluginError> {
        let server = PluginServer::bind(&ServeOptions::default(), 1)
            .map_err(|error| PluginError::start_failed(descriptor.id(), error.to_string()))?;
        let line = server.handshake_line();
        thread::spawn(move || server.run(Arc::new(DemoService)));
        Ok(Arc::new(InProcessHandle {
            client: RpcClient::new(descriptor.id(), Endpoint::from_handshake(&line)),
            info: ProcessInfo::new(std::process::id(), line.app_version(), "jsonl", line.address()),
            stopped: AtomicBool::new(false),
        }))
    }
}

fn write_plugin(root: &Path, id: &str, auto_start: bool, built: bool) {
    let dir = root.join(id);
    fs::create_dir_all(dir.join("bin")).expect("create plugin dir");
    fs::write(
        dir.join("plugin.json"),
        format!(r#"{{"id": "{id}", "type": "handler", "auto_start": {auto_start}}}"#),
    )
    .expect("write manifest");
    if built {
        fs::write(dir.join("bin").join(id), "binary").expect("write binary");
    }
}

fn in_process_registry(root: &Path) -> PluginRegistry<InProcessLauncher> {
    PluginRegistry::with_launcher(
        RegistrySettings::default()
            .with_plugins_dir(root)
            .with_call_timeout(Duration::from_secs(5)),
        BuildPipeline::default(),
        InProcessLauncher,
    )
}

#[test]
fn end_to_end_register_execute_unregister() {
    let root = tempfile::TempDir::new().expect("temp dir");
    write_plugin(root.path(), "echo", false, true);
    let registry = in_process_registry(root.path());

    let loaded = registry.register_plugin("echo").expect("register");
    assert_eq!(loaded.status(), PluginStatus::Loaded);

    let mut args = ValueMap::new();
    args.insert("k".into(), Value::from("v"));
    let result = registry.execute_plugin("echo", "echo", &args).expect("execute");
    assert_eq!(result, args);
    assert_eq!(registry.get("echo").expect("get").status(), PluginStatus::Ready);

    registry.unregister("echo").expect("unregister");
    assert!(matches!(
        registry.get("echo"),
        Err(PluginError::NotFound { .. })
    ));
}
