//! Behaviour-driven tests for the plugin lifecycle.

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use crate::error::{PluginError, PluginErrorKind};
use crate::registry::{AutoStartReport, PluginRegistry};
use crate::value::{Value, ValueMap};

use super::{InProcessLauncher, in_process_registry, write_plugin};

// ---------------------------------------------------------------------------
// Test world
// ---------------------------------------------------------------------------

struct TestWorld {
    root: TempDir,
    registry: PluginRegistry<InProcessLauncher>,
    registration: Option<Result<(), PluginError>>,
    call: Option<Result<ValueMap, PluginError>>,
    auto_start: Option<AutoStartReport>,
}

impl Default for TestWorld {
    fn default() -> Self {
        let root = TempDir::new().expect("temp dir");
        let registry = in_process_registry(root.path());
        Self {
            root,
            registry,
            registration: None,
            call: None,
            auto_start: None,
        }
    }
}

#[fixture]
fn world() -> TestWorld {
    TestWorld::default()
}

fn unquote(raw: &str) -> &str {
    raw.trim_matches('"')
}

fn kind_named(name: &str) -> PluginErrorKind {
    match name {
        "already_registered" => PluginErrorKind::AlreadyRegistered,
        "not_found" => PluginErrorKind::NotFound,
        "missing_source" => PluginErrorKind::MissingSource,
        "execution" => PluginErrorKind::Execution,
        other => panic!(
            "unsupported error kind: '{other}' \
             (supported: already_registered, not_found, missing_source, execution)"
        ),
    }
}

// ---------------------------------------------------------------------------
// Given steps
// ---------------------------------------------------------------------------

#[given("a built plugin {id}")]
fn given_built_plugin(world: &mut TestWorld, id: String) {
    write_plugin(world.root.path(), unquote(&id), false, true);
}

#[given("a built auto-start plugin {id}")]
fn given_auto_plugin(world: &mut TestWorld, id: String) {
    write_plugin(world.root.path(), unquote(&id), true, true);
}

#[given("an auto-start plugin {id} with neither binary nor source")]
fn given_broken_auto_plugin(world: &mut TestWorld, id: String) {
    write_plugin(world.root.path(), unquote(&id), true, false);
}

#[given("plugin {id} is registered")]
fn given_registered(world: &mut TestWorld, id: String) {
    world
        .registry
        .register_plugin(unquote(&id))
        .expect("register plugin");
}

// ---------------------------------------------------------------------------
// When steps
// ---------------------------------------------------------------------------

#[when("plugin {id} is registered")]
fn when_registered(world: &mut TestWorld, id: String) {
    world.registration = Some(world.registry.register_plugin(unquote(&id)).map(drop));
}

#[when("method {method} of plugin {id} is executed")]
fn when_executed(world: &mut TestWorld, method: String, id: String) {
    let mut args = ValueMap::new();
    args.insert("k".into(), Value::from("v"));
    world.call = Some(
        world
            .registry
            .execute_plugin(unquote(&id), unquote(&method), &args),
    );
}

#[when("plugin {id} is unregistered")]
fn when_unregistered(world: &mut TestWorld, id: String) {
    world
        .registry
        .unregister(unquote(&id))
        .expect("unregister plugin");
}

#[when("auto-start plugins are started")]
fn when_auto_start(world: &mut TestWorld) {
    world.auto_start = Some(world.registry.start_auto_plugins().expect("scan succeeds"));
}

// ---------------------------------------------------------------------------
// Then steps
// ---------------------------------------------------------------------------

#[then("plugin {id} has status {status}")]
fn then_status(world: &mut TestWorld, id: String, status: String) {
    let descriptor = world.registry.get(unquote(&id)).expect("plugin registered");
    assert_eq!(descriptor.status().as_str(), unquote(&status));
}

#[then("the call returns its arguments")]
fn then_call_echoes(world: &mut TestWorld) {
    let result = world
        .call
        .as_ref()
        .expect("no call made")
        .as_ref()
        .expect("expected success but got error");
    assert_eq!(result.get("k").and_then(Value::as_str), Some("v"));
}

#[then("the call fails with {kind}")]
fn then_call_fails(world: &mut TestWorld, kind: String) {
    let error = world
        .call
        .as_ref()
        .expect("no call made")
        .as_ref()
        .expect_err("expected error but got success");
    assert_eq!(error.kind(), kind_named(unquote(&kind)), "got: {error}");
}

#[then("the registration fails with {kind}")]
fn then_registration_fails(world: &mut TestWorld, kind: String) {
    let error = world
        .registration
        .as_ref()
        .expect("no registration attempted")
        .as_ref()
        .expect_err("expected error but got success");
    assert_eq!(error.kind(), kind_named(unquote(&kind)), "got: {error}");
}

#[then("looking up plugin {id} fails with {kind}")]
fn then_lookup_fails(world: &mut TestWorld, id: String, kind: String) {
    let error = world
        .registry
        .get(unquote(&id))
        .expect_err("plugin should be absent");
    assert_eq!(error.kind(), kind_named(unquote(&kind)));
}

#[then("{count} plugin(s) are registered")]
fn then_registered_count(world: &mut TestWorld, count: usize) {
    assert_eq!(world.registry.len(), count);
}

#[then("auto-start reports {id} as failed with {kind}")]
fn then_auto_start_failed(world: &mut TestWorld, id: String, kind: String) {
    let report = world.auto_start.as_ref().expect("auto-start not run");
    let expected_id = unquote(&id);
    let failure = report
        .failed()
        .iter()
        .find(|(failed_id, _)| failed_id == expected_id)
        .unwrap_or_else(|| panic!("'{expected_id}' not in {:?}", report.failed()));
    assert_eq!(failure.1.kind(), kind_named(unquote(&kind)));
}

// ---------------------------------------------------------------------------
// Scenario registration
// ---------------------------------------------------------------------------

#[scenario(path = "tests/features/plugin_lifecycle.feature")]
fn plugin_lifecycle_behaviour(world: TestWorld) {
    let _ = world;
}
