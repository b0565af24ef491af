//! Unit and behaviour tests for the daemon.

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use mockall::mock;
use ortho_config::OrthoConfig;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use kiln_config::Config;
use kiln_plugins::PluginErrorKind;

use crate::bootstrap::{BootstrapError, StaticConfigLoader, bootstrap_with};
use crate::run_with;
use crate::settings;
use crate::shutdown::{ShutdownError, ShutdownSignal};
use crate::telemetry::filter_directives;


mock! {
    Signal {}
    impl ShutdownSignal for Signal {
        fn wait(&self) -> Result<(), ShutdownError>;
    }
}

fn immediate_signal() -> MockSignal {
    let mut signal = MockSignal::new();
    signal.expect_wait().times(1).returning(|| Ok(()));
    signal
}

fn config_for(root: &Path) -> Config {
    Config::default().with_plugins_dir(root.to_str().expect("utf-8 temp dir"))
}

fn write_manifest(root: &Path, id: &str, extra: &str) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).expect("create plugin dir");
    fs::write(
        dir.join("plugin.json"),
        format!(r#"{{"id": "{id}", "auto_start": true{extra}}}"#),
    )
    .expect("write manifest");
}

#[fixture]
fn plugins_root() -> TempDir {
    TempDir::new().expect("temp dir")
}

// ---------------------------------------------------------------------------
// Settings mapping
// ---------------------------------------------------------------------------

#[test]
fn layout_follows_configured_names() {
    let config = Config::load_from_iter(["kilnd", "--manifest-file", "kiln.json", "--bin-dir", "out"])
        .expect("flags parse");
    let layout = settings::plugin_layout(&config);
    let dir = Path::new("/plugins/echo");
    assert_eq!(layout.manifest_path(dir), Path::new("/plugins/echo/kiln.json"));
    assert_eq!(
        layout.build_script_path(dir),
        Path::new("/plugins/echo/scripts/build.sh")
    );
    assert_eq!(
        layout.entry_source_path(dir),
        Path::new("/plugins/echo/src/main.rs")
    );
}

#[test]
fn timeouts_reach_plugin_components() {
    let config = Config::default();
    assert_eq!(
        settings::build_pipeline(&config).timeout(),
        Duration::from_secs(300)
    );
    assert_eq!(
        settings::registry_settings(&config).call_timeout(),
        Duration::from_secs(30)
    );
    assert_eq!(
        settings::supervisor(&config).default_start_timeout(),
        Duration::from_secs(60)
    );
    assert_eq!(
        settings::registry_settings(&config).plugins_dir(),
        Path::new("plugins")
    );
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[rstest]
#[case::default_level("info", "info,kiln_plugins::output=info")]
#[case::quiet_host("warn,kilnd=debug", "warn,kilnd=debug,kiln_plugins::output=info")]
#[case::trailing_comma("warn,", "warn,kiln_plugins::output=info")]
#[case::empty("", "kiln_plugins::output=info")]
#[case::explicit_target("info,kiln_plugins::output=off", "info,kiln_plugins::output=off")]
fn plugin_output_directive_is_added_unless_configured(
    #[case] configured: &str,
    #[case] expected: &str,
) {
    let directives = filter_directives(configured);
    assert_eq!(directives, expected);
    EnvFilter::try_new(&directives).expect("extended filter parses");
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[rstest]
fn missing_plugins_dir_runs_cleanly(plugins_root: TempDir) {
    let config = config_for(&plugins_root.path().join("absent"));
    let code = run_with(&StaticConfigLoader::new(config), &immediate_signal());
    assert_eq!(code, ExitCode::SUCCESS);
}

#[rstest]
fn skipped_auto_start_leaves_registry_empty(plugins_root: TempDir) {
    write_manifest(plugins_root.path(), "broken", "");
    let config = config_for(plugins_root.path()).with_skip_auto_start(true);
    let daemon = bootstrap_with(&StaticConfigLoader::new(config)).expect("bootstrap");
    assert!(daemon.start_plugins().expect("scan").is_none());
    assert!(daemon.registry().is_empty());
}

#[rstest]
fn failed_auto_start_is_reported_not_fatal(plugins_root: TempDir) {
    write_manifest(plugins_root.path(), "broken", "");
    let daemon = bootstrap_with(&StaticConfigLoader::new(config_for(plugins_root.path())))
        .expect("bootstrap");
    let report = daemon
        .start_plugins()
        .expect("scan")
        .expect("auto-start enabled");
    assert!(report.started().is_empty());
    let (id, error) = report.failed().first().expect("one failure");
    assert_eq!(id, "broken");
    assert_eq!(error.kind(), PluginErrorKind::MissingSource);

    let shutdown = daemon.run(&immediate_signal()).expect("daemon runs");
    assert!(shutdown.is_clean());
}

#[rstest]
fn signal_failure_still_shuts_registry_down(plugins_root: TempDir) {
    let mut signal = MockSignal::new();
    signal.expect_wait().times(1).returning(|| {
        Err(ShutdownError::Install {
            source: std::io::Error::other("no signals here"),
        })
    });
    let daemon = bootstrap_with(&StaticConfigLoader::new(config_for(plugins_root.path())))
        .expect("bootstrap");
    let error = daemon.run(&signal).expect_err("wait fails");
    assert!(matches!(error, BootstrapError::Shutdown { .. }), "{error}");
}

#[test]
fn invalid_configuration_is_rejected_before_start() {
    let config = Config::load_from_iter(["kilnd", "--call-timeout-ms", "0"]).expect("flags parse");
    let result = bootstrap_with(&StaticConfigLoader::new(config));
    assert!(matches!(result, Err(BootstrapError::Invalid { .. })));
}

#[test]
fn invalid_configuration_exits_with_failure() {
    let config = Config::load_from_iter(["kilnd", "--start-timeout-ms", "0"]).expect("flags parse");
    let mut signal = MockSignal::new();
    signal.expect_wait().times(0);
    assert_eq!(
        run_with(&StaticConfigLoader::new(config), &signal),
        ExitCode::FAILURE
    );
}

#[cfg(unix)]
#[rstest]
fn auto_started_plugin_is_stopped_on_shutdown(plugins_root: TempDir) {
    use std::os::unix::fs::PermissionsExt;

    write_manifest(plugins_root.path(), "sleeper", r#", "managed": true"#);
    let binary = plugins_root.path().join("sleeper/bin/sleeper");
    fs::create_dir_all(binary.parent().expect("bin dir")).expect("create bin dir");
    fs::write(
        &binary,
        "#!/bin/sh\necho '1|1|tcp|127.0.0.1:9|jsonl'\nexec sleep 30\n",
    )
    .expect("write script");
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).expect("chmod script");

    let daemon = bootstrap_with(&StaticConfigLoader::new(config_for(plugins_root.path())))
        .expect("bootstrap");
    let report = daemon
        .start_plugins()
        .expect("scan")
        .expect("auto-start enabled");
    assert_eq!(report.started(), ["sleeper".to_owned()]);

    let shutdown = daemon.run(&immediate_signal()).expect("daemon runs");
    assert_eq!(shutdown.stopped(), ["sleeper".to_owned()]);
}
