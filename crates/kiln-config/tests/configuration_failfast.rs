//! Malformed configuration surfaces as a load error rather than defaults.

use std::ffi::OsString;
use std::fs;

use ortho_config::OrthoConfig;
use tempfile::TempDir;

use kiln_config::Config;

#[test]
fn malformed_file_fails_to_load() {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("kiln.toml");
    fs::write(&path, "call_timeout_ms = \"soon\"\n").expect("write malformed config");

    let args = vec![
        OsString::from("kilnd"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];
    let error = Config::load_from_iter(args).expect_err("loading must fail");
    assert!(!error.to_string().is_empty());
}

#[test]
fn unparseable_log_format_flag_fails_to_load() {
    let args = ["kilnd", "--log-format", "pretty"].map(OsString::from);
    assert!(Config::load_from_iter(args).is_err());
}
