//! Unit tests for the echo service.

use std::fs;

use rstest::rstest;
use tempfile::TempDir;

use super::*;

fn args(pairs: &[(&str, &str)]) -> ValueMap {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), Value::from(*value)))
        .collect()
}

#[rstest]
#[case::named(&[("name", "kiln")], "Hello, kiln!")]
#[case::anonymous(&[], "Hello, World!")]
#[case::blank(&[("name", "")], "Hello, World!")]
fn greet_addresses_caller(#[case] input: &[(&str, &str)], #[case] expected: &str) {
    let result = EchoPlugin::default()
        .execute("greet", args(input))
        .expect("greet succeeds");
    assert_eq!(result.get("message").and_then(Value::as_str), Some(expected));
}

#[test]
fn echo_returns_arguments() {
    let input = args(&[("a", "1"), ("b", "2")]);
    let result = EchoPlugin::default()
        .execute("echo", input.clone())
        .expect("echo succeeds");
    assert_eq!(result, input);
}

#[test]
fn info_reports_manifest_fields() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("plugin.json");
    fs::write(
        &path,
        r#"{"id": "echo", "name": "Echo", "version": "0.1.0", "type": "filter"}"#,
    )
    .expect("write manifest");

    let result = EchoPlugin::new(&path)
        .execute("info", ValueMap::new())
        .expect("info succeeds");
    assert_eq!(result.get("id").and_then(Value::as_str), Some("echo"));
    assert_eq!(result.get("version").and_then(Value::as_str), Some("0.1.0"));
    assert_eq!(result.get("type").and_then(Value::as_str), Some("filter"));
}

#[test]
fn info_without_manifest_is_a_method_error() {
    let dir = TempDir::new().expect("temp dir");
    let error = EchoPlugin::new(dir.path().join("plugin.json"))
        .execute("info", ValueMap::new())
        .expect_err("no manifest");
    assert!(error.message().starts_with("cannot read manifest"), "{error}");
}

#[test]
fn unknown_method_is_rejected() {
    let error = EchoPlugin::default()
        .execute("dance", ValueMap::new())
        .expect_err("unknown");
    assert_eq!(error.message(), "unknown method: dance");
}

#[test]
fn bundled_manifest_describes_this_plugin() {
    let plugin = EchoPlugin::new(concat!(env!("CARGO_MANIFEST_DIR"), "/plugin.json"));
    let result = plugin.execute("info", ValueMap::new()).expect("info succeeds");
    assert_eq!(result.get("id").and_then(Value::as_str), Some("echo"));
}
