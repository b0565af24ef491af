//! The plugin binary refuses to run outside a kiln host.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn running_without_the_cookie_fails() {
    Command::cargo_bin("kiln-plugin-echo")
        .expect("binary built")
        .env_remove("KILN_PLUGIN")
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("must be launched by the kiln host"));
}

#[test]
fn wrong_cookie_value_fails() {
    Command::cargo_bin("kiln-plugin-echo")
        .expect("binary built")
        .env("KILN_PLUGIN", "not-the-cookie")
        .assert()
        .code(1);
}
