//! Binary entrypoint for the echo plugin.

use std::io::{self, Write};

use kiln_plugins::HandshakeConfig;
use kiln_plugin_echo::EchoPlugin;
use tracing_subscriber::EnvFilter;

fn main() {
    // Stdout carries the handshake; logs go to stderr for the host to forward.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .compact()
        .try_init()
        .ok();

    if let Err(error) = kiln_plugins::serve::serve(&HandshakeConfig::default(), EchoPlugin::default()) {
        writeln!(io::stderr().lock(), "{error}").ok();
        std::process::exit(1);
    }
}
