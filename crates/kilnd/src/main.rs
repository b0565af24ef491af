//! Entry point for the kiln host daemon.

use std::process::ExitCode;

fn main() -> ExitCode {
    kilnd::run()
}
