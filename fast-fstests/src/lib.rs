// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fast-fstests CLI.
//!
//! This binary is typically invoked as `ff`. The heavy lifting lives in
//! [`fstests_runner`]; this crate parses arguments, merges them over the
//! TOML configuration, dispatches subcommands, and maps failures onto
//! documented exit codes.

mod dispatch;
mod errors;
mod output;

pub use dispatch::FastFstestsApp;
pub use errors::{ExpectedError, FfExitCode};
pub use output::{Color, OutputContext};

use clap::Parser;

/// Parses arguments and executes the app, exiting the process with the
/// command's exit code.
pub fn main_impl() -> color_eyre::Result<()> {
    let app = match FastFstestsApp::try_parse() {
        Ok(app) => app,
        Err(error) => {
            // Usage errors are configuration errors; --help and --version
            // exit cleanly.
            let code = if error.use_stderr() {
                FfExitCode::SETUP_ERROR
            } else {
                FfExitCode::OK
            };
            error.print()?;
            std::process::exit(code);
        }
    };

    match app.exec() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr();
            std::process::exit(error.exit_code());
        }
    }
}
