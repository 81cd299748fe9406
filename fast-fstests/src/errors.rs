// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expected errors and their exit codes.

use fstests_runner::errors::{
    CollectError, ConfigError, RecordingError, RunnerError, StartupError, StoreError,
    TestRunnerBuildError,
};
use std::io;
use thiserror::Error;

/// Documented exit codes for `ff` runs.
///
/// Unknown/unexpected failures always result in exit code 2.
pub enum FfExitCode {}

impl FfExitCode {
    /// Every test passed or was skipped; or, for `compare`, no regressions.
    pub const OK: i32 = 0;

    /// One or more tests failed or timed out; or, for `compare`, regressions
    /// are present.
    pub const TEST_FAILURES: i32 = 1;

    /// One or more tests hit infrastructure failures, or the run itself
    /// could not complete.
    pub const INFRA_FAILURES: i32 = 2;

    /// A configuration or usage error happened while setting up the
    /// invocation.
    pub const SETUP_ERROR: i32 = 64;

    /// The run was cancelled by a signal.
    pub const SIGNAL_CANCELED: i32 = 130;
}

/// An error occurred in a fast-fstests command that it knows how to handle.
#[derive(Debug, Error)]
pub enum ExpectedError {
    /// The configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Test collection failed.
    #[error(transparent)]
    Collect(#[from] CollectError),

    /// The selection matched no tests.
    #[error("no tests to run")]
    NoTestsToRun,

    /// A subcommand needs a results directory and none is configured.
    #[error("{subcommand} requires a results directory (set output.results_dir or pass --results-dir)")]
    ResultsDirRequired {
        /// The subcommand that needed it.
        subcommand: &'static str,
    },

    /// A run reference could not be resolved.
    #[error(transparent)]
    Recording(#[from] RecordingError),

    /// The result store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The runner could not be built.
    #[error(transparent)]
    RunnerBuild(#[from] TestRunnerBuildError),

    /// The run aborted.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// The VM image build failed.
    #[error("image build failed")]
    ImageBuild(#[from] StartupError),

    /// Output could not be written to the terminal.
    #[error("failed to write output")]
    Output(#[source] io::Error),
}

impl ExpectedError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExpectedError::Config(_)
            | ExpectedError::Collect(_)
            | ExpectedError::NoTestsToRun
            | ExpectedError::ResultsDirRequired { .. }
            | ExpectedError::Recording(_) => FfExitCode::SETUP_ERROR,
            ExpectedError::Store(_)
            | ExpectedError::RunnerBuild(_)
            | ExpectedError::Runner(_)
            | ExpectedError::ImageBuild(_)
            | ExpectedError::Output(_) => FfExitCode::INFRA_FAILURES,
        }
    }

    /// Displays the error and its cause chain on stderr.
    ///
    /// Written directly rather than through tracing, since configuration
    /// errors can occur before the subscriber is installed.
    pub fn display_to_stderr(&self) {
        let mut current: &dyn std::error::Error = self;
        eprintln!("error: {current}");
        while let Some(source) = current.source() {
            eprintln!("  caused by: {source}");
            current = source;
        }
    }
}
