// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The supervisor contract.
//!
//! A supervisor is a scoped worker resource, typically a VM, that executes one
//! test at a time over some transport. The dispatcher owns a pool of them and
//! drives each through `start → (run_test | probe)* → stop`.

use crate::{
    errors::{StartupError, TransportError},
    test_case::TestCase,
    test_output::OutputSink,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::{fmt, time::Duration};

/// The lifecycle of a supervisor.
///
/// `Crashed` is reachable from any live state when a probe fails or a test run
/// raises a transport error. A supervisor in `Busy` owns exactly one test;
/// `Ready` owns none.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not yet started.
    Uninitialized,
    /// `start()` is in flight.
    Starting,
    /// Started and idle.
    Ready,
    /// Executing a test.
    Busy,
    /// The transport is gone; only `restart()` or `stop()` are meaningful.
    Crashed,
    /// `stop()` is in flight.
    Stopping,
    /// Stopped.
    Stopped,
}

/// The answer to a liveness probe. Indeterminate answers map to `Dead`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// The supervisor responded.
    Alive,
    /// The supervisor did not respond in time.
    Dead,
}

/// The raw outcome of a test command, before backend classification.
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// The command's exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the command was aborted because it exceeded the timeout.
    pub timed_out: bool,
}

/// A scoped worker capable of executing one test at a time.
///
/// `start` and `stop` bracket the supervisor's lifetime; `restart` is
/// stop-then-start with the same identity preserved so workers do not need to
/// rebind.
#[async_trait]
pub trait Supervisor: Send + fmt::Debug {
    /// A stable identifier for the lifetime of this instance.
    fn id(&self) -> &str;

    /// Boots the supervisor. May take significant time (VM boot); `timeout`
    /// bounds it. On timeout the supervisor must leave no running side
    /// processes behind.
    async fn start(&mut self, timeout: Duration) -> Result<(), StartupError>;

    /// Runs a test command, streaming output into the sinks as it arrives.
    ///
    /// On timeout the supervisor aborts the in-flight command and returns
    /// `Ok` with [`RunOutput::timed_out`] set; if the abort fails it returns
    /// [`TransportError::AbortFailed`] and is considered crashed.
    async fn run_test(
        &mut self,
        test: &dyn TestCase,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError>;

    /// A cheap liveness check, returning within a short bounded time.
    async fn probe(&mut self) -> Liveness;

    /// Copies the test's artifacts into `dest`, returning the paths written
    /// relative to `dest`. Invoked after every completed attempt.
    async fn collect_artifacts(
        &mut self,
        test: &dyn TestCase,
        dest: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError>;

    /// Tears the supervisor down, killing any in-flight work.
    async fn stop(&mut self);

    /// Equivalent to `stop(); start()` with the same identity.
    async fn restart(&mut self, timeout: Duration) -> Result<(), StartupError> {
        self.stop().await;
        self.start(timeout).await
    }
}
