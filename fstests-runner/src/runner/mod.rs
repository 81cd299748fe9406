// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test dispatcher: drives a pool of supervisors to drain a queue of
//! work items while honoring the retry, restart, timeout and liveness
//! policies.
//!
//! The sub-modules are organized this way:
//!
//! * `imp` contains the top-level [`TestRunner`] and [`TestRunnerBuilder`].
//! * `dispatcher` contains the single event-funnel task: it persists result
//!   records, accounts statistics, and feeds the reporter callback.
//! * `executor` contains the per-supervisor worker loop.
//! * `queue` contains the shared FIFO work queue.

mod dispatcher;
mod executor;
mod internal_events;
mod queue;

mod imp;
pub use imp::{TestRunner, TestRunnerBuilder};
