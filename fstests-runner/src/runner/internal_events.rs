// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events sent from worker tasks to the dispatcher.
//!
//! The dispatcher is the single consumer: it persists result records through
//! the one `results.jsonl` writer, accounts statistics, and re-emits public
//! [`TestEvent`](crate::reporter::TestEvent)s.

use crate::{
    errors::StoreError,
    test_case::{TestId, TestResult},
};

#[derive(Debug)]
pub(super) enum WorkerEvent {
    /// A test attempt began executing on a supervisor.
    Started {
        test_id: TestId,
        iteration_index: u32,
        attempt_index: u32,
        supervisor_id: String,
    },

    /// An attempt completed and was persisted, and the item was re-enqueued.
    AttemptWillRetry {
        result: TestResult,
        retries_remaining: u32,
    },

    /// An item was finalized; this result is authoritative.
    Finished {
        result: TestResult,
        summary: Option<String>,
    },

    /// The worker abandoned its in-flight item during cancellation.
    NotRun {
        test_id: TestId,
        iteration_index: u32,
    },

    /// The worker's supervisor crashed or stopped answering probes.
    SupervisorDied { supervisor_id: String },

    /// The worker's supervisor came back after a restart.
    SupervisorRestarted { supervisor_id: String },

    /// The worker's supervisor could not be restarted; the worker is gone.
    SupervisorLost { supervisor_id: String },

    /// The worker stopped its supervisor during shutdown.
    SupervisorStopped { supervisor_id: String },

    /// A worker-side store write failed. Fatal: the run's output is the
    /// product.
    StoreFailure { error: StoreError },
}
