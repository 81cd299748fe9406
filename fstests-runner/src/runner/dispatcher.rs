// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module interfaces with the external world and the worker tasks. It
//! receives events from the workers and from signal handling, persists result
//! records through the single `results.jsonl` writer, and sends events to the
//! reporter callback.

use super::{internal_events::WorkerEvent, queue::WorkQueue};
use crate::{
    errors::StoreError,
    reporter::{CancelReason, RunStats, TestEvent, TestEventKind},
    signal::SignalHandler,
    store::RunRecorder,
    test_case::{TestId, TestStatus},
};
use chrono::Local;
use std::{sync::Arc, time::Instant};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};
use tracing::debug;

/// Context for the dispatcher.
///
/// This struct is responsible for coordinating events from the worker pool
/// and communicating with the reporter callback.
pub(super) struct DispatcherContext<F> {
    callback: F,
    started_at: Instant,
    stats: RunStats,
    keep_alive: bool,
    queue: Arc<WorkQueue>,
    recorder: Option<RunRecorder>,
    running: usize,
    live_supervisors: usize,
    cancel_state: Option<CancelReason>,
    drained: bool,
    signal_count: u32,
    first_store_error: Option<StoreError>,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(TestEvent) + Send,
{
    pub(super) fn new(
        callback: F,
        queue: Arc<WorkQueue>,
        recorder: Option<RunRecorder>,
        initial_run_count: usize,
        keep_alive: bool,
    ) -> Self {
        Self {
            callback,
            started_at: Instant::now(),
            stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            keep_alive,
            queue,
            recorder,
            running: 0,
            live_supervisors: 0,
            cancel_state: None,
            drained: initial_run_count == 0,
            signal_count: 0,
            first_store_error: None,
        }
    }

    /// Runs the dispatcher to completion, until `worker_rx` is closed (every
    /// worker has exited and dropped its sender).
    pub(super) async fn run(
        &mut self,
        mut worker_rx: UnboundedReceiver<WorkerEvent>,
        signal_handler: &mut SignalHandler,
        cancel_tx: &broadcast::Sender<()>,
    ) {
        let mut signals_done = false;
        loop {
            tokio::select! {
                event = worker_rx.recv() => {
                    match event {
                        Some(event) => self.handle_worker_event(event, cancel_tx),
                        None => break,
                    }
                }
                event = signal_handler.recv(), if !signals_done => {
                    match event {
                        Some(_) => self.handle_signal(cancel_tx),
                        None => signals_done = true,
                    }
                }
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent, cancel_tx: &broadcast::Sender<()>) {
        match event {
            WorkerEvent::Started {
                test_id,
                iteration_index,
                attempt_index,
                supervisor_id,
            } => {
                self.running += 1;
                self.emit(TestEventKind::TestStarted {
                    test_id,
                    iteration_index,
                    attempt_index,
                    supervisor_id,
                    running: self.running,
                });
            }
            WorkerEvent::AttemptWillRetry {
                result,
                retries_remaining,
            } => {
                self.running = self.running.saturating_sub(1);
                self.stats.retries += 1;
                self.persist(&result, cancel_tx);
                self.emit(TestEventKind::TestAttemptFailedWillRetry {
                    result,
                    retries_remaining,
                });
            }
            WorkerEvent::Finished { result, summary } => {
                self.running = self.running.saturating_sub(1);
                self.stats.on_final_status(result.status);
                self.persist(&result, cancel_tx);
                self.emit(TestEventKind::TestFinished {
                    result,
                    summary,
                    current_stats: self.stats,
                });
                if self.stats.finalized_count >= self.stats.initial_run_count {
                    self.drained = true;
                    if self.keep_alive {
                        self.emit(TestEventKind::RunKeptAlive {
                            supervisor_count: self.live_supervisors,
                        });
                    }
                }
            }
            WorkerEvent::NotRun {
                test_id,
                iteration_index,
            } => self.mark_not_run(test_id, iteration_index),
            WorkerEvent::SupervisorDied { supervisor_id } => {
                self.emit(TestEventKind::SupervisorDied { supervisor_id });
            }
            WorkerEvent::SupervisorRestarted { supervisor_id } => {
                self.emit(TestEventKind::SupervisorRestarted { supervisor_id });
            }
            WorkerEvent::SupervisorLost { supervisor_id } => {
                self.live_supervisors = self.live_supervisors.saturating_sub(1);
                debug!(supervisor_id, remaining = self.live_supervisors, "supervisor lost");
            }
            WorkerEvent::SupervisorStopped { supervisor_id } => {
                self.live_supervisors = self.live_supervisors.saturating_sub(1);
                self.emit(TestEventKind::SupervisorStopped { supervisor_id });
            }
            WorkerEvent::StoreFailure { error } => {
                self.record_store_error(error, cancel_tx);
            }
        }
    }

    /// Appends a result record; a write failure aborts the run.
    fn persist(&mut self, result: &crate::test_case::TestResult, cancel_tx: &broadcast::Sender<()>) {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(error) = recorder.append_result(result) {
                self.record_store_error(error, cancel_tx);
            }
        }
    }

    fn record_store_error(&mut self, error: StoreError, cancel_tx: &broadcast::Sender<()>) {
        tracing::error!("result store failure, aborting run: {error}");
        if self.first_store_error.is_none() {
            self.first_store_error = Some(error);
        }
        self.begin_cancel(CancelReason::StoreFailure, cancel_tx);
    }

    fn handle_signal(&mut self, cancel_tx: &broadcast::Sender<()>) {
        self.signal_count += 1;
        if self.signal_count >= 3 {
            panic!("Signaled 3 times, exiting immediately");
        }

        // After a drain under keep-alive, a signal is the normal way to
        // release the parked supervisors, not a cancellation.
        if self.keep_alive && self.drained {
            let _ = cancel_tx.send(());
            return;
        }

        self.begin_cancel(CancelReason::Signal, cancel_tx);
    }

    /// Begins cancellation of the run. Later requests are ignored.
    fn begin_cancel(&mut self, reason: CancelReason, cancel_tx: &broadcast::Sender<()>) {
        if self.cancel_state.is_some() {
            return;
        }
        self.cancel_state = Some(reason);
        self.stats.cancelled = true;

        // The queue is drained *after* the broadcast, so a worker woken by
        // the broadcast always observes the cancelled queue.
        let _ = cancel_tx.send(());

        self.emit(TestEventKind::RunBeginCancel {
            running: self.running,
            reason,
        });

        for item in self.queue.cancel() {
            self.mark_not_run(item.test_id().clone(), item.iteration());
        }
    }

    fn mark_not_run(&mut self, test_id: TestId, iteration_index: u32) {
        self.stats.on_final_status(TestStatus::NotRun);
        self.emit(TestEventKind::TestNotRun {
            test_id,
            iteration_index,
        });
    }

    fn emit(&mut self, kind: TestEventKind) {
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: self.started_at.elapsed(),
            kind,
        };
        (self.callback)(event);
    }

    pub(super) fn run_started(&mut self, test_count: usize, supervisor_count: usize) {
        self.emit(TestEventKind::RunStarted {
            test_count,
            supervisor_count,
        });
    }

    pub(super) fn supervisor_started(&mut self, supervisor_id: String) {
        self.live_supervisors += 1;
        self.emit(TestEventKind::SupervisorStarted { supervisor_id });
    }

    pub(super) fn supervisor_start_failed(&mut self, supervisor_id: String, message: String) {
        self.emit(TestEventKind::SupervisorStartFailed {
            supervisor_id,
            message,
        });
    }

    pub(super) fn run_finished(&mut self) {
        let elapsed = self.started_at.elapsed();
        self.emit(TestEventKind::RunFinished {
            stats: self.stats,
            elapsed,
        });
    }

    pub(super) fn run_stats(&self) -> RunStats {
        self.stats
    }

    pub(super) fn cancelled(&self) -> bool {
        self.cancel_state.is_some()
    }

    pub(super) fn take_store_error(&mut self) -> Option<StoreError> {
        self.first_store_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::{TestCase, Verdict, WorkItem};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct NamedTest(TestId);

    impl TestCase for NamedTest {
        fn id(&self) -> &TestId {
            &self.0
        }

        fn iteration(&self) -> u32 {
            1
        }

        fn command(&self) -> String {
            String::new()
        }

        fn classify(&self, _exit_code: Option<i32>, _stdout: &[u8], _stderr: &[u8]) -> Verdict {
            Verdict::new(TestStatus::Passed)
        }
    }

    #[test]
    fn begin_cancel_is_idempotent_and_drains_the_queue() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(WorkQueue::new(vec![
            WorkItem::new(Arc::new(NamedTest(TestId::new("a/001")))),
            WorkItem::new(Arc::new(NamedTest(TestId::new("a/002")))),
        ]));
        let sink = Arc::clone(&events);
        let mut cx = DispatcherContext::new(
            move |event| sink.lock().unwrap().push(event),
            Arc::clone(&queue),
            None,
            2,
            false,
        );

        let (cancel_tx, _cancel_rx) = broadcast::channel(4);

        cx.begin_cancel(CancelReason::Signal, &cancel_tx);
        assert!(cx.cancelled());
        assert_eq!(cx.run_stats().not_run, 2);
        assert!(queue.is_cancelled());

        // A second cancellation does nothing.
        let events_before = events.lock().unwrap().len();
        cx.begin_cancel(CancelReason::Signal, &cancel_tx);
        assert_eq!(events.lock().unwrap().len(), events_before);

        let events = events.lock().unwrap();
        assert!(matches!(events[0].kind, TestEventKind::RunBeginCancel { .. }));
        let not_run: Vec<_> = events
            .iter()
            .filter_map(|event| match &event.kind {
                TestEventKind::TestNotRun { test_id, .. } => Some(test_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(not_run, ["a/001", "a/002"]);
    }
}
