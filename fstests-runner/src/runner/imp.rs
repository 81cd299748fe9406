// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::DispatcherContext,
    executor::{worker_loop, WorkerContext},
    queue::WorkQueue,
};
use crate::{
    config::TestRunnerOpts,
    errors::{RunnerError, TestRunnerBuildError},
    reporter::TestEvent,
    signal::{SignalHandler, SignalHandlerKind},
    store::RunRecorder,
    supervisor::Supervisor,
    test_case::WorkItem,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    runtime::Runtime,
    sync::{broadcast, mpsc::unbounded_channel},
    task::JoinSet,
};
use tracing::debug;

/// The dispatcher's policy knobs.
#[derive(Clone, Debug)]
pub(super) struct RunnerPolicy {
    pub(super) test_timeout: Option<Duration>,
    pub(super) probe_interval: Duration,
    pub(super) startup_timeout: Duration,
    pub(super) retry_failures: u32,
    pub(super) max_supervisor_restarts: u32,
    pub(super) keep_alive: bool,
}

/// Test runner options.
#[derive(Debug)]
pub struct TestRunnerBuilder {
    policy: RunnerPolicy,
    signal_handler_kind: SignalHandlerKind,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            policy: RunnerPolicy {
                test_timeout: None,
                probe_interval: Duration::from_secs(30),
                startup_timeout: Duration::from_secs(30),
                retry_failures: 0,
                max_supervisor_restarts: 3,
                keep_alive: false,
            },
            signal_handler_kind: SignalHandlerKind::Standard,
        }
    }
}

impl TestRunnerBuilder {
    /// Applies the `[test_runner]` section of the configuration.
    pub fn from_opts(opts: &TestRunnerOpts) -> Self {
        let mut builder = Self::default();
        builder.policy.test_timeout = opts.test_timeout.map(Duration::from_secs);
        builder.policy.probe_interval = Duration::from_secs(opts.probe_interval);
        builder.policy.retry_failures = opts.retry_failures;
        builder.policy.max_supervisor_restarts = opts.max_supervisor_restarts;
        builder.policy.keep_alive = opts.keep_alive;
        builder
    }

    /// Sets the per-test time budget.
    pub fn set_test_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.policy.test_timeout = timeout;
        self
    }

    /// Sets the idle liveness-probe cadence; zero disables probing.
    pub fn set_probe_interval(&mut self, interval: Duration) -> &mut Self {
        self.policy.probe_interval = interval;
        self
    }

    /// Sets the supervisor startup (and restart) timeout.
    pub fn set_startup_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.policy.startup_timeout = timeout;
        self
    }

    /// Sets the retry bound for failed and timed-out tests.
    pub fn set_retry_failures(&mut self, retries: u32) -> &mut Self {
        self.policy.retry_failures = retries;
        self
    }

    /// Sets the poison-pill cap.
    pub fn set_max_supervisor_restarts(&mut self, max: u32) -> &mut Self {
        self.policy.max_supervisor_restarts = max;
        self
    }

    /// Leaves supervisors running after the drain.
    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.policy.keep_alive = keep_alive;
        self
    }

    /// Sets the signal handler kind (the no-op handler is for tests).
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler_kind = kind;
        self
    }

    /// Creates a new test runner over a queue of work items and a supervisor
    /// pool.
    ///
    /// `recorder` is the open result store for this run; without one, results
    /// are only reported, not persisted.
    pub fn build(
        self,
        items: Vec<WorkItem>,
        supervisors: Vec<Box<dyn Supervisor>>,
        recorder: Option<RunRecorder>,
    ) -> Result<TestRunner, TestRunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("fstests-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::RuntimeCreate)?;
        let _guard = runtime.enter();

        // The signal handler must be built from within the runtime.
        let signal_handler = self
            .signal_handler_kind
            .build()
            .map_err(TestRunnerBuildError::SignalHandlerSetup)?;

        Ok(TestRunner {
            policy: self.policy,
            items,
            supervisors,
            recorder,
            signal_handler,
            runtime,
        })
    }
}

/// Context for running tests. Created using [`TestRunnerBuilder::build`].
pub struct TestRunner {
    policy: RunnerPolicy,
    items: Vec<WorkItem>,
    supervisors: Vec<Box<dyn Supervisor>>,
    recorder: Option<RunRecorder>,
    signal_handler: SignalHandler,
    runtime: Runtime,
}

impl TestRunner {
    /// Drives the pool until the queue is drained or the run is cancelled.
    ///
    /// The callback is invoked with every [`TestEvent`] as it occurs, from
    /// the dispatcher task.
    pub fn execute<F>(
        mut self,
        callback: F,
    ) -> Result<crate::reporter::RunStats, RunnerError>
    where
        F: FnMut(TestEvent) + Send,
    {
        let policy = self.policy.clone();
        let res = self.runtime.block_on(Self::execute_inner(
            policy,
            self.items,
            self.supervisors,
            self.recorder,
            &mut self.signal_handler,
            callback,
        ));

        // Supervisors spawn transport child processes; shut the runtime down
        // without waiting for any stragglers.
        self.runtime.shutdown_background();
        res
    }

    async fn execute_inner<F>(
        policy: RunnerPolicy,
        items: Vec<WorkItem>,
        supervisors: Vec<Box<dyn Supervisor>>,
        recorder: Option<RunRecorder>,
        signal_handler: &mut SignalHandler,
        callback: F,
    ) -> Result<crate::reporter::RunStats, RunnerError>
    where
        F: FnMut(TestEvent) + Send,
    {
        let initial_run_count = items.len();
        let attempted = supervisors.len();
        let run_paths = recorder.as_ref().map(RunRecorder::paths);
        let queue = Arc::new(WorkQueue::new(items));

        let mut dispatcher_cx = DispatcherContext::new(
            callback,
            Arc::clone(&queue),
            recorder,
            initial_run_count,
            policy.keep_alive,
        );
        dispatcher_cx.run_started(initial_run_count, attempted);

        // Start the pool concurrently. Supervisors that fail startup are
        // dropped and the run proceeds with the rest.
        let startup_timeout = policy.startup_timeout;
        let started = futures::future::join_all(supervisors.into_iter().map(|mut supervisor| {
            async move {
                let res = supervisor.start(startup_timeout).await;
                (supervisor, res)
            }
        }))
        .await;

        let mut live = Vec::with_capacity(attempted);
        for (supervisor, res) in started {
            match res {
                Ok(()) => {
                    dispatcher_cx.supervisor_started(supervisor.id().to_owned());
                    live.push(supervisor);
                }
                Err(error) => {
                    dispatcher_cx
                        .supervisor_start_failed(supervisor.id().to_owned(), error.to_string());
                }
            }
        }
        if live.is_empty() {
            return Err(RunnerError::NoSupervisorsAvailable { attempted });
        }
        debug!(live = live.len(), attempted, "supervisor pool started");

        let (worker_tx, worker_rx) = unbounded_channel();
        let (cancel_tx, _keepalive_rx) = broadcast::channel(4);

        let worker_cx = Arc::new(WorkerContext {
            policy,
            queue: Arc::clone(&queue),
            run_paths,
            events: worker_tx,
            cancel_tx: cancel_tx.clone(),
        });

        let mut workers = JoinSet::new();
        for supervisor in live {
            workers.spawn(worker_loop(supervisor, Arc::clone(&worker_cx)));
        }
        // Workers hold the only senders now; the dispatcher loop ends when
        // the last worker exits.
        drop(worker_cx);

        dispatcher_cx
            .run(worker_rx, signal_handler, &cancel_tx)
            .await;

        while let Some(res) = workers.join_next().await {
            if let Err(join_error) = res {
                tracing::warn!("worker task failed: {join_error}");
            }
        }

        if let Some(error) = dispatcher_cx.take_store_error() {
            return Err(RunnerError::Store(error));
        }

        let outstanding = queue.outstanding();
        if outstanding > 0 && !dispatcher_cx.cancelled() {
            return Err(RunnerError::AllSupervisorsLost { outstanding });
        }

        dispatcher_cx.run_finished();
        Ok(dispatcher_cx.run_stats())
    }
}
