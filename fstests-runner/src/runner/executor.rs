// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker tasks: one per supervisor.
//!
//! A worker owns its supervisor for the whole run. It pulls items off the
//! shared queue, executes them, classifies and persists each attempt, and
//! applies the retry and restart policies. While idle it doubles as the
//! supervisor's liveness prober; a busy supervisor is never probed, since the
//! running test is the liveness.

use super::{imp::RunnerPolicy, internal_events::WorkerEvent, queue::WorkQueue};
use crate::{
    errors::{StoreError, TransportError},
    store::{write_attempt_record, RunPaths},
    supervisor::{Liveness, RunOutput, Supervisor},
    test_case::{TestResult, TestStatus, Verdict, WorkItem},
    test_output::CaptureSink,
};
use camino::Utf8PathBuf;
use chrono::Utc;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tracing::{debug, warn};

/// Grace given to an in-flight attempt once cancellation begins.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Slack on top of the per-test timeout before the worker concludes the
/// supervisor failed to abort the test and is hung.
const HANG_SLACK: Duration = Duration::from_secs(15);

const PROBE_ATTEMPTS: u32 = 3;

/// State shared by every worker.
#[derive(Debug)]
pub(super) struct WorkerContext {
    pub(super) policy: RunnerPolicy,
    pub(super) queue: Arc<WorkQueue>,
    pub(super) run_paths: Option<Arc<RunPaths>>,
    pub(super) events: UnboundedSender<WorkerEvent>,
    pub(super) cancel_tx: broadcast::Sender<()>,
}

enum Flow {
    Continue,
    /// The supervisor could not be brought back; the worker leaves the pool.
    Exit,
}

enum NextItem {
    Item(WorkItem),
    Drained,
    SupervisorLost,
}

enum AttemptEnd {
    Completed(Result<RunOutput, TransportError>),
    /// Cancellation arrived and the attempt did not finish within the grace
    /// window.
    Abandoned,
}

pub(super) async fn worker_loop(mut supervisor: Box<dyn Supervisor>, cx: Arc<WorkerContext>) {
    let supervisor_id = supervisor.id().to_owned();
    let mut cancel_rx = cx.cancel_tx.subscribe();

    loop {
        match next_item(&cx, supervisor.as_mut(), &supervisor_id).await {
            NextItem::Item(item) => {
                match run_one(supervisor.as_mut(), &supervisor_id, item, &cx, &mut cancel_rx).await
                {
                    Flow::Continue => {}
                    Flow::Exit => {
                        let _ = cx.events.send(WorkerEvent::SupervisorLost {
                            supervisor_id: supervisor_id.clone(),
                        });
                        supervisor.stop().await;
                        return;
                    }
                }
            }
            NextItem::Drained => break,
            NextItem::SupervisorLost => {
                let _ = cx.events.send(WorkerEvent::SupervisorLost {
                    supervisor_id: supervisor_id.clone(),
                });
                supervisor.stop().await;
                return;
            }
        }
    }

    if cx.policy.keep_alive && !cx.queue.is_cancelled() {
        // Park with the supervisor up until the user interrupts the run.
        let _ = cancel_rx.recv().await;
    }

    supervisor.stop().await;
    let _ = cx.events.send(WorkerEvent::SupervisorStopped { supervisor_id });
}

/// Waits for the next item, probing the idle supervisor at the configured
/// cadence.
async fn next_item(
    cx: &WorkerContext,
    supervisor: &mut dyn Supervisor,
    supervisor_id: &str,
) -> NextItem {
    if cx.policy.probe_interval.is_zero() {
        return match cx.queue.pop().await {
            Some(item) => NextItem::Item(item),
            None => NextItem::Drained,
        };
    }

    loop {
        tokio::select! {
            item = cx.queue.pop() => {
                return match item {
                    Some(item) => NextItem::Item(item),
                    None => NextItem::Drained,
                };
            }
            _ = tokio::time::sleep(cx.policy.probe_interval) => {
                if probe_with_retries(supervisor, supervisor_id).await {
                    continue;
                }
                let _ = cx.events.send(WorkerEvent::SupervisorDied {
                    supervisor_id: supervisor_id.to_owned(),
                });
                match supervisor.restart(cx.policy.startup_timeout).await {
                    Ok(()) => {
                        let _ = cx.events.send(WorkerEvent::SupervisorRestarted {
                            supervisor_id: supervisor_id.to_owned(),
                        });
                    }
                    Err(error) => {
                        warn!("failed to restart {supervisor_id}: {error}");
                        return NextItem::SupervisorLost;
                    }
                }
            }
        }
    }
}

async fn probe_with_retries(supervisor: &mut dyn Supervisor, supervisor_id: &str) -> bool {
    for attempt in 1..=PROBE_ATTEMPTS {
        if supervisor.probe().await == Liveness::Alive {
            return true;
        }
        warn!("probe failed for {supervisor_id} (attempt {attempt}/{PROBE_ATTEMPTS})");
        if attempt < PROBE_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    false
}

/// Runs one attempt of one work item.
async fn run_one(
    supervisor: &mut dyn Supervisor,
    supervisor_id: &str,
    mut item: WorkItem,
    cx: &WorkerContext,
    cancel_rx: &mut broadcast::Receiver<()>,
) -> Flow {
    let test_id = item.test_id().clone();
    let iteration = item.iteration();
    let attempt_index = item.attempts_so_far + 1;

    let _ = cx.events.send(WorkerEvent::Started {
        test_id: test_id.clone(),
        iteration_index: iteration,
        attempt_index,
        supervisor_id: supervisor_id.to_owned(),
    });

    // Every attempt streams into attempts/<n>/; whichever attempt turns out
    // to be authoritative is promoted to the test directory afterwards.
    let attempt_dir = match &cx.run_paths {
        Some(paths) => {
            match paths.create_attempt_dir(&test_id, iteration, attempt_index, false) {
                Ok(dir) => Some(dir),
                Err(error) => {
                    let _ = cx.events.send(WorkerEvent::StoreFailure { error });
                    return Flow::Continue;
                }
            }
        }
        None => None,
    };

    let (mut stdout_sink, mut stderr_sink) = match &attempt_dir {
        Some(dir) => match open_capture_sinks(dir).await {
            Ok(sinks) => sinks,
            Err(error) => {
                let _ = cx.events.send(WorkerEvent::StoreFailure { error });
                return Flow::Continue;
            }
        },
        None => (CaptureSink::memory_only(), CaptureSink::memory_only()),
    };

    let started_at = Utc::now();
    let start = Instant::now();
    let timeout = cx.policy.test_timeout;

    let end = {
        let run_fut = async {
            let inner = supervisor.run_test(
                item.test.as_ref(),
                &mut stdout_sink,
                &mut stderr_sink,
                timeout,
            );
            match timeout {
                Some(t) => match tokio::time::timeout(t + HANG_SLACK, inner).await {
                    Ok(res) => res,
                    // The supervisor failed to enforce its own timeout; it is
                    // considered hung.
                    Err(_) => Err(TransportError::AbortFailed),
                },
                None => inner.await,
            }
        };
        tokio::pin!(run_fut);
        tokio::select! {
            res = &mut run_fut => AttemptEnd::Completed(res),
            _ = cancel_rx.recv() => {
                tokio::select! {
                    res = &mut run_fut => AttemptEnd::Completed(res),
                    _ = tokio::time::sleep(CANCEL_GRACE) => AttemptEnd::Abandoned,
                }
            }
        }
    };

    let finished_at = Utc::now();
    let duration_seconds = start.elapsed().as_secs_f64();

    let outcome = match end {
        AttemptEnd::Abandoned => {
            // The in-flight test is killed by the supervisor's stop() on the
            // way out; the item is reported unfinished.
            debug!("abandoning {test_id} during cancellation");
            let _ = cx.events.send(WorkerEvent::NotRun {
                test_id,
                iteration_index: iteration,
            });
            cx.queue.finalize_one();
            return Flow::Continue;
        }
        AttemptEnd::Completed(outcome) => outcome,
    };

    let stdout_excerpt = stdout_sink.finish().await.unwrap_or_default();
    let stderr_excerpt = stderr_sink.finish().await.unwrap_or_default();

    let mut result = TestResult {
        test_id: test_id.clone(),
        iteration_index: iteration,
        status: TestStatus::Errored,
        started_at,
        finished_at,
        duration_seconds,
        supervisor_id: supervisor_id.to_owned(),
        attempt_index,
        stdout_excerpt,
        stderr_excerpt,
        artifacts: Vec::new(),
        diagnostics: BTreeMap::new(),
    };

    match outcome {
        Ok(output) => {
            let Verdict {
                status,
                summary,
                diagnostics,
            } = if output.timed_out {
                Verdict::new(TestStatus::TimedOut)
            } else {
                let (stdout_bytes, stderr_bytes) =
                    attempt_output(&attempt_dir, &result.stdout_excerpt, &result.stderr_excerpt)
                        .await;
                item.test
                    .classify(output.exit_code, &stdout_bytes, &stderr_bytes)
            };
            result.status = status;
            result.diagnostics = diagnostics;

            // Artifacts are collected after every completed attempt,
            // successful or not.
            let mut artifact_failure = false;
            if let Some(dir) = &attempt_dir {
                let dest = dir.join("artifacts");
                match std::fs::create_dir_all(&dest) {
                    Ok(()) => match supervisor.collect_artifacts(item.test.as_ref(), &dest).await {
                        Ok(paths) => {
                            result.artifacts = paths
                                .into_iter()
                                .map(|path| Utf8PathBuf::from("artifacts").join(path))
                                .collect();
                        }
                        Err(error) => {
                            warn!("artifact collection failed for {}: {error}", result.test_id);
                            artifact_failure = true;
                        }
                    },
                    Err(error) => {
                        warn!("failed to create artifact dir {dest}: {error}");
                        artifact_failure = true;
                    }
                }
            }
            // Never hide a real failure: only a passing test is downgraded
            // when its artifacts could not be collected.
            if artifact_failure && result.status == TestStatus::Passed {
                result.status = TestStatus::Errored;
            }

            let prior_failures = item.attempts_so_far - item.supervisor_kills_caused;
            let will_retry =
                result.status.is_retryable_failure() && prior_failures < cx.policy.retry_failures;

            if !persist_attempt(cx, &attempt_dir, &result, &test_id, iteration, !will_retry) {
                return Flow::Continue;
            }

            if will_retry {
                item.attempts_so_far += 1;
                let retries_remaining = cx.policy.retry_failures - prior_failures - 1;
                let _ = cx.events.send(WorkerEvent::AttemptWillRetry {
                    result,
                    retries_remaining,
                });
                // One requeue-to-front per item, so a hot-looping retry does
                // not starve never-attempted tests.
                if !item.requeued_to_front {
                    item.requeued_to_front = true;
                    cx.queue.requeue_front(item);
                } else {
                    cx.queue.requeue_back(item);
                }
            } else {
                let _ = cx.events.send(WorkerEvent::Finished { result, summary });
                cx.queue.finalize_one();
            }
            Flow::Continue
        }
        Err(error) => {
            warn!("transport failure running {test_id} on {supervisor_id}: {error}");
            item.attempts_so_far += 1;
            item.supervisor_kills_caused += 1;
            result
                .diagnostics
                .insert("transport_error".to_owned(), error.to_string());

            let poisoned = item.supervisor_kills_caused > cx.policy.max_supervisor_restarts;
            if !persist_attempt(cx, &attempt_dir, &result, &test_id, iteration, poisoned) {
                return Flow::Continue;
            }

            if poisoned {
                // Poison-pill isolation: this item has crashed enough
                // supervisors; no further restarts happen on its behalf.
                let _ = cx.events.send(WorkerEvent::Finished {
                    result,
                    summary: None,
                });
                cx.queue.finalize_one();
            } else {
                let retries_remaining =
                    cx.policy.max_supervisor_restarts - item.supervisor_kills_caused;
                let _ = cx.events.send(WorkerEvent::AttemptWillRetry {
                    result,
                    retries_remaining,
                });
                // To the back of the queue, so another supervisor is likely
                // to try it first.
                cx.queue.requeue_back(item);
            }

            let _ = cx.events.send(WorkerEvent::SupervisorDied {
                supervisor_id: supervisor_id.to_owned(),
            });
            match supervisor.restart(cx.policy.startup_timeout).await {
                Ok(()) => {
                    let _ = cx.events.send(WorkerEvent::SupervisorRestarted {
                        supervisor_id: supervisor_id.to_owned(),
                    });
                    Flow::Continue
                }
                Err(error) => {
                    warn!("failed to restart {supervisor_id}: {error}");
                    Flow::Exit
                }
            }
        }
    }
}

/// Writes the attempt record, promoting it when it is the item's final
/// attempt. Returns false (after reporting) on store failure.
fn persist_attempt(
    cx: &WorkerContext,
    attempt_dir: &Option<Utf8PathBuf>,
    result: &TestResult,
    test_id: &crate::test_case::TestId,
    iteration: u32,
    is_final: bool,
) -> bool {
    let Some(dir) = attempt_dir else {
        return true;
    };
    let write = write_attempt_record(dir, result).and_then(|()| {
        if is_final {
            let paths = cx.run_paths.as_ref().expect("attempt dir implies run paths");
            paths.promote_final_attempt(test_id, iteration, result.attempt_index)
        } else {
            Ok(())
        }
    });
    match write {
        Ok(()) => true,
        Err(error) => {
            let _ = cx.events.send(WorkerEvent::StoreFailure { error });
            false
        }
    }
}

async fn open_capture_sinks(
    dir: &Utf8PathBuf,
) -> Result<(CaptureSink, CaptureSink), StoreError> {
    let open = |name: &'static str| {
        let path = dir.join(name);
        async move {
            CaptureSink::file_backed(&path)
                .await
                .map_err(|error| StoreError::Write { path, error })
        }
    };
    Ok((open("stdout").await?, open("stderr").await?))
}

/// The full captured output when file-backed, the excerpt otherwise.
async fn attempt_output(
    attempt_dir: &Option<Utf8PathBuf>,
    stdout_excerpt: &str,
    stderr_excerpt: &str,
) -> (Vec<u8>, Vec<u8>) {
    match attempt_dir {
        Some(dir) => {
            let stdout = tokio::fs::read(dir.join("stdout"))
                .await
                .unwrap_or_else(|_| stdout_excerpt.as_bytes().to_vec());
            let stderr = tokio::fs::read(dir.join("stderr"))
                .await
                .unwrap_or_else(|_| stderr_excerpt.as_bytes().to_vec());
            (stdout, stderr)
        }
        None => (
            stdout_excerpt.as_bytes().to_vec(),
            stderr_excerpt.as_bytes().to_vec(),
        ),
    }
}
