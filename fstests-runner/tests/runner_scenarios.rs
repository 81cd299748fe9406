// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end dispatcher scenarios against a scripted in-process supervisor.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fstests_runner::{
    errors::{RunnerError, StartupError, TransportError},
    reporter::{RunStats, TestEvent, TestEventKind},
    runner::TestRunnerBuilder,
    signal::SignalHandlerKind,
    store::{final_outcomes, read_run_results, ResultStore, RunId, RunRecorder},
    supervisor::{Liveness, RunOutput, Supervisor},
    test_case::{TestCase, TestId, TestStatus, Verdict, WorkItem},
    test_output::OutputSink,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::AsyncWriteExt;

/// What a scripted attempt does.
#[derive(Clone, Debug)]
enum Behavior {
    /// Report this status through the captured output.
    Status(TestStatus),
    /// Fail with a transport error, crashing the supervisor.
    Crash,
    /// Run for this long (bounded by the per-test timeout).
    RunFor(Duration),
}

/// Shared per-test attempt scripts plus an execution log.
#[derive(Debug, Default)]
struct Script {
    behaviors: Mutex<HashMap<String, VecDeque<Behavior>>>,
    log: Mutex<Vec<String>>,
}

impl Script {
    fn set(&self, test: &str, behaviors: Vec<Behavior>) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(test.to_owned(), behaviors.into());
    }

    fn next_behavior(&self, test: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get_mut(test)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Status(TestStatus::Passed))
    }

    fn log(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn executions(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[derive(Debug)]
struct ScriptedTest {
    id: TestId,
    iteration: u32,
}

impl TestCase for ScriptedTest {
    fn id(&self) -> &TestId {
        &self.id
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }

    fn command(&self) -> String {
        format!("run {}", self.id)
    }

    fn classify(&self, exit_code: Option<i32>, stdout: &[u8], _stderr: &[u8]) -> Verdict {
        let stdout = String::from_utf8_lossy(stdout);
        for status in TestStatus::ALL {
            if stdout.contains(&format!("STATUS {status}")) {
                return Verdict::new(status);
            }
        }
        match exit_code {
            Some(0) => Verdict::new(TestStatus::Passed),
            _ => Verdict::new(TestStatus::Failed),
        }
    }
}

#[derive(Debug)]
struct MockSupervisor {
    name: String,
    script: Arc<Script>,
    fail_start: bool,
    started: bool,
}

impl MockSupervisor {
    fn new(name: &str, script: &Arc<Script>) -> Self {
        Self {
            name: name.to_owned(),
            script: Arc::clone(script),
            fail_start: false,
            started: false,
        }
    }

    fn failing_startup(name: &str, script: &Arc<Script>) -> Self {
        Self {
            fail_start: true,
            ..Self::new(name, script)
        }
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn id(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, _timeout: Duration) -> Result<(), StartupError> {
        if self.fail_start {
            return Err(StartupError::Exited {
                message: "scripted startup failure".to_owned(),
            });
        }
        self.started = true;
        Ok(())
    }

    async fn run_test(
        &mut self,
        test: &dyn TestCase,
        stdout: &mut dyn OutputSink,
        _stderr: &mut dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError> {
        self.script.log(format!("{} {}", self.name, test.id()));
        match self.script.next_behavior(test.id().as_str()) {
            Behavior::Status(status) => {
                let line = format!("STATUS {status}\n");
                stdout
                    .write_all(line.as_bytes())
                    .await
                    .map_err(TransportError::Io)?;
                Ok(RunOutput {
                    exit_code: Some(0),
                    timed_out: false,
                })
            }
            Behavior::Crash => Err(TransportError::Disconnected),
            Behavior::RunFor(duration) => match timeout {
                Some(timeout) if duration > timeout => {
                    tokio::time::sleep(timeout).await;
                    Ok(RunOutput {
                        exit_code: None,
                        timed_out: true,
                    })
                }
                _ => {
                    tokio::time::sleep(duration).await;
                    Ok(RunOutput {
                        exit_code: Some(0),
                        timed_out: false,
                    })
                }
            },
        }
    }

    async fn probe(&mut self) -> Liveness {
        if self.started {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    async fn collect_artifacts(
        &mut self,
        _test: &dyn TestCase,
        _dest: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError> {
        Ok(Vec::new())
    }

    async fn stop(&mut self) {
        self.started = false;
    }
}

fn items(names: &[&str]) -> Vec<WorkItem> {
    names
        .iter()
        .map(|name| {
            WorkItem::new(Arc::new(ScriptedTest {
                id: TestId::new(*name),
                iteration: 1,
            }) as Arc<dyn TestCase>)
        })
        .collect()
}

fn pool(script: &Arc<Script>, count: usize) -> Vec<Box<dyn Supervisor>> {
    (0..count)
        .map(|index| Box::new(MockSupervisor::new(&format!("mock-{index}"), script)) as _)
        .collect()
}

#[derive(Debug)]
struct RunOutcome {
    stats: RunStats,
    events: Vec<TestEvent>,
}

fn run(
    items: Vec<WorkItem>,
    supervisors: Vec<Box<dyn Supervisor>>,
    recorder: Option<RunRecorder>,
    configure: impl FnOnce(&mut TestRunnerBuilder),
) -> Result<RunOutcome, RunnerError> {
    let mut builder = TestRunnerBuilder::default();
    builder.set_signal_handler_kind(SignalHandlerKind::Noop);
    // Probing is not under test here; scenario tests use scripted crashes.
    builder.set_probe_interval(Duration::ZERO);
    configure(&mut builder);

    let runner = builder
        .build(items, supervisors, recorder)
        .expect("runner builds");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let stats = runner.execute(move |event| sink.lock().unwrap().push(event))?;
    let events = Arc::try_unwrap(events).unwrap().into_inner().unwrap();
    Ok(RunOutcome { stats, events })
}

fn store_with_run(dir: &Utf8Path) -> (ResultStore, RunId, RunRecorder) {
    let store = ResultStore::new(dir).unwrap();
    let run_id = RunId::now();
    let recorder = store.begin_run(run_id.clone(), "# test config\n").unwrap();
    (store, run_id, recorder)
}

#[test]
fn happy_path_records_every_test_once() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(
        items(&["btrfs/001", "btrfs/002", "generic/100"]),
        pool(&script, 2),
        Some(recorder),
        |_| {},
    )
    .unwrap();

    assert_eq!(outcome.stats.passed, 3);
    assert_eq!(outcome.stats.finalized_count, 3);
    assert!(outcome.stats.is_success());

    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.attempt_index == 1));
    assert!(results
        .iter()
        .all(|result| result.status == TestStatus::Passed));
    assert!(results
        .iter()
        .all(|result| result.finished_at >= result.started_at));

    // The excerpt came through the streaming sink.
    assert!(results
        .iter()
        .all(|result| result.stdout_excerpt.contains("STATUS passed")));

    assert!(matches!(
        outcome.events.last().map(|event| &event.kind),
        Some(TestEventKind::RunFinished { .. })
    ));
}

#[test]
fn flaky_test_keeps_every_attempt_and_the_last_one_wins() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    script.set(
        "btrfs/042",
        vec![
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Passed),
        ],
    );
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(
        items(&["btrfs/042"]),
        pool(&script, 1),
        Some(recorder),
        |builder| {
            builder.set_retry_failures(2);
        },
    )
    .unwrap();

    assert_eq!(outcome.stats.passed, 1);
    assert_eq!(outcome.stats.retries, 2);

    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    assert_eq!(
        results
            .iter()
            .map(|result| (result.attempt_index, result.status))
            .collect::<Vec<_>>(),
        [
            (1, TestStatus::Failed),
            (2, TestStatus::Failed),
            (3, TestStatus::Passed),
        ],
    );

    // The final attempt is authoritative everywhere.
    let outcomes = final_outcomes(&results);
    assert_eq!(outcomes[&TestId::new("btrfs/042")].status, TestStatus::Passed);

    let test_dir = temp
        .path()
        .join("tests/btrfs/042")
        .join(run_id.to_string());
    assert_eq!(
        std::fs::read_to_string(test_dir.join("status")).unwrap(),
        "passed\n"
    );
    assert!(test_dir.join("attempts/1/status").exists());
    assert!(test_dir.join("attempts/2/status").exists());
}

#[test]
fn bounded_retries_never_exceed_the_budget() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    script.set(
        "ext4/013",
        vec![
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Failed),
        ],
    );
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(
        items(&["ext4/013"]),
        pool(&script, 1),
        Some(recorder),
        |builder| {
            builder.set_retry_failures(1);
        },
    )
    .unwrap();

    assert_eq!(outcome.stats.failed, 1);
    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    // retry_failures + 1 attempts, no more.
    assert_eq!(results.len(), 2);
}

#[test]
fn retry_failures_zero_means_single_attempts() {
    let script = Arc::new(Script::default());
    script.set("ext4/013", vec![Behavior::Status(TestStatus::Failed)]);

    let outcome = run(items(&["ext4/013"]), pool(&script, 1), None, |_| {}).unwrap();
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.retries, 0);
    assert_eq!(script.executions().len(), 1);
}

#[test]
fn poison_pill_is_isolated_after_the_restart_cap() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    script.set(
        "btrfs/666",
        vec![Behavior::Crash, Behavior::Crash, Behavior::Crash],
    );
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(
        items(&["btrfs/666", "btrfs/001"]),
        pool(&script, 2),
        Some(recorder),
        |builder| {
            builder.set_max_supervisor_restarts(2);
        },
    )
    .unwrap();

    assert_eq!(outcome.stats.errored, 1, "poison pill finalized errored");
    assert_eq!(outcome.stats.passed, 1, "healthy test still ran");

    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    let outcomes = final_outcomes(&results);
    assert_eq!(outcomes[&TestId::new("btrfs/666")].status, TestStatus::Errored);
    assert_eq!(outcomes[&TestId::new("btrfs/001")].status, TestStatus::Passed);

    // The pill ran exactly cap + 1 times.
    let pill_runs = script
        .executions()
        .iter()
        .filter(|entry| entry.ends_with("btrfs/666"))
        .count();
    assert_eq!(pill_runs, 3);

    let restarts = outcome
        .events
        .iter()
        .filter(|event| matches!(event.kind, TestEventKind::SupervisorRestarted { .. }))
        .count();
    assert!(restarts >= 2, "restarts happened, saw {restarts}");
}

#[test]
fn timeouts_are_recorded_with_the_budget_duration() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    script.set("generic/475", vec![Behavior::RunFor(Duration::from_secs(60))]);
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(
        items(&["generic/475"]),
        pool(&script, 1),
        Some(recorder),
        |builder| {
            builder.set_test_timeout(Some(Duration::from_secs(1)));
        },
    )
    .unwrap();

    assert_eq!(outcome.stats.timed_out, 1);

    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, TestStatus::TimedOut);
    assert!(
        results[0].duration_seconds >= 0.9 && results[0].duration_seconds < 10.0,
        "duration tracks the budget, got {}",
        results[0].duration_seconds,
    );
}

#[test]
fn a_pool_of_one_runs_in_queue_order() {
    let script = Arc::new(Script::default());
    let outcome = run(
        items(&["b/002", "a/001", "c/003"]),
        pool(&script, 1),
        None,
        |_| {},
    )
    .unwrap();

    assert_eq!(outcome.stats.passed, 3);
    assert_eq!(
        script.executions(),
        ["mock-0 b/002", "mock-0 a/001", "mock-0 c/003"],
    );
}

#[test]
fn a_retried_item_jumps_the_queue_once() {
    let script = Arc::new(Script::default());
    script.set(
        "a/001",
        vec![
            Behavior::Status(TestStatus::Failed),
            Behavior::Status(TestStatus::Passed),
        ],
    );

    let outcome = run(
        items(&["a/001", "b/002", "c/003"]),
        pool(&script, 1),
        None,
        |builder| {
            builder.set_retry_failures(1);
        },
    )
    .unwrap();

    assert_eq!(outcome.stats.passed, 3);
    assert_eq!(
        script.executions(),
        [
            "mock-0 a/001",
            "mock-0 a/001",
            "mock-0 b/002",
            "mock-0 c/003",
        ],
    );
}

#[test]
fn empty_queue_drains_immediately() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    let (store, run_id, recorder) = store_with_run(temp.path());

    let outcome = run(Vec::new(), pool(&script, 2), Some(recorder), |_| {}).unwrap();
    assert_eq!(outcome.stats.finalized_count, 0);
    assert!(outcome.stats.is_success());

    // latest points at a run with a readable, empty results file.
    let latest = store.latest_run_dir().unwrap();
    assert_eq!(latest, store.run_dir(&run_id));
    assert_eq!(read_run_results(&latest).unwrap(), Vec::new());
}

#[test]
fn startup_failures_shrink_the_pool() {
    let script = Arc::new(Script::default());
    let supervisors: Vec<Box<dyn Supervisor>> = vec![
        Box::new(MockSupervisor::failing_startup("mock-bad", &script)),
        Box::new(MockSupervisor::new("mock-good", &script)),
    ];

    let outcome = run(items(&["a/001", "b/002"]), supervisors, None, |_| {}).unwrap();
    assert_eq!(outcome.stats.passed, 2);
    assert!(outcome
        .events
        .iter()
        .any(|event| matches!(event.kind, TestEventKind::SupervisorStartFailed { .. })));
    assert!(script
        .executions()
        .iter()
        .all(|entry| entry.starts_with("mock-good")));
}

#[test]
fn losing_every_supervisor_fails_fast() {
    let script = Arc::new(Script::default());
    let supervisors: Vec<Box<dyn Supervisor>> = vec![
        Box::new(MockSupervisor::failing_startup("mock-0", &script)),
        Box::new(MockSupervisor::failing_startup("mock-1", &script)),
    ];

    let err = run(items(&["a/001"]), supervisors, None, |_| {}).unwrap_err();
    assert!(matches!(
        err,
        RunnerError::NoSupervisorsAvailable { attempted: 2 }
    ));
}

#[test]
fn iterations_are_tracked_separately() {
    let temp = camino_tempfile::tempdir().unwrap();
    let script = Arc::new(Script::default());
    let (store, run_id, recorder) = store_with_run(temp.path());

    let work = (1..=2)
        .map(|iteration| {
            WorkItem::new(Arc::new(ScriptedTest {
                id: TestId::new("btrfs/100"),
                iteration,
            }) as Arc<dyn TestCase>)
        })
        .collect();

    let outcome = run(work, pool(&script, 2), Some(recorder), |_| {}).unwrap();
    assert_eq!(outcome.stats.passed, 2);

    let results = read_run_results(&store.run_dir(&run_id)).unwrap();
    let mut iterations: Vec<u32> = results.iter().map(|r| r.iteration_index).collect();
    iterations.sort_unstable();
    assert_eq!(iterations, [1, 2]);

    // Distinct result directories per iteration.
    let base = temp.path().join("tests/btrfs/100");
    assert!(base.join(run_id.to_string()).join("status").exists());
    assert!(base.join(format!("{run_id}-2")).join("status").exists());
}
