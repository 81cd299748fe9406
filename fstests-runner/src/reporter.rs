// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured run events and the terminal reporter.
//!
//! The dispatcher emits [`TestEvent`]s as they occur. A single consumer is
//! assumed; [`EventForwarder`] feeds a bounded channel that sheds progress
//! events under pressure but never drops a terminal event (anything carrying
//! a persisted result or ending the run).

use crate::{
    compare::RunComparison,
    test_case::{TestId, TestResult, TestStatus},
};
use chrono::{DateTime, FixedOffset};
use owo_colors::{style, OwoColorize, Style};
use std::{
    io::{self, Write},
    sync::mpsc::{Receiver, SyncSender, TrySendError},
    time::Duration,
};

/// Why a run began cancelling.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// An external signal (Ctrl-C, SIGTERM, SIGHUP) was received.
    Signal,
    /// The result store failed; the run's output cannot be trusted.
    StoreFailure,
}

/// Aggregate statistics for a run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Work items the run started with.
    pub initial_run_count: usize,
    /// Items finalized so far.
    pub finalized_count: usize,
    /// Final statuses.
    pub passed: usize,
    /// Tests whose final attempt failed.
    pub failed: usize,
    /// Tests that declined to run.
    pub skipped: usize,
    /// Infrastructure failures.
    pub errored: usize,
    /// Tests that exceeded their time budget.
    pub timed_out: usize,
    /// Items cancelled before dispatch.
    pub not_run: usize,
    /// Attempts that were retried.
    pub retries: usize,
    /// Whether the run was cancelled by a signal.
    pub cancelled: bool,
}

impl RunStats {
    pub(crate) fn on_final_status(&mut self, status: TestStatus) {
        self.finalized_count += 1;
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Errored => self.errored += 1,
            TestStatus::TimedOut => self.timed_out += 1,
            TestStatus::NotRun => self.not_run += 1,
        }
    }

    /// Whether every dispatched test passed or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.timed_out == 0 && !self.cancelled
    }
}

/// A structured event emitted during a run.
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// When the event occurred.
    pub timestamp: DateTime<FixedOffset>,
    /// Time elapsed since the start of the run.
    pub elapsed: Duration,
    /// What occurred.
    pub kind: TestEventKind,
}

/// The kinds of events emitted during a run.
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The run has started.
    RunStarted {
        /// Work items in the queue.
        test_count: usize,
        /// Supervisors being started.
        supervisor_count: usize,
    },

    /// A supervisor came up.
    SupervisorStarted {
        /// The supervisor.
        supervisor_id: String,
    },

    /// A supervisor failed startup and was dropped from the pool.
    SupervisorStartFailed {
        /// The supervisor.
        supervisor_id: String,
        /// Why startup failed.
        message: String,
    },

    /// A supervisor stopped answering probes or crashed mid-test.
    SupervisorDied {
        /// The supervisor.
        supervisor_id: String,
    },

    /// A supervisor came back after a restart.
    SupervisorRestarted {
        /// The supervisor.
        supervisor_id: String,
    },

    /// A supervisor was stopped at the end of the run.
    SupervisorStopped {
        /// The supervisor.
        supervisor_id: String,
    },

    /// A test attempt began executing.
    TestStarted {
        /// The test.
        test_id: TestId,
        /// The test's iteration index.
        iteration_index: u32,
        /// Which attempt this is (1-based).
        attempt_index: u32,
        /// The supervisor it runs on.
        supervisor_id: String,
        /// How many tests are running across the pool right now.
        running: usize,
    },

    /// An attempt failed and the test will be retried.
    TestAttemptFailedWillRetry {
        /// The attempt's persisted result.
        result: TestResult,
        /// Retries left after this one.
        retries_remaining: u32,
    },

    /// A work item was finalized; its result is authoritative.
    TestFinished {
        /// The final attempt's result.
        result: TestResult,
        /// A backend one-line summary, when available.
        summary: Option<String>,
        /// Stats including this result.
        current_stats: RunStats,
    },

    /// A work item was cancelled before it could be dispatched.
    TestNotRun {
        /// The test.
        test_id: TestId,
        /// The test's iteration index.
        iteration_index: u32,
    },

    /// The run began cancelling.
    RunBeginCancel {
        /// Tests still running.
        running: usize,
        /// Why.
        reason: CancelReason,
    },

    /// The drain finished and supervisors are being kept alive for debugging.
    RunKeptAlive {
        /// Live supervisors.
        supervisor_count: usize,
    },

    /// The run is complete.
    RunFinished {
        /// Final statistics.
        stats: RunStats,
        /// Total wall-clock time.
        elapsed: Duration,
    },
}

impl TestEventKind {
    /// Terminal events carry persisted results or end the run; they are never
    /// shed under backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestEventKind::TestAttemptFailedWillRetry { .. }
                | TestEventKind::TestFinished { .. }
                | TestEventKind::TestNotRun { .. }
                | TestEventKind::RunBeginCancel { .. }
                | TestEventKind::RunFinished { .. }
        )
    }
}

/// Bounded capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates the bounded event channel.
pub fn event_channel() -> (EventForwarder, Receiver<TestEvent>) {
    let (tx, rx) = std::sync::mpsc::sync_channel(EVENT_CHANNEL_CAPACITY);
    (
        EventForwarder {
            tx,
            dropped_events: 0,
        },
        rx,
    )
}

/// The producer side of the event channel.
///
/// Progress events are shed when the consumer falls behind; terminal events
/// block until there is room.
#[derive(Debug)]
pub struct EventForwarder {
    tx: SyncSender<TestEvent>,
    dropped_events: usize,
}

impl EventForwarder {
    /// Forwards one event, applying the overflow policy.
    pub fn forward(&mut self, event: TestEvent) {
        if event.kind.is_terminal() {
            // Receiver gone means the consumer is shutting down; nothing
            // useful to do with the event.
            let _ = self.tx.send(event);
        } else {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => self.dropped_events += 1,
            }
        }
    }

    /// How many progress events were shed.
    pub fn dropped_events(&self) -> usize {
        self.dropped_events
    }
}

/// Reporter display options.
#[derive(Clone, Debug, Default)]
pub struct ReporterOpts {
    /// Print failed tests as a pasteable list.
    pub print_failure_list: bool,
    /// Print the N slowest tests (0 disables).
    pub print_n_slowest: usize,
    /// Print a bucketed histogram of test durations.
    pub print_duration_hist: bool,
    /// Also print supervisor lifecycle events.
    pub verbose: bool,
}

/// Functions for formatting colored output.
#[derive(Clone, Debug, Default)]
pub struct Styles {
    pass: Style,
    fail: Style,
    skip: Style,
    error: Style,
    count: Style,
    dimmed: Style,
    bold: Style,
}

impl Styles {
    /// Enables colorized output.
    pub fn colorize(&mut self) {
        self.pass = style().green().bold();
        self.fail = style().red().bold();
        self.skip = style().yellow().bold();
        self.error = style().magenta().bold();
        self.count = style().bold();
        self.dimmed = style().dimmed();
        self.bold = style().bold();
    }

    fn for_status(&self, status: TestStatus) -> Style {
        match status {
            TestStatus::Passed => self.pass,
            TestStatus::Failed | TestStatus::TimedOut => self.fail,
            TestStatus::Skipped => self.skip,
            TestStatus::Errored | TestStatus::NotRun => self.error,
        }
    }
}

/// Prints run progress and the final summary to a writer.
#[derive(Debug)]
pub struct Reporter {
    opts: ReporterOpts,
    styles: Styles,
    final_results: Vec<TestResult>,
}

impl Reporter {
    /// Creates a reporter.
    pub fn new(opts: ReporterOpts, styles: Styles) -> Self {
        Self {
            opts,
            styles,
            final_results: Vec::new(),
        }
    }

    /// Consumes the whole event stream, printing as it goes.
    pub fn run(mut self, rx: Receiver<TestEvent>, writer: &mut impl Write) -> io::Result<()> {
        for event in rx {
            self.report_event(&event, writer)?;
        }
        writer.flush()
    }

    /// Handles one event.
    pub fn report_event(&mut self, event: &TestEvent, writer: &mut impl Write) -> io::Result<()> {
        let styles = &self.styles;
        match &event.kind {
            TestEventKind::RunStarted {
                test_count,
                supervisor_count,
            } => {
                writeln!(
                    writer,
                    "{} {} tests across {} supervisors",
                    "Running".style(styles.bold),
                    test_count.style(styles.count),
                    supervisor_count.style(styles.count),
                )?;
            }
            TestEventKind::SupervisorStarted { supervisor_id } => {
                if self.opts.verbose {
                    writeln!(writer, "{} {supervisor_id} up", "  sup".style(styles.dimmed))?;
                }
            }
            TestEventKind::SupervisorStartFailed {
                supervisor_id,
                message,
            } => {
                writeln!(
                    writer,
                    "{} {supervisor_id} failed startup: {message}",
                    "  sup".style(styles.error),
                )?;
            }
            TestEventKind::SupervisorDied { supervisor_id } => {
                writeln!(
                    writer,
                    "{} {supervisor_id} died",
                    "  sup".style(styles.error)
                )?;
            }
            TestEventKind::SupervisorRestarted { supervisor_id } => {
                writeln!(
                    writer,
                    "{} {supervisor_id} restarted",
                    "  sup".style(styles.skip)
                )?;
            }
            TestEventKind::SupervisorStopped { supervisor_id } => {
                if self.opts.verbose {
                    writeln!(
                        writer,
                        "{} {supervisor_id} stopped",
                        "  sup".style(styles.dimmed)
                    )?;
                }
            }
            TestEventKind::TestStarted {
                test_id,
                attempt_index,
                supervisor_id,
                ..
            } => {
                if self.opts.verbose {
                    let retry = if *attempt_index > 1 {
                        format!(" (attempt {attempt_index})")
                    } else {
                        String::new()
                    };
                    writeln!(
                        writer,
                        "{} {test_id}{retry} on {supervisor_id}",
                        "  start".style(styles.dimmed),
                    )?;
                }
            }
            TestEventKind::TestAttemptFailedWillRetry {
                result,
                retries_remaining,
            } => {
                writeln!(
                    writer,
                    "{:>9} {} ({:.1}s, {} retr{} left)",
                    "retry".style(styles.skip),
                    result.test_id,
                    result.duration_seconds,
                    retries_remaining,
                    if *retries_remaining == 1 { "y" } else { "ies" },
                )?;
            }
            TestEventKind::TestFinished {
                result,
                summary,
                current_stats,
            } => {
                let status_style = styles.for_status(result.status);
                write!(
                    writer,
                    "{:>9} {} ({:.1}s) [{}/{}]",
                    result.status.style(status_style),
                    result.test_id,
                    result.duration_seconds,
                    current_stats.finalized_count,
                    current_stats.initial_run_count,
                )?;
                if let Some(summary) = summary {
                    write!(writer, " {}", summary.style(styles.dimmed))?;
                }
                writeln!(writer)?;

                self.final_results.push(result.clone());
            }
            TestEventKind::TestNotRun { test_id, .. } => {
                writeln!(
                    writer,
                    "{:>9} {test_id}",
                    TestStatus::NotRun.style(styles.error)
                )?;
            }
            TestEventKind::RunBeginCancel { running, .. } => {
                writeln!(
                    writer,
                    "{} ({} tests still running)",
                    "Cancelling".style(styles.fail),
                    running,
                )?;
            }
            TestEventKind::RunKeptAlive { supervisor_count } => {
                writeln!(
                    writer,
                    "{} {} supervisors left running for debugging, Ctrl-C to stop",
                    "Keep-alive:".style(styles.bold),
                    supervisor_count,
                )?;
            }
            TestEventKind::RunFinished { stats, elapsed } => {
                self.write_summary(stats, *elapsed, writer)?;
            }
        }
        Ok(())
    }

    fn write_summary(
        &self,
        stats: &RunStats,
        elapsed: Duration,
        writer: &mut impl Write,
    ) -> io::Result<()> {
        let styles = &self.styles;
        writeln!(writer, "{}", "────────".style(styles.dimmed))?;
        write!(
            writer,
            "{} {} tests in {:.1}s:",
            "Summary".style(styles.bold),
            stats.finalized_count.style(styles.count),
            elapsed.as_secs_f64(),
        )?;
        for (count, label, style) in [
            (stats.passed, "passed", styles.pass),
            (stats.failed, "failed", styles.fail),
            (stats.timed_out, "timed out", styles.fail),
            (stats.skipped, "skipped", styles.skip),
            (stats.errored, "errored", styles.error),
            (stats.not_run, "not run", styles.error),
        ] {
            if count > 0 {
                write!(writer, " {} {}", count.style(style), label)?;
            }
        }
        writeln!(writer)?;
        if stats.retries > 0 {
            writeln!(
                writer,
                "  {} attempts were retried",
                stats.retries.style(styles.count)
            )?;
        }

        if self.opts.print_failure_list {
            let failures: Vec<&str> = self
                .final_results
                .iter()
                .filter(|result| {
                    matches!(
                        result.status,
                        TestStatus::Failed | TestStatus::TimedOut | TestStatus::Errored
                    )
                })
                .map(|result| result.test_id.as_str())
                .collect();
            if !failures.is_empty() {
                writeln!(writer, "{}", "Failures:".style(styles.fail))?;
                writeln!(writer, "  {}", failures.join(" "))?;
            }
        }

        if self.opts.print_n_slowest > 0 {
            let mut by_duration: Vec<&TestResult> = self.final_results.iter().collect();
            by_duration.sort_by(|a, b| {
                b.duration_seconds
                    .partial_cmp(&a.duration_seconds)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            writeln!(
                writer,
                "{}",
                format!("{} slowest:", self.opts.print_n_slowest).style(styles.bold)
            )?;
            for result in by_duration.iter().take(self.opts.print_n_slowest) {
                writeln!(
                    writer,
                    "  {:>8.1}s  {}",
                    result.duration_seconds, result.test_id
                )?;
            }
        }

        if self.opts.print_duration_hist {
            write_duration_histogram(
                self.final_results.iter().map(|r| r.duration_seconds),
                writer,
            )?;
        }

        Ok(())
    }
}

/// Renders a fixed-width bucketed histogram of durations.
fn write_duration_histogram(
    durations: impl Iterator<Item = f64>,
    writer: &mut impl Write,
) -> io::Result<()> {
    const BUCKETS: usize = 10;
    const BAR_WIDTH: usize = 40;

    let durations: Vec<f64> = durations.filter(|d| d.is_finite()).collect();
    if durations.is_empty() {
        return Ok(());
    }
    let max = durations.iter().cloned().fold(0.0_f64, f64::max).max(1e-9);
    let bucket_width = max / BUCKETS as f64;

    let mut counts = [0usize; BUCKETS];
    for duration in &durations {
        let index = ((duration / bucket_width) as usize).min(BUCKETS - 1);
        counts[index] += 1;
    }
    let tallest = counts.iter().copied().max().unwrap_or(1).max(1);
    let width = BAR_WIDTH;

    writeln!(writer, "Duration histogram:")?;
    for (index, count) in counts.iter().enumerate() {
        let lo = bucket_width * index as f64;
        let hi = bucket_width * (index + 1) as f64;
        let bar_len = count * BAR_WIDTH / tallest;
        writeln!(
            writer,
            "  {lo:>6.1}s-{hi:>6.1}s |{:<width$}| {count}",
            "#".repeat(bar_len),
        )?;
    }
    Ok(())
}

/// Renders a run comparison.
pub fn write_comparison(
    comparison: &RunComparison,
    styles: &Styles,
    writer: &mut impl Write,
) -> io::Result<()> {
    writeln!(
        writer,
        "{} {} vs {}",
        "Comparing".style(styles.bold),
        comparison.baseline_label,
        comparison.changed_label,
    )?;

    if comparison.is_empty() {
        writeln!(writer, "  No differences found.")?;
        return Ok(());
    }

    if !comparison.regressions.is_empty() {
        writeln!(
            writer,
            "  {} {}",
            "Regressions".style(styles.fail),
            comparison.regressions.len()
        )?;
        for change in &comparison.regressions {
            writeln!(
                writer,
                "    {}  {} → {}",
                change.test_id, change.baseline, change.changed
            )?;
        }
    }

    if !comparison.progressions.is_empty() {
        writeln!(
            writer,
            "  {} {}",
            "Fixes".style(styles.pass),
            comparison.progressions.len()
        )?;
        for change in &comparison.progressions {
            writeln!(
                writer,
                "    {}  {} → {}",
                change.test_id, change.baseline, change.changed
            )?;
        }
    }

    if !comparison.new_tests.is_empty() {
        writeln!(
            writer,
            "  {} {}",
            format!("New in {}", comparison.changed_label).style(styles.bold),
            comparison.new_tests.len()
        )?;
        for test_id in &comparison.new_tests {
            writeln!(writer, "    {test_id}")?;
        }
    }

    if !comparison.removed_tests.is_empty() {
        writeln!(
            writer,
            "  {} {}",
            format!("Removed from {}", comparison.changed_label).style(styles.bold),
            comparison.removed_tests.len()
        )?;
        for test_id in &comparison.removed_tests {
            writeln!(writer, "    {test_id}")?;
        }
    }

    if !comparison.timing_changes.is_empty() {
        writeln!(writer, "  {} (>= 5s)", "Timing changes".style(styles.bold))?;
        for (test_id, delta) in &comparison.timing_changes {
            let sign = if *delta > 0.0 { "+" } else { "" };
            writeln!(writer, "    {sign}{delta:.0}s  {test_id}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::StatusChange;
    use chrono::Utc;

    fn event(kind: TestEventKind) -> TestEvent {
        TestEvent {
            timestamp: Utc::now().fixed_offset(),
            elapsed: Duration::from_secs(1),
            kind,
        }
    }

    fn finished(id: &str, status: TestStatus, duration: f64) -> TestEventKind {
        let now = Utc::now();
        let mut stats = RunStats {
            initial_run_count: 3,
            ..RunStats::default()
        };
        stats.on_final_status(status);
        TestEventKind::TestFinished {
            result: TestResult {
                test_id: TestId::new(id),
                iteration_index: 1,
                status,
                started_at: now,
                finished_at: now,
                duration_seconds: duration,
                supervisor_id: "ff-0".to_owned(),
                attempt_index: 1,
                stdout_excerpt: String::new(),
                stderr_excerpt: String::new(),
                artifacts: Vec::new(),
                diagnostics: Default::default(),
            },
            summary: None,
            current_stats: stats,
        }
    }

    #[test]
    fn progress_events_are_shed_but_terminal_events_are_not() {
        let (mut forwarder, rx) = event_channel();
        for _ in 0..EVENT_CHANNEL_CAPACITY + 50 {
            forwarder.forward(event(TestEventKind::SupervisorStarted {
                supervisor_id: "ff-0".to_owned(),
            }));
        }
        assert_eq!(forwarder.dropped_events(), 50);

        // Drain one slot, then confirm a terminal event gets through even
        // though progress events were being shed.
        rx.recv().unwrap();
        forwarder.forward(event(finished("btrfs/001", TestStatus::Passed, 1.0)));
        drop(forwarder);

        let received: Vec<TestEvent> = rx.iter().collect();
        assert!(received
            .iter()
            .any(|event| matches!(event.kind, TestEventKind::TestFinished { .. })));
    }

    #[test]
    fn summary_counts_every_status() {
        let mut reporter = Reporter::new(
            ReporterOpts {
                print_failure_list: true,
                print_n_slowest: 2,
                print_duration_hist: true,
                verbose: false,
            },
            Styles::default(),
        );
        let mut out = Vec::new();
        let mut stats = RunStats {
            initial_run_count: 3,
            ..RunStats::default()
        };
        for (id, status, duration) in [
            ("btrfs/001", TestStatus::Passed, 12.0),
            ("btrfs/002", TestStatus::Failed, 80.0),
            ("generic/003", TestStatus::Skipped, 0.1),
        ] {
            stats.on_final_status(status);
            reporter
                .report_event(&event(finished(id, status, duration)), &mut out)
                .unwrap();
        }
        reporter
            .report_event(
                &event(TestEventKind::RunFinished {
                    stats,
                    elapsed: Duration::from_secs(95),
                }),
                &mut out,
            )
            .unwrap();

        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("1 passed"), "{rendered}");
        assert!(rendered.contains("1 failed"), "{rendered}");
        assert!(rendered.contains("1 skipped"), "{rendered}");
        assert!(rendered.contains("btrfs/002"), "{rendered}");
        assert!(rendered.contains("Duration histogram"), "{rendered}");
        assert!(rendered.contains("2 slowest:"), "{rendered}");
    }

    #[test]
    fn comparison_rendering_mentions_every_section() {
        let comparison = RunComparison {
            baseline_label: "base".to_owned(),
            changed_label: "patched".to_owned(),
            regressions: vec![StatusChange {
                test_id: TestId::new("a/002"),
                baseline: TestStatus::Passed,
                changed: TestStatus::Failed,
            }],
            progressions: vec![StatusChange {
                test_id: TestId::new("a/003"),
                baseline: TestStatus::Failed,
                changed: TestStatus::Passed,
            }],
            new_tests: vec![TestId::new("a/004")],
            removed_tests: vec![TestId::new("a/005")],
            timing_changes: vec![(TestId::new("a/001"), 20.0)],
            common_count: 3,
        };

        let mut out = Vec::new();
        write_comparison(&comparison, &Styles::default(), &mut out).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        for needle in [
            "Regressions",
            "Fixes",
            "New in patched",
            "Removed from patched",
            "Timing changes",
            "a/002  passed → failed",
            "+20s  a/001",
        ] {
            assert!(rendered.contains(needle), "missing {needle:?} in {rendered}");
        }

        let mut out = Vec::new();
        write_comparison(&RunComparison::default(), &Styles::default(), &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("No differences found."));
    }
}
