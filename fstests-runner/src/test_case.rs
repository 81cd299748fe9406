// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test contract and per-test data model.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A stable, hierarchical test identity of the form `<suite>/<name>`, e.g.
/// `btrfs/001`.
///
/// Equality is string equality and ordering is lexicographic; execution order
/// is controlled by the scheduler, not by identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Creates a new test id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the suite component, if the id is hierarchical.
    pub fn suite(&self) -> Option<&str> {
        self.0.split_once('/').map(|(suite, _)| suite)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The outcome of a single test attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The test ran and its verdict was positive.
    Passed,
    /// The test ran and its verdict was negative.
    Failed,
    /// The test declined to run (e.g. missing prerequisites).
    Skipped,
    /// Infrastructure failure: the supervisor crashed or the transport was
    /// lost. Distinct from [`Failed`](Self::Failed), where the test itself ran.
    Errored,
    /// The test exceeded its time budget.
    TimedOut,
    /// The test was never dispatched, or was cancelled before dispatch.
    NotRun,
}

impl TestStatus {
    /// All statuses, in summary display order.
    pub const ALL: [TestStatus; 6] = [
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Skipped,
        TestStatus::Errored,
        TestStatus::TimedOut,
        TestStatus::NotRun,
    ];

    /// Returns true for `Passed` and `Skipped`.
    pub fn is_success(self) -> bool {
        matches!(self, TestStatus::Passed | TestStatus::Skipped)
    }

    /// Returns true for outcomes that count against the retry budget.
    pub fn is_retryable_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::TimedOut)
    }

    /// The textual form used in on-disk `status` files.
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
            TestStatus::Errored => "errored",
            TestStatus::TimedOut => "timed-out",
            TestStatus::NotRun => "not-run",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestStatus {
    type Err = UnknownTestStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownTestStatus {
                input: s.to_owned(),
            })
    }
}

/// Error parsing a [`TestStatus`] from its textual form.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown test status: {input}")]
pub struct UnknownTestStatus {
    /// The unrecognized input.
    pub input: String,
}

/// The immutable record of one test attempt.
///
/// One line of `results.jsonl` per attempt; the final attempt for a work item
/// is authoritative for the test's status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// The test's identity.
    pub test_id: TestId,
    /// Which iteration of the test this is (1-based).
    pub iteration_index: u32,
    /// The attempt's outcome.
    pub status: TestStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished. Always >= `started_at`.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in seconds.
    pub duration_seconds: f64,
    /// The supervisor the attempt ran on.
    pub supervisor_id: String,
    /// Which attempt this is (1-based).
    pub attempt_index: u32,
    /// Tail of the captured stdout.
    #[serde(default)]
    pub stdout_excerpt: String,
    /// Tail of the captured stderr.
    #[serde(default)]
    pub stderr_excerpt: String,
    /// Collected artifact paths, relative to this result's directory.
    #[serde(default)]
    pub artifacts: Vec<Utf8PathBuf>,
    /// Backend-specific key/value diagnostics (e.g. a dmesg excerpt).
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
}

/// A backend's classification of a finished test run.
#[derive(Clone, Debug)]
pub struct Verdict {
    /// The resulting status.
    pub status: TestStatus,
    /// A one-line summary suitable for progress output.
    pub summary: Option<String>,
    /// Backend-specific diagnostics to attach to the result.
    pub diagnostics: BTreeMap<String, String>,
}

impl Verdict {
    /// A verdict with no summary or diagnostics.
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            summary: None,
            diagnostics: BTreeMap::new(),
        }
    }
}

/// A single runnable test.
///
/// A test must be safe to hand to any supervisor: it carries no mutable state
/// tied to a specific one. Execution is delegated (a supervisor runs a test,
/// not the reverse): the supervisor executes [`command`](Self::command) over
/// its transport and hands the raw outcome back to
/// [`classify`](Self::classify).
pub trait TestCase: Send + Sync + fmt::Debug {
    /// The test's stable identity.
    fn id(&self) -> &TestId;

    /// Which iteration of the test this is (1-based). The same [`TestId`] may
    /// appear multiple times in one run with distinct iteration indices.
    fn iteration(&self) -> u32;

    /// The shell command a supervisor executes to run this test.
    fn command(&self) -> String;

    /// Glob patterns, resolved on the supervisor, of artifacts to collect
    /// after every attempt.
    fn artifact_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Classifies a finished run. `exit_code` is `None` when the process was
    /// killed by a signal.
    fn classify(&self, exit_code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Verdict;
}

/// The scheduler's bookkeeping wrapper around a test.
///
/// One work item exists per `(test id, iteration)` pair; it lives from queue
/// fill to finalization.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// The test to run.
    pub test: Arc<dyn TestCase>,
    /// Completed attempts so far.
    pub attempts_so_far: u32,
    /// How many supervisors this item has crashed, for the poison-pill cap.
    pub supervisor_kills_caused: u32,
    /// Whether this item has already used its one requeue-to-front slot.
    pub requeued_to_front: bool,
}

impl WorkItem {
    /// Wraps a test into a fresh work item.
    pub fn new(test: Arc<dyn TestCase>) -> Self {
        Self {
            test,
            attempts_so_far: 0,
            supervisor_kills_caused: 0,
            requeued_to_front: false,
        }
    }

    /// The test's identity.
    pub fn test_id(&self) -> &TestId {
        self.test.id()
    }

    /// The test's iteration index.
    pub fn iteration(&self) -> u32 {
        self.test.iteration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in TestStatus::ALL {
            assert_eq!(status.as_str().parse::<TestStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_id_ordering_is_lexicographic() {
        let mut ids = vec![
            TestId::new("generic/100"),
            TestId::new("btrfs/001"),
            TestId::new("btrfs/012"),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(TestId::as_str).collect::<Vec<_>>(),
            ["btrfs/001", "btrfs/012", "generic/100"],
        );
        assert_eq!(ids[0].suite(), Some("btrfs"));
    }
}
