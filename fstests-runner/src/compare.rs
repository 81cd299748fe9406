// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run-vs-run comparison.

use crate::{
    store::{final_outcomes, read_run_results},
    test_case::{TestId, TestStatus},
};
use camino::Utf8Path;
use std::collections::BTreeMap;

use crate::errors::StoreError;

/// The smallest duration delta worth reporting as a timing change.
const TIMING_CHANGE_THRESHOLD_SECS: f64 = 5.0;

/// One test whose status differs between the two runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// The test.
    pub test_id: TestId,
    /// Status in the baseline run.
    pub baseline: TestStatus,
    /// Status in the changed run.
    pub changed: TestStatus,
}

/// The diff between two runs.
#[derive(Clone, Debug, Default)]
pub struct RunComparison {
    /// Display label of the baseline run.
    pub baseline_label: String,
    /// Display label of the changed run.
    pub changed_label: String,
    /// Passed in the baseline but not in the changed run.
    pub regressions: Vec<StatusChange>,
    /// The reverse: newly passing tests.
    pub progressions: Vec<StatusChange>,
    /// Present only in the changed run.
    pub new_tests: Vec<TestId>,
    /// Present only in the baseline run.
    pub removed_tests: Vec<TestId>,
    /// Duration deltas of at least five seconds, sorted largest first.
    pub timing_changes: Vec<(TestId, f64)>,
    /// Tests present in both runs.
    pub common_count: usize,
}

impl RunComparison {
    /// Whether any regressions were found; drives the exit code.
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    /// Whether the two runs are indistinguishable.
    pub fn is_empty(&self) -> bool {
        self.regressions.is_empty()
            && self.progressions.is_empty()
            && self.new_tests.is_empty()
            && self.removed_tests.is_empty()
            && self.timing_changes.is_empty()
    }
}

/// The per-test view the comparator works from.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedOutcome {
    /// The final status.
    pub status: TestStatus,
    /// The final attempt's duration.
    pub duration_seconds: f64,
}

/// Loads the authoritative outcome of every test in a run directory.
pub fn load_outcomes(run_dir: &Utf8Path) -> Result<BTreeMap<TestId, RecordedOutcome>, StoreError> {
    let results = read_run_results(run_dir)?;
    Ok(final_outcomes(&results)
        .into_iter()
        .map(|(id, result)| {
            (
                id,
                RecordedOutcome {
                    status: result.status,
                    duration_seconds: result.duration_seconds,
                },
            )
        })
        .collect())
}

/// Computes the diff between a baseline and a changed run.
///
/// A regression is a test that passed in the baseline and does not pass in
/// the changed run; `Errored` counts against the changed run. `Skipped`
/// results are excluded from regression classification, except that a test
/// skipped in the baseline and failing in the changed run is reported as a
/// regression-equivalent new failure.
pub fn compare_runs(
    baseline_label: &str,
    changed_label: &str,
    baseline: &BTreeMap<TestId, RecordedOutcome>,
    changed: &BTreeMap<TestId, RecordedOutcome>,
) -> RunComparison {
    let mut comparison = RunComparison {
        baseline_label: baseline_label.to_owned(),
        changed_label: changed_label.to_owned(),
        ..RunComparison::default()
    };

    for test_id in changed.keys() {
        if !baseline.contains_key(test_id) {
            comparison.new_tests.push(test_id.clone());
        }
    }

    for (test_id, base) in baseline {
        let Some(chg) = changed.get(test_id) else {
            comparison.removed_tests.push(test_id.clone());
            continue;
        };
        comparison.common_count += 1;

        let change = StatusChange {
            test_id: test_id.clone(),
            baseline: base.status,
            changed: chg.status,
        };
        let base_failing = matches!(
            base.status,
            TestStatus::Failed | TestStatus::TimedOut | TestStatus::Errored
        );
        let chg_failing = matches!(
            chg.status,
            TestStatus::Failed | TestStatus::TimedOut | TestStatus::Errored
        );
        match (base.status, chg.status) {
            (TestStatus::Passed, _) if chg_failing => comparison.regressions.push(change),
            // A skipped baseline gives no pass to regress from, but a new
            // failure is still worth surfacing.
            (TestStatus::Skipped, _) if chg_failing => comparison.regressions.push(change),
            (_, TestStatus::Passed) if base_failing => comparison.progressions.push(change),
            _ => {}
        }

        let delta = chg.duration_seconds - base.duration_seconds;
        if delta.abs() >= TIMING_CHANGE_THRESHOLD_SECS {
            comparison.timing_changes.push((test_id.clone(), delta));
        }
    }

    comparison
        .timing_changes
        .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    comparison
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TestStatus) -> RecordedOutcome {
        RecordedOutcome {
            status,
            duration_seconds: 10.0,
        }
    }

    fn run(entries: &[(&str, TestStatus)]) -> BTreeMap<TestId, RecordedOutcome> {
        entries
            .iter()
            .map(|(id, status)| (TestId::new(*id), outcome(*status)))
            .collect()
    }

    #[test]
    fn classifies_the_four_sets() {
        let baseline = run(&[
            ("a/001", TestStatus::Passed),
            ("a/002", TestStatus::Passed),
            ("a/003", TestStatus::Failed),
        ]);
        let changed = run(&[
            ("a/001", TestStatus::Passed),
            ("a/002", TestStatus::Failed),
            ("a/004", TestStatus::Passed),
        ]);

        let cmp = compare_runs("base", "change", &baseline, &changed);
        assert_eq!(
            cmp.regressions,
            vec![StatusChange {
                test_id: TestId::new("a/002"),
                baseline: TestStatus::Passed,
                changed: TestStatus::Failed,
            }]
        );
        assert!(cmp.progressions.is_empty());
        assert_eq!(cmp.new_tests, vec![TestId::new("a/004")]);
        assert_eq!(cmp.removed_tests, vec![TestId::new("a/003")]);
        assert!(cmp.has_regressions());
    }

    #[test]
    fn progressions_and_errored() {
        let baseline = run(&[
            ("a/001", TestStatus::Failed),
            ("a/002", TestStatus::Passed),
            ("a/003", TestStatus::TimedOut),
        ]);
        let changed = run(&[
            ("a/001", TestStatus::Passed),
            ("a/002", TestStatus::Errored),
            ("a/003", TestStatus::Passed),
        ]);

        let cmp = compare_runs("base", "change", &baseline, &changed);
        // Errored in the changed run counts as a regression from Passed.
        assert_eq!(cmp.regressions.len(), 1);
        assert_eq!(cmp.regressions[0].test_id, TestId::new("a/002"));
        assert_eq!(
            cmp.progressions
                .iter()
                .map(|c| c.test_id.as_str())
                .collect::<Vec<_>>(),
            ["a/001", "a/003"]
        );
    }

    #[test]
    fn skipped_is_excluded_from_regressions() {
        let baseline = run(&[("a/001", TestStatus::Passed), ("a/002", TestStatus::Skipped)]);
        let changed = run(&[("a/001", TestStatus::Skipped), ("a/002", TestStatus::Failed)]);

        let cmp = compare_runs("base", "change", &baseline, &changed);
        // Passed -> Skipped is not a regression; Skipped -> Failed is
        // surfaced as a new failure.
        assert_eq!(cmp.regressions.len(), 1);
        assert_eq!(cmp.regressions[0].test_id, TestId::new("a/002"));
        assert!(cmp.progressions.is_empty());
    }

    #[test]
    fn comparing_a_run_with_itself_is_empty() {
        let a = run(&[
            ("a/001", TestStatus::Passed),
            ("a/002", TestStatus::Failed),
            ("a/003", TestStatus::Skipped),
        ]);
        let cmp = compare_runs("a", "a", &a, &a);
        assert!(cmp.is_empty());
        assert!(!cmp.has_regressions());
        assert_eq!(cmp.common_count, 3);
    }

    #[test]
    fn timing_changes_above_threshold() {
        let mut baseline = run(&[("a/001", TestStatus::Passed), ("a/002", TestStatus::Passed)]);
        let mut changed = baseline.clone();
        baseline.get_mut(&TestId::new("a/001")).unwrap().duration_seconds = 10.0;
        changed.get_mut(&TestId::new("a/001")).unwrap().duration_seconds = 30.0;
        changed.get_mut(&TestId::new("a/002")).unwrap().duration_seconds = 12.0;

        let cmp = compare_runs("base", "change", &baseline, &changed);
        assert_eq!(cmp.timing_changes, vec![(TestId::new("a/001"), 20.0)]);
    }
}
