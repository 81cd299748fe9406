// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queue-order policies.
//!
//! The dispatcher runs the queue in exactly the order it is given; these
//! helpers produce that order. Duration-aware ordering is plain
//! largest-processing-time-first list scheduling: on a fixed pool it is
//! within a factor of two of the optimal makespan, so starting the longest
//! tests first is the whole trick.

use crate::test_case::{TestId, WorkItem};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};

/// Orders items with known durations largest-first; items without a known
/// duration keep their input order at the tail.
///
/// Already-ordered input is left unchanged, so applying the policy twice is a
/// no-op.
pub fn order_slowest_first(
    items: Vec<WorkItem>,
    durations: &HashMap<TestId, f64>,
) -> Vec<WorkItem> {
    let (mut known, unknown): (Vec<WorkItem>, Vec<WorkItem>) = items
        .into_iter()
        .partition(|item| durations.contains_key(item.test_id()));

    // Stable sort keeps input order among equal durations.
    known.sort_by(|a, b| {
        let da = durations[a.test_id()];
        let db = durations[b.test_id()];
        db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
    });

    known.extend(unknown);
    known
}

/// Shuffles the queue in place.
pub fn randomize(items: &mut [WorkItem]) {
    items.shuffle(&mut rand::thread_rng());
}

/// Restricts the queue to tests that did not pass in a prior run.
pub fn filter_rerun_failures(items: Vec<WorkItem>, failed: &HashSet<TestId>) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter(|item| failed.contains(item.test_id()))
        .collect()
}
