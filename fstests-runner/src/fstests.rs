// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fstests test backend.
//!
//! Knows how to enumerate an fstests checkout (test globs, groups, exclude
//! lists), synthesize `./check` invocations, and classify check output into a
//! verdict. The runner core never sees any of this; it only sees the
//! [`TestCase`] contract.

use crate::{
    config::Config,
    errors::CollectError,
    test_case::{TestCase, TestId, TestStatus, Verdict},
};
use camino::Utf8Path;
use std::collections::BTreeSet;
use std::process::Command;
use tracing::warn;

/// One xfstests test, e.g. `btrfs/001`.
///
/// The check command is relative to the fstests directory; the supervisor
/// prepends its own machine's location.
#[derive(Clone, Debug)]
pub struct FsTest {
    id: TestId,
    iteration: u32,
    check_options: Vec<String>,
}

impl FsTest {
    /// Creates a test from its id and the selection options.
    pub fn new(id: TestId, iteration: u32, config: &Config) -> Self {
        let mut check_options = Vec::new();
        if let Some(section) = &config.test_selection.section {
            check_options.extend(["-s".to_owned(), section.clone()]);
        }
        if let Some(section) = &config.test_selection.exclude_section {
            check_options.extend(["-S".to_owned(), section.clone()]);
        }
        Self {
            id,
            iteration,
            check_options,
        }
    }
}

impl TestCase for FsTest {
    fn id(&self) -> &TestId {
        &self.id
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }

    fn command(&self) -> String {
        let mut command = "./check".to_owned();
        for option in &self.check_options {
            command.push(' ');
            command.push_str(option);
        }
        command.push(' ');
        command.push_str(self.id.as_str());
        command
    }

    fn artifact_patterns(&self) -> Vec<String> {
        vec![format!("results/*/{}*", self.id)]
    }

    fn classify(&self, exit_code: Option<i32>, stdout: &[u8], _stderr: &[u8]) -> Verdict {
        let stdout = String::from_utf8_lossy(stdout);
        let status = match exit_code {
            Some(0) if stdout.contains("[not run]") => TestStatus::Skipped,
            Some(0) => TestStatus::Passed,
            _ => TestStatus::Failed,
        };

        let mut verdict = Verdict::new(status);
        verdict.summary = check_summary(&stdout);
        verdict
    }
}

/// Extracts check's one-line result summary, e.g. `Ran: btrfs/001` timing
/// detail, from its banner output.
fn check_summary(stdout: &str) -> Option<String> {
    let line = stdout.lines().nth(7)?;
    let mut words = line.split_whitespace();
    let _test_name = words.next()?;
    let rest: Vec<&str> = words.collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    }
}

fn fstests_dir(config: &Config) -> Result<&Utf8Path, CollectError> {
    config
        .fstests
        .as_deref()
        .ok_or(CollectError::FstestsPathMissing)
}

/// Collects the selected tests in deterministic lexicographic order, before
/// any scheduling policy is applied.
pub fn collect_tests(config: &Config) -> Result<Vec<FsTest>, CollectError> {
    let mut tests: BTreeSet<String> = BTreeSet::new();

    for pattern in &config.test_selection.tests {
        tests.extend(expand_test(pattern, config)?);
    }
    for group in &config.test_selection.groups {
        tests.extend(tests_for_group(group, config)?);
    }

    for pattern in &config.test_selection.exclude_tests {
        for test in expand_test(pattern, config)? {
            tests.remove(&test);
        }
    }
    for pattern in parse_exclude_tests_file(config)? {
        for test in expand_test(&pattern, config)? {
            tests.remove(&test);
        }
    }
    for group in &config.test_selection.exclude_groups {
        for test in tests_for_group(group, config)? {
            tests.remove(&test);
        }
    }

    let mut tests: Vec<String> = tests.into_iter().collect();

    if let Some(file_system) = &config.test_selection.file_system {
        let before = tests.len();
        tests.retain(|test| test.contains(file_system) || test.contains("generic"));
        if tests.is_empty() && before > 0 {
            warn!("no tests match your specified file system: {file_system}");
        }
    }

    let iterate = config.test_selection.iterate.max(1);
    Ok(tests
        .into_iter()
        .flat_map(|test| {
            let id = TestId::new(test);
            (1..=iterate).map(move |iteration| FsTest::new(id.clone(), iteration, config))
        })
        .collect())
}

/// Expands a test pattern (e.g. `btrfs/0*`) against `tests/`, keeping only
/// entries whose final component is a test number.
fn expand_test(pattern: &str, config: &Config) -> Result<Vec<String>, CollectError> {
    let tests_dir = fstests_dir(config)?.join("tests");
    let mut matched = Vec::new();

    let suites = read_dir_names(&tests_dir)?;
    for suite in suites {
        let suite_dir = tests_dir.join(&suite);
        if !suite_dir.is_dir() {
            continue;
        }
        for name in read_dir_names(&suite_dir)? {
            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let rel = format!("{suite}/{name}");
            if wildcard_match(pattern, &rel) {
                matched.push(rel);
            }
        }
    }
    Ok(matched)
}

fn read_dir_names(dir: &Utf8Path) -> Result<Vec<String>, CollectError> {
    let entries = dir.read_dir_utf8().map_err(|error| CollectError::Io {
        path: dir.to_owned(),
        error,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| CollectError::Io {
            path: dir.to_owned(),
            error,
        })?;
        names.push(entry.file_name().to_owned());
    }
    names.sort();
    Ok(names)
}

/// Glob-style matching with `*` and `?`, the subset `./check` itself
/// understands for test names.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    // Iterative backtracking on the most recent `*`.
    let (mut p, mut i) = (0, 0);
    let (mut star, mut star_i) = (None, 0);
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_i = i;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_i += 1;
            i = star_i;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Returns the tests belonging to a group.
///
/// `suite/group` restricts to one suite directory; a bare group name is
/// looked up in every suite. The special group `all` matches every test.
fn tests_for_group(group: &str, config: &Config) -> Result<Vec<String>, CollectError> {
    let tests_dir = fstests_dir(config)?.join("tests");

    if let Some((suite, group)) = group.split_once('/') {
        return tests_from_suite_dir(group, &tests_dir.join(suite));
    }

    let mut tests = Vec::new();
    for suite in read_dir_names(&tests_dir)? {
        let suite_dir = tests_dir.join(&suite);
        if suite_dir.is_dir() {
            tests.extend(tests_from_suite_dir(group, &suite_dir)?);
        }
    }
    Ok(tests)
}

fn tests_from_suite_dir(group: &str, suite_dir: &Utf8Path) -> Result<Vec<String>, CollectError> {
    let suite = suite_dir.file_name().unwrap_or_default();
    let mut tests = Vec::new();
    for line in group_file(suite_dir).lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let Some(test_name) = words.next() else {
            continue;
        };
        let groups: Vec<&str> = words.collect();
        if group == "all" || groups.contains(&group) {
            tests.push(format!("{suite}/{test_name}"));
        }
    }
    Ok(tests)
}

/// The group list for a suite: the output of fstests' own `mkgroupfile` tool
/// when it works, the checked-in `group.list` otherwise.
fn group_file(suite_dir: &Utf8Path) -> String {
    match Command::new("../../tools/mkgroupfile")
        .current_dir(suite_dir)
        .output()
    {
        Ok(output) if output.status.success() => {
            return String::from_utf8_lossy(&output.stdout).into_owned();
        }
        Ok(output) => {
            warn!("mkgroupfile non-zero return code: {:?}", output.status.code());
        }
        Err(error) => {
            warn!("could not run mkgroupfile: {error}");
        }
    }

    match std::fs::read_to_string(suite_dir.join("group.list")) {
        Ok(contents) => contents,
        Err(error) => {
            warn!("could not find group.list in {suite_dir}: {error}");
            String::new()
        }
    }
}

fn parse_exclude_tests_file(config: &Config) -> Result<Vec<String>, CollectError> {
    let Some(path) = &config.test_selection.exclude_tests_file else {
        return Ok(Vec::new());
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            warn!("exclude tests file not found: {path}: {error}");
            return Ok(Vec::new());
        }
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MkosiOpts;
    use camino_tempfile::Utf8TempDir;

    fn fake_fstests() -> Utf8TempDir {
        let dir = camino_tempfile::tempdir().unwrap();
        for (suite, tests) in [
            ("btrfs", vec!["001", "002", "012"]),
            ("generic", vec!["100", "321"]),
        ] {
            let suite_dir = dir.path().join("tests").join(suite);
            std::fs::create_dir_all(&suite_dir).unwrap();
            let mut group_list = String::from("# group list\n");
            for test in &tests {
                std::fs::write(suite_dir.join(test), "#!/bin/bash\n").unwrap();
                // Also a non-test file that must never match.
                std::fs::write(suite_dir.join(format!("{test}.out")), "").unwrap();
                let groups = if *test == "001" { "auto quick" } else { "auto" };
                group_list.push_str(&format!("{test} {groups}\n"));
            }
            std::fs::write(suite_dir.join("group.list"), group_list).unwrap();
        }
        dir
    }

    fn config_for(dir: &Utf8TempDir) -> Config {
        Config {
            fstests: Some(dir.path().to_owned()),
            mkosi: MkosiOpts {
                config: Some("/mkosi".into()),
                fstests: Some("/fstests".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(tests: &[FsTest]) -> Vec<String> {
        tests
            .iter()
            .map(|test| format!("{}#{}", test.id(), test.iteration()))
            .collect()
    }

    #[test]
    fn expands_globs_and_excludes() {
        let dir = fake_fstests();
        let mut config = config_for(&dir);
        config.test_selection.tests = vec!["btrfs/0*".to_owned()];
        config.test_selection.exclude_tests = vec!["btrfs/002".to_owned()];

        let tests = collect_tests(&config).unwrap();
        assert_eq!(names(&tests), ["btrfs/001#1", "btrfs/012#1"]);
    }

    #[test]
    fn groups_match_per_suite_and_globally() {
        let dir = fake_fstests();
        let mut config = config_for(&dir);
        config.test_selection.groups = vec!["quick".to_owned()];
        let tests = collect_tests(&config).unwrap();
        assert_eq!(names(&tests), ["btrfs/001#1", "generic/100#1"]);

        config.test_selection.groups = vec!["btrfs/auto".to_owned()];
        let tests = collect_tests(&config).unwrap();
        assert_eq!(names(&tests), ["btrfs/001#1", "btrfs/002#1", "btrfs/012#1"]);
    }

    #[test]
    fn iterate_expands_with_distinct_iteration_indices() {
        let dir = fake_fstests();
        let mut config = config_for(&dir);
        config.test_selection.tests = vec!["generic/100".to_owned()];
        config.test_selection.iterate = 3;

        let tests = collect_tests(&config).unwrap();
        assert_eq!(
            names(&tests),
            ["generic/100#1", "generic/100#2", "generic/100#3"]
        );
    }

    #[test]
    fn file_system_filter_keeps_generic() {
        let dir = fake_fstests();
        let mut config = config_for(&dir);
        config.test_selection.tests = vec!["*".to_owned()];
        config.test_selection.file_system = Some("btrfs".to_owned());

        let tests = collect_tests(&config).unwrap();
        assert_eq!(
            names(&tests),
            ["btrfs/001#1", "btrfs/002#1", "btrfs/012#1", "generic/100#1", "generic/321#1"]
        );
    }

    #[test]
    fn check_command_includes_sections() {
        let dir = fake_fstests();
        let mut config = config_for(&dir);
        config.test_selection.section = Some("btrfs_normal".to_owned());
        let test = FsTest::new(TestId::new("btrfs/001"), 1, &config);
        assert_eq!(test.command(), "./check -s btrfs_normal btrfs/001");
        assert_eq!(test.artifact_patterns(), ["results/*/btrfs/001*"]);
    }

    #[test]
    fn classification_matches_check_conventions() {
        let config = config_for(&fake_fstests());
        let test = FsTest::new(TestId::new("btrfs/001"), 1, &config);

        let passed = test.classify(Some(0), b"ran everything fine", b"");
        assert_eq!(passed.status, TestStatus::Passed);

        let skipped = test.classify(Some(0), b"btrfs/001 [not run] no btrfs device", b"");
        assert_eq!(skipped.status, TestStatus::Skipped);

        let failed = test.classify(Some(1), b"output mismatch", b"");
        assert_eq!(failed.status, TestStatus::Failed);

        let killed = test.classify(None, b"", b"");
        assert_eq!(killed.status, TestStatus::Failed);
    }

    #[test]
    fn summary_comes_from_the_check_banner() {
        let stdout = "\n\n\n\n\n\n\nbtrfs/001 3s ... 2s\n";
        assert_eq!(check_summary(stdout), Some("3s ... 2s".to_owned()));
        assert_eq!(check_summary("short"), None);
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("btrfs/0*", "btrfs/001"));
        assert!(wildcard_match("*", "generic/100"));
        assert!(wildcard_match("btrfs/0?2", "btrfs/012"));
        assert!(!wildcard_match("btrfs/0*", "generic/001"));
        assert!(!wildcard_match("btrfs", "btrfs/001"));
    }
}
