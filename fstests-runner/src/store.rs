// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk storage for run results.
//!
//! The layout is deterministic and relied upon by the reporter and the
//! comparator:
//!
//! ```text
//! <results_dir>/
//!   tests/<test_id>/<run_id>[-<iteration>]/
//!     status            # textual TestStatus
//!     stdout            # full capture
//!     stderr            # full capture
//!     meta.json         # the TestResult record
//!     artifacts/...     # backend-supplied files
//!     attempts/<n>/...  # non-final attempts, same shape
//!   runs/<run_id>/
//!     config.toml       # captured configuration for this run
//!     results.jsonl     # one TestResult per line, in completion order
//!     tests -> ../../tests
//!   latest -> runs/<run_id>
//!   recordings/<label> -> runs/<run_id>
//! ```
//!
//! Writes are append-only during a run. `results.jsonl` is flushed after
//! every line, and the `latest` symlink is swapped atomically right after run
//! initialization, so an interrupted run still leaves a coherent `latest`
//! with a parseable prefix.

use crate::{
    errors::StoreError,
    test_case::{TestId, TestResult},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{self, LineWriter, Write},
    sync::Arc,
};

pub(crate) static RESULTS_FILE_NAME: &str = "results.jsonl";
pub(crate) static CONFIG_SNAPSHOT_NAME: &str = "config.toml";
pub(crate) static LATEST_LINK_NAME: &str = "latest";
pub(crate) static RUNS_DIR_NAME: &str = "runs";
pub(crate) static TESTS_DIR_NAME: &str = "tests";
pub(crate) static RECORDINGS_DIR_NAME: &str = "recordings";

/// Identifies one run: a timestamp string that sorts chronologically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunId(String);

impl RunId {
    /// A run id for the current instant.
    pub fn now() -> Self {
        Self(Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manages the results directory.
#[derive(Clone, Debug)]
pub struct ResultStore {
    results_dir: Utf8PathBuf,
}

impl ResultStore {
    /// Opens (creating if needed) the store at `results_dir`.
    pub fn new(results_dir: &Utf8Path) -> Result<Self, StoreError> {
        for sub in [TESTS_DIR_NAME, RUNS_DIR_NAME, RECORDINGS_DIR_NAME] {
            let dir = results_dir.join(sub);
            std::fs::create_dir_all(&dir)
                .map_err(|error| StoreError::DirCreate { path: dir, error })?;
        }
        Ok(Self {
            results_dir: results_dir.to_owned(),
        })
    }

    /// The store's root directory.
    pub fn results_dir(&self) -> &Utf8Path {
        &self.results_dir
    }

    /// The directory of the run named by `run_id`.
    pub fn run_dir(&self, run_id: &RunId) -> Utf8PathBuf {
        self.results_dir.join(RUNS_DIR_NAME).join(run_id.as_str())
    }

    /// Creates the run directory, captures the configuration, and swaps the
    /// `latest` pointer. The returned recorder owns the `results.jsonl`
    /// writer.
    pub fn begin_run(&self, run_id: RunId, config_toml: &str) -> Result<RunRecorder, StoreError> {
        let run_dir = self.run_dir(&run_id);
        std::fs::create_dir_all(&run_dir).map_err(|error| StoreError::DirCreate {
            path: run_dir.clone(),
            error,
        })?;

        let config_path = run_dir.join(CONFIG_SNAPSHOT_NAME);
        atomicwrites::AtomicFile::new(&config_path, atomicwrites::AllowOverwrite)
            .write(|file| file.write_all(config_toml.as_bytes()))
            .map_err(|error| StoreError::Write {
                path: config_path,
                error: match error {
                    atomicwrites::Error::Internal(error) => error,
                    atomicwrites::Error::User(error) => error,
                },
            })?;

        // Index symlink so a run directory is self-contained to navigate.
        let tests_link = run_dir.join(TESTS_DIR_NAME);
        if !tests_link.exists() {
            symlink_dir(Utf8Path::new("../../tests"), &tests_link).map_err(|error| {
                StoreError::Write {
                    path: tests_link,
                    error,
                }
            })?;
        }

        let results_path = run_dir.join(RESULTS_FILE_NAME);
        let file = File::create(&results_path).map_err(|error| StoreError::Write {
            path: results_path.clone(),
            error,
        })?;

        // The pointer swap happens after the run directory is fully formed, so
        // `latest` never resolves to a half-created run.
        let latest = self.results_dir.join(LATEST_LINK_NAME);
        let target = Utf8PathBuf::from(format!("{RUNS_DIR_NAME}/{run_id}"));
        swap_symlink(&target, &latest).map_err(|error| StoreError::LatestSwap {
            path: latest,
            error,
        })?;

        Ok(RunRecorder {
            paths: Arc::new(RunPaths {
                results_dir: self.results_dir.clone(),
                run_id,
            }),
            results_path,
            writer: LineWriter::new(file),
        })
    }

    /// Resolves the `latest` pointer to a run directory.
    pub fn latest_run_dir(&self) -> Option<Utf8PathBuf> {
        let latest = self.results_dir.join(LATEST_LINK_NAME);
        let target = std::fs::read_link(&latest).ok()?;
        let target = Utf8PathBuf::try_from(target).ok()?;
        let resolved = if target.is_absolute() {
            target
        } else {
            self.results_dir.join(target)
        };
        resolved.is_dir().then_some(resolved)
    }
}

/// Records one run: the `results.jsonl` single writer plus path bookkeeping
/// shared with workers.
#[derive(Debug)]
pub struct RunRecorder {
    paths: Arc<RunPaths>,
    results_path: Utf8PathBuf,
    writer: LineWriter<File>,
}

impl RunRecorder {
    /// Path bookkeeping shared with workers, which write their test
    /// directories independently.
    pub fn paths(&self) -> Arc<RunPaths> {
        Arc::clone(&self.paths)
    }

    /// Appends one result line and flushes it, so a crash leaves at most one
    /// truncated trailing line.
    pub fn append_result(&mut self, result: &TestResult) -> Result<(), StoreError> {
        let line = serde_json::to_string(result).map_err(StoreError::Serialize)?;
        let write = |writer: &mut LineWriter<File>| -> io::Result<()> {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()
        };
        write(&mut self.writer).map_err(|error| StoreError::Write {
            path: self.results_path.clone(),
            error,
        })
    }
}

/// Path layout for one run, usable concurrently from worker tasks.
#[derive(Debug)]
pub struct RunPaths {
    results_dir: Utf8PathBuf,
    run_id: RunId,
}

impl RunPaths {
    /// This run's id.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The result directory for one `(test, iteration)` of this run.
    pub fn test_dir(&self, test_id: &TestId, iteration: u32) -> Utf8PathBuf {
        let leaf = if iteration <= 1 {
            self.run_id.as_str().to_owned()
        } else {
            format!("{}-{iteration}", self.run_id)
        };
        self.results_dir
            .join(TESTS_DIR_NAME)
            .join(test_id.as_str())
            .join(leaf)
    }

    /// Creates and returns the directory one attempt writes into: the test
    /// directory itself for the attempt that will be authoritative,
    /// `attempts/<n>/` otherwise.
    pub fn create_attempt_dir(
        &self,
        test_id: &TestId,
        iteration: u32,
        attempt_index: u32,
        is_final: bool,
    ) -> Result<Utf8PathBuf, StoreError> {
        let base = self.test_dir(test_id, iteration);
        let dir = if is_final {
            base
        } else {
            base.join("attempts").join(attempt_index.to_string())
        };
        std::fs::create_dir_all(&dir).map_err(|error| StoreError::DirCreate {
            path: dir.clone(),
            error,
        })?;
        Ok(dir)
    }

    /// Moves a persisted attempt's files up to the top of the test directory,
    /// making it the authoritative record there.
    ///
    /// Attempts stream their captures into `attempts/<n>/` while running,
    /// since whether an attempt is final is only known once it has been
    /// classified; renames within the store are cheap.
    pub fn promote_final_attempt(
        &self,
        test_id: &TestId,
        iteration: u32,
        attempt_index: u32,
    ) -> Result<(), StoreError> {
        let base = self.test_dir(test_id, iteration);
        let attempts_dir = base.join("attempts");
        let attempt_dir = attempts_dir.join(attempt_index.to_string());
        if !attempt_dir.is_dir() {
            return Ok(());
        }

        let entries = attempt_dir
            .read_dir_utf8()
            .map_err(|error| StoreError::Read {
                path: attempt_dir.clone(),
                error,
            })?;
        for entry in entries {
            let entry = entry.map_err(|error| StoreError::Read {
                path: attempt_dir.clone(),
                error,
            })?;
            let to = base.join(entry.file_name());
            std::fs::rename(entry.path(), &to).map_err(|error| StoreError::Write {
                path: to,
                error,
            })?;
        }
        let _ = std::fs::remove_dir(&attempt_dir);
        let _ = std::fs::remove_dir(&attempts_dir);
        Ok(())
    }
}

/// Writes an attempt's `status` and `meta.json` into its directory.
pub fn write_attempt_record(dir: &Utf8Path, result: &TestResult) -> Result<(), StoreError> {
    let status_path = dir.join("status");
    std::fs::write(&status_path, format!("{}\n", result.status)).map_err(|error| {
        StoreError::Write {
            path: status_path,
            error,
        }
    })?;

    let meta_path = dir.join("meta.json");
    let meta = serde_json::to_vec_pretty(result).map_err(StoreError::Serialize)?;
    std::fs::write(&meta_path, meta).map_err(|error| StoreError::Write {
        path: meta_path,
        error,
    })
}

/// Reads a run's results in completion order.
///
/// A truncated trailing line (crash mid-write) is tolerated; corruption
/// anywhere else is an error.
pub fn read_run_results(run_dir: &Utf8Path) -> Result<Vec<TestResult>, StoreError> {
    let path = run_dir.join(RESULTS_FILE_NAME);
    let contents = std::fs::read_to_string(&path).map_err(|error| StoreError::Read {
        path: path.clone(),
        error,
    })?;

    let lines: Vec<&str> = contents.lines().collect();
    let mut results = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TestResult>(line) {
            Ok(result) => results.push(result),
            Err(error) if index + 1 == lines.len() => {
                tracing::debug!("ignoring truncated trailing result line: {error}");
            }
            Err(error) => {
                return Err(StoreError::Deserialize {
                    path,
                    line: index + 1,
                    error,
                });
            }
        }
    }
    Ok(results)
}

/// Reduces a run's attempt records to the authoritative outcome per test:
/// the last persisted attempt wins.
pub fn final_outcomes(results: &[TestResult]) -> BTreeMap<TestId, &TestResult> {
    let mut outcomes = BTreeMap::new();
    for result in results {
        outcomes.insert(result.test_id.clone(), result);
    }
    outcomes
}

#[cfg(unix)]
fn symlink_dir(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Atomically repoints `link` at `target` via a temporary name and rename.
pub(crate) fn swap_symlink(target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
    let parent = link.parent().expect("symlink has a parent directory");
    let tmp = parent.join(format!(".{}.tmp-{}", link.file_name().unwrap_or("link"), std::process::id()));
    // A stale temp link from a crashed process may exist.
    let _ = std::fs::remove_file(&tmp);
    symlink_dir(target, &tmp)?;
    std::fs::rename(&tmp, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::TestStatus;
    use chrono::TimeZone;

    fn sample_result(id: &str, status: TestStatus, attempt: u32) -> TestResult {
        let started_at = Utc.with_ymd_and_hms(2026, 5, 14, 12, 0, 0).unwrap();
        TestResult {
            test_id: TestId::new(id),
            iteration_index: 1,
            status,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(42),
            duration_seconds: 42.0,
            supervisor_id: "ff-0".to_owned(),
            attempt_index: attempt,
            stdout_excerpt: "output".to_owned(),
            stderr_excerpt: String::new(),
            artifacts: vec!["artifacts/001.out.bad".into()],
            diagnostics: BTreeMap::from([("dmesg".to_owned(), "clean".to_owned())]),
        }
    }

    #[test]
    fn results_round_trip_through_the_store() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        let run_id = RunId::now();
        let mut recorder = store.begin_run(run_id.clone(), "# config\n").unwrap();

        let first = sample_result("btrfs/001", TestStatus::Failed, 1);
        let second = sample_result("btrfs/001", TestStatus::Passed, 2);
        recorder.append_result(&first).unwrap();
        recorder.append_result(&second).unwrap();

        let run_dir = store.run_dir(&run_id);
        let read = read_run_results(&run_dir).unwrap();
        assert_eq!(read, vec![first, second.clone()]);

        // The last attempt is authoritative.
        let outcomes = final_outcomes(&read);
        assert_eq!(outcomes[&TestId::new("btrfs/001")].status, TestStatus::Passed);
        assert_eq!(outcomes[&TestId::new("btrfs/001")], &second);
    }

    #[test]
    fn latest_always_points_at_a_wellformed_run() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();

        let first = RunId::now();
        let _recorder = store.begin_run(first.clone(), "").unwrap();
        assert_eq!(store.latest_run_dir().unwrap(), store.run_dir(&first));
        // An empty run still has a readable (empty) results file.
        assert_eq!(read_run_results(&store.run_dir(&first)).unwrap(), vec![]);

        let second = RunId(format!("{}-b", first));
        let _recorder = store.begin_run(second.clone(), "").unwrap();
        assert_eq!(store.latest_run_dir().unwrap(), store.run_dir(&second));
    }

    #[test]
    fn truncated_trailing_line_is_tolerated() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        let run_id = RunId::now();
        let mut recorder = store.begin_run(run_id.clone(), "").unwrap();
        recorder.append_result(&sample_result("ext4/100", TestStatus::Passed, 1)).unwrap();
        drop(recorder);

        let path = store.run_dir(&run_id).join(RESULTS_FILE_NAME);
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"test_id\":\"ext4/101\",\"stat");
        std::fs::write(&path, contents).unwrap();

        let read = read_run_results(&store.run_dir(&run_id)).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].test_id, TestId::new("ext4/100"));
    }

    #[test]
    fn attempt_dirs_separate_iterations_and_attempts() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        let recorder = store.begin_run(RunId::now(), "").unwrap();
        let paths = recorder.paths();

        let final_dir = paths
            .create_attempt_dir(&TestId::new("btrfs/001"), 1, 2, true)
            .unwrap();
        assert_eq!(final_dir, paths.test_dir(&TestId::new("btrfs/001"), 1));

        let retry_dir = paths
            .create_attempt_dir(&TestId::new("btrfs/001"), 1, 1, false)
            .unwrap();
        assert_eq!(
            retry_dir,
            paths.test_dir(&TestId::new("btrfs/001"), 1).join("attempts/1")
        );

        let iter_dir = paths.test_dir(&TestId::new("btrfs/001"), 3);
        assert!(iter_dir.as_str().ends_with(&format!("{}-3", paths.run_id())));

        let result = sample_result("btrfs/001", TestStatus::Passed, 2);
        write_attempt_record(&final_dir, &result).unwrap();
        assert_eq!(
            std::fs::read_to_string(final_dir.join("status")).unwrap(),
            "passed\n"
        );
        let meta: TestResult =
            serde_json::from_slice(&std::fs::read(final_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta, result);
    }

    #[test]
    fn promoting_an_attempt_moves_its_files_to_the_top() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        let recorder = store.begin_run(RunId::now(), "").unwrap();
        let paths = recorder.paths();
        let test_id = TestId::new("btrfs/001");

        let attempt_1 = paths.create_attempt_dir(&test_id, 1, 1, false).unwrap();
        write_attempt_record(&attempt_1, &sample_result("btrfs/001", TestStatus::Failed, 1))
            .unwrap();

        let attempt_2 = paths.create_attempt_dir(&test_id, 1, 2, false).unwrap();
        let final_result = sample_result("btrfs/001", TestStatus::Passed, 2);
        write_attempt_record(&attempt_2, &final_result).unwrap();
        std::fs::write(attempt_2.join("stdout"), "final stdout").unwrap();

        paths.promote_final_attempt(&test_id, 1, 2).unwrap();

        let base = paths.test_dir(&test_id, 1);
        assert_eq!(
            std::fs::read_to_string(base.join("status")).unwrap(),
            "passed\n"
        );
        assert_eq!(
            std::fs::read_to_string(base.join("stdout")).unwrap(),
            "final stdout"
        );
        // The non-final attempt stays where it was.
        assert_eq!(
            std::fs::read_to_string(base.join("attempts/1/status")).unwrap(),
            "failed\n"
        );
        assert!(!base.join("attempts/2").exists());
    }
}
