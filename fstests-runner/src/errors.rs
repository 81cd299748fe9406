// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the runner library.

use camino::Utf8PathBuf;
use std::{io, time::Duration};
use thiserror::Error;

/// An error that occurred while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file `{path}`")]
    Read {
        /// The path to the config file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The configuration file could not be parsed. Unknown keys are rejected.
    #[error("failed to parse config file `{path}`")]
    Parse {
        /// The path to the config file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },

    /// The settled configuration is not usable.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Why the configuration was rejected.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            message: message.into(),
        }
    }
}

/// A supervisor failed to come up.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The supervisor's backing process could not be spawned.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command that was spawned.
        command: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The supervisor did not become reachable within the startup timeout.
    #[error("supervisor did not come up within {}s", .timeout.as_secs())]
    Timeout {
        /// The startup timeout that was exceeded.
        timeout: Duration,
    },

    /// The supervisor's backing process exited before becoming ready.
    #[error("supervisor exited during startup: {message}")]
    Exited {
        /// Captured detail, typically the process's stderr.
        message: String,
    },
}

/// The transport to a supervisor failed mid-operation.
///
/// A transport error marks the supervisor as crashed; the dispatcher decides
/// whether to restart it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A command could not be spawned over the transport.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command that was spawned.
        command: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// I/O over the transport failed.
    #[error("transport i/o failed")]
    Io(#[source] io::Error),

    /// A timed-out command could not be aborted; the supervisor is unusable.
    #[error("failed to abort in-flight command")]
    AbortFailed,

    /// The supervisor's backing process is gone.
    #[error("supervisor process exited unexpectedly")]
    Disconnected,
}

/// An error raised by the result store.
///
/// Store errors are fatal to a run: the run's output is the product.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A directory could not be created.
    #[error("failed to create directory `{path}`")]
    DirCreate {
        /// The directory that could not be created.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A file under the store could not be written.
    #[error("failed to write `{path}`")]
    Write {
        /// The file that could not be written.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A file under the store could not be read.
    #[error("failed to read `{path}`")]
    Read {
        /// The file that could not be read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A result record could not be serialized.
    #[error("failed to serialize test result")]
    Serialize(#[source] serde_json::Error),

    /// A persisted result record could not be deserialized.
    #[error("failed to parse result line {line} of `{path}`")]
    Deserialize {
        /// The results file.
        path: Utf8PathBuf,
        /// The 1-based line number.
        line: usize,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The `latest` symlink could not be swapped.
    #[error("failed to update latest pointer `{path}`")]
    LatestSwap {
        /// The symlink path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error resolving or creating a recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The named recording does not exist.
    #[error("recording not found: {source_ref}{}", format_available(.available))]
    NotFound {
        /// The recording reference that failed to resolve.
        source_ref: String,
        /// Recordings that do exist, for the error message.
        available: Vec<String>,
    },

    /// A recording with this label already exists and `--force` was not given.
    #[error("recording `{label}` already exists (pass --force to replace it)")]
    AlreadyExists {
        /// The requested label.
        label: String,
    },

    /// There is no `latest` run to record or resolve.
    #[error("no recent run found under `{results_dir}`")]
    NoLatestRun {
        /// The results directory that was searched.
        results_dir: Utf8PathBuf,
    },

    /// Filesystem manipulation under `recordings/` failed.
    #[error("failed to access recording `{path}`")]
    Io {
        /// The offending path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

fn format_available(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(" (available: {})", available.join(", "))
    }
}

/// An error that occurred while collecting tests from an fstests checkout.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The host fstests path is not configured.
    #[error("path to fstests not defined (set `fstests` or pass --fstests)")]
    FstestsPathMissing,

    /// The fstests tree could not be read.
    #[error("failed to read fstests tree at `{path}`")]
    Io {
        /// The offending path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while building a test runner.
#[derive(Debug, Error)]
pub enum TestRunnerBuildError {
    /// The tokio runtime could not be created.
    #[error("failed to create the async runtime")]
    RuntimeCreate(#[source] io::Error),

    /// Signal handling could not be installed.
    #[error("failed to set up the signal handler")]
    SignalHandlerSetup(#[source] io::Error),
}

/// An error that aborts a whole run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Every supervisor failed startup; there is nothing to run tests on.
    #[error("no supervisors available: all {attempted} failed startup")]
    NoSupervisorsAvailable {
        /// How many supervisors were attempted.
        attempted: usize,
    },

    /// All supervisors were lost mid-run with work still outstanding.
    #[error("all supervisors lost with {outstanding} tests outstanding")]
    AllSupervisorsLost {
        /// Items that had not been finalized when the pool died.
        outstanding: usize,
    },

    /// The result store failed; the run's output cannot be trusted.
    #[error("result store failure")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_not_found_lists_available() {
        let err = RecordingError::NotFound {
            source_ref: "-3".to_owned(),
            available: vec!["baseline".to_owned(), "patched".to_owned()],
        };
        assert_eq!(
            err.to_string(),
            "recording not found: -3 (available: baseline, patched)"
        );

        let err = RecordingError::NotFound {
            source_ref: "nope".to_owned(),
            available: Vec::new(),
        };
        assert_eq!(err.to_string(), "recording not found: nope");
    }
}
