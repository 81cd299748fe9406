// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named, never-deleted references to prior runs.
//!
//! A recording is a symlink `recordings/<label>` pointing at a run directory.
//! Creating one never copies data, and nothing in the tool ever deletes one;
//! their lifetime is the user's to manage.

use crate::{
    errors::RecordingError,
    store::{LATEST_LINK_NAME, RECORDINGS_DIR_NAME},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::{fmt, io, str::FromStr, time::SystemTime};

/// A reference to a prior run, resolvable against a results directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceRef {
    /// The most recent run (`latest`).
    Latest,
    /// A recording by label.
    Label(String),
    /// The k-th most recent recording by modification time (`-1` is the most
    /// recent).
    Nth(u32),
}

impl FromStr for SourceRef {
    type Err = InvalidSourceRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "latest" {
            return Ok(SourceRef::Latest);
        }
        if let Some(rest) = s.strip_prefix('-') {
            let n: u32 = rest.parse().map_err(|_| InvalidSourceRef {
                input: s.to_owned(),
            })?;
            if n == 0 {
                return Err(InvalidSourceRef {
                    input: s.to_owned(),
                });
            }
            return Ok(SourceRef::Nth(n));
        }
        Ok(SourceRef::Label(s.to_owned()))
    }
}

impl TryFrom<String> for SourceRef {
    type Error = InvalidSourceRef;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SourceRef> for String {
    fn from(source: SourceRef) -> Self {
        source.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Latest => f.write_str("latest"),
            SourceRef::Label(label) => f.write_str(label),
            SourceRef::Nth(n) => write!(f, "-{n}"),
        }
    }
}

/// Error parsing a [`SourceRef`].
#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid run reference: {input} (expected `latest`, a label, or -K)")]
pub struct InvalidSourceRef {
    /// The unrecognized input.
    pub input: String,
}

/// Lists recording labels, sorted most recent first by modification time.
pub fn list_recordings(results_dir: &Utf8Path) -> Result<Vec<String>, RecordingError> {
    let rec_dir = results_dir.join(RECORDINGS_DIR_NAME);
    let entries = match rec_dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(RecordingError::Io {
                path: rec_dir,
                error,
            });
        }
    };

    let mut labeled: Vec<(SystemTime, String)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| RecordingError::Io {
            path: rec_dir.clone(),
            error,
        })?;
        // The symlink's own mtime is the recording's creation time.
        let mtime = entry
            .path()
            .symlink_metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        labeled.push((mtime, entry.file_name().to_owned()));
    }
    labeled.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(labeled.into_iter().map(|(_, label)| label).collect())
}

/// Resolves a [`SourceRef`] to a run directory.
pub fn resolve_source(
    results_dir: &Utf8Path,
    source: &SourceRef,
) -> Result<Utf8PathBuf, RecordingError> {
    let path = match source {
        SourceRef::Latest => results_dir.join(LATEST_LINK_NAME),
        SourceRef::Label(label) => results_dir.join(RECORDINGS_DIR_NAME).join(label),
        SourceRef::Nth(n) => {
            let labels = list_recordings(results_dir)?;
            let label = labels.get(*n as usize - 1).ok_or_else(|| {
                RecordingError::NotFound {
                    source_ref: source.to_string(),
                    available: labels.clone(),
                }
            })?;
            results_dir.join(RECORDINGS_DIR_NAME).join(label)
        }
    };

    if !path.is_dir() {
        if matches!(source, SourceRef::Latest) {
            return Err(RecordingError::NoLatestRun {
                results_dir: results_dir.to_owned(),
            });
        }
        return Err(RecordingError::NotFound {
            source_ref: source.to_string(),
            available: list_recordings(results_dir)?,
        });
    }
    Ok(path)
}

/// Creates a recording of the `latest` run.
///
/// The label defaults to a timestamp. An existing label is an error unless
/// `force` is set. Returns the label and the run directory it now points at.
pub fn create_recording(
    results_dir: &Utf8Path,
    label: Option<String>,
    force: bool,
) -> Result<(String, Utf8PathBuf), RecordingError> {
    let latest = results_dir.join(LATEST_LINK_NAME);
    let target = std::fs::read_link(&latest).map_err(|_| RecordingError::NoLatestRun {
        results_dir: results_dir.to_owned(),
    })?;
    let target =
        Utf8PathBuf::try_from(target).map_err(|error| RecordingError::Io {
            path: latest.clone(),
            error: error.into_io_error(),
        })?;

    let label = label.unwrap_or_else(|| Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    let link = results_dir.join(RECORDINGS_DIR_NAME).join(&label);
    if link.symlink_metadata().is_ok() {
        if !force {
            return Err(RecordingError::AlreadyExists { label });
        }
        std::fs::remove_file(&link).map_err(|error| RecordingError::Io {
            path: link.clone(),
            error,
        })?;
    }

    // `latest` holds a path relative to the results dir; recordings live one
    // level deeper.
    let rec_target = Utf8PathBuf::from("..").join(&target);
    crate::store::swap_symlink(&rec_target, &link).map_err(|error| RecordingError::Io {
        path: link.clone(),
        error,
    })?;

    Ok((label, results_dir.join(target)))
}
