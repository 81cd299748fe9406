// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervisor backends.
//!
//! Both backends drive a remote shell through a child process: `mkosi ssh`
//! for VMs the tool spawns itself, plain `ssh` for externally managed hosts.
//! The helpers here do the process-level work: spawning, streaming output
//! into sinks, timeout-kill, and tar-based artifact transfer.

pub mod custom;
pub mod mkosi;

pub use custom::CustomSupervisor;
pub use mkosi::MkosiSupervisor;

use crate::{
    errors::TransportError,
    test_output::{CaptureSink, OutputSink},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

/// Bound on liveness probes.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on artifact transfer per test.
pub(crate) const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a streamed command ended.
#[derive(Debug)]
pub(crate) enum CommandEnd {
    /// The command ran to completion.
    Exited(std::process::ExitStatus),
    /// The timeout elapsed and the command was killed.
    TimedOut,
}

/// Runs a command, streaming its stdout/stderr into the sinks as they
/// arrive. On timeout the child is killed; failure to kill it is
/// [`TransportError::AbortFailed`].
pub(crate) async fn run_streamed(
    mut command: Command,
    timeout: Option<Duration>,
    stdout: &mut dyn OutputSink,
    stderr: &mut dyn OutputSink,
) -> Result<CommandEnd, TransportError> {
    let command_str = command_display(&command);
    debug!("running command {command_str}");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|error| TransportError::Spawn {
        command: command_str,
        error,
    })?;
    let mut child_stdout = child.stdout.take().expect("stdout is piped");
    let mut child_stderr = child.stderr.take().expect("stderr is piped");

    let status = {
        let work = async {
            let (_, _, status) = tokio::try_join!(
                tokio::io::copy(&mut child_stdout, stdout),
                tokio::io::copy(&mut child_stderr, stderr),
                child.wait(),
            )?;
            Ok::<_, std::io::Error>(status)
        };
        tokio::pin!(work);
        match timeout {
            Some(timeout) => tokio::select! {
                res = &mut work => Some(res),
                _ = tokio::time::sleep(timeout) => None,
            },
            None => Some(work.await),
        }
    };

    match status {
        Some(Ok(status)) => Ok(CommandEnd::Exited(status)),
        Some(Err(error)) => Err(TransportError::Io(error)),
        None => {
            let _ = child.start_kill();
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => Ok(CommandEnd::TimedOut),
                Err(_) => Err(TransportError::AbortFailed),
            }
        }
    }
}

/// Runs a short remote command discarding output, returning its exit code
/// (`None` on timeout).
pub(crate) async fn run_quiet(
    command: Command,
    timeout: Duration,
) -> Result<Option<i32>, TransportError> {
    let mut stdout = CaptureSink::memory_only();
    let mut stderr = CaptureSink::memory_only();
    match run_streamed(command, Some(timeout), &mut stdout, &mut stderr).await? {
        CommandEnd::Exited(status) => Ok(status.code()),
        CommandEnd::TimedOut => Ok(None),
    }
}

/// Streams a remote `tar -cf -` into a local `tar -xf -` rooted at `dest`,
/// returning the files that landed, relative to `dest`.
pub(crate) async fn collect_tar_artifacts(
    remote_tar: Command,
    dest: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, TransportError> {
    let mut untar = Command::new("tar");
    untar
        .args(["-xf", "-", "-C", dest.as_str()])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut untar_child = untar.spawn().map_err(|error| TransportError::Spawn {
        command: "tar -xf -".to_owned(),
        error,
    })?;
    let mut tar_stdin = untar_child.stdin.take().expect("stdin is piped");
    let mut remote_stderr = CaptureSink::memory_only();

    let end = run_streamed(
        remote_tar,
        Some(ARTIFACT_TIMEOUT),
        &mut tar_stdin,
        &mut remote_stderr,
    )
    .await;

    // Close the pipe so the local tar sees EOF whatever happened remotely.
    let _ = tar_stdin.shutdown().await;
    drop(tar_stdin);
    let _ = tokio::time::timeout(Duration::from_secs(5), untar_child.wait()).await;

    match end? {
        CommandEnd::Exited(status) if status.success() => list_files_recursively(dest),
        CommandEnd::Exited(_) => {
            let detail = remote_stderr.excerpt();
            warn!(
                "artifact tar returned an error: {}",
                if detail.is_empty() { "(no stderr)" } else { detail.trim() },
            );
            // Partial extraction is still worth reporting.
            list_files_recursively(dest)
        }
        CommandEnd::TimedOut => {
            warn!("artifact collection timed out");
            list_files_recursively(dest)
        }
    }
}

fn list_files_recursively(dest: &Utf8Path) -> Result<Vec<Utf8PathBuf>, TransportError> {
    fn walk(
        root: &Utf8Path,
        dir: &Utf8Path,
        out: &mut Vec<Utf8PathBuf>,
    ) -> std::io::Result<()> {
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_owned());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dest, dest, &mut files).map_err(TransportError::Io)?;
    files.sort();
    Ok(files)
}

/// Resolves a program name against `PATH`.
pub(crate) fn find_program(name: &str) -> Option<Utf8PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Utf8PathBuf::try_from(candidate).ok();
        }
    }
    None
}

fn command_display(command: &Command) -> String {
    let std_command = command.as_std();
    let mut display = std_command.get_program().to_string_lossy().into_owned();
    for arg in std_command.get_args() {
        display.push(' ');
        display.push_str(&arg.to_string_lossy());
    }
    display
}
