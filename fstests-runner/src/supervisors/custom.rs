// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervisors over externally managed hosts.
//!
//! Configured as `HOST:FSTESTS_PATH` pairs. The host is whatever `ssh`
//! resolves (including `~/.ssh/config` aliases). These machines belong to
//! the user: start only verifies reachability and stop never kills anything.

use super::{collect_tar_artifacts, run_quiet, run_streamed, CommandEnd, PROBE_TIMEOUT};
use crate::{
    config::Config,
    errors::{ConfigError, StartupError, TransportError},
    supervisor::{Liveness, RunOutput, Supervisor},
    test_case::TestCase,
    test_output::OutputSink,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug)]
pub struct CustomSupervisor {
    host: String,
    fstests_dir: Utf8PathBuf,
}

impl CustomSupervisor {
    /// Builds one supervisor per configured `HOST:FSTESTS_PATH` pair.
    pub fn pool(config: &Config) -> Result<Vec<Self>, ConfigError> {
        config
            .custom_vm
            .vms
            .iter()
            .map(|spec| {
                let (host, fstests_dir) = spec.split_once(':').ok_or_else(|| {
                    ConfigError::invalid(format!("custom VM `{spec}` must be HOST:FSTESTS_PATH"))
                })?;
                Ok(Self {
                    host: host.to_owned(),
                    fstests_dir: Utf8PathBuf::from(fstests_dir),
                })
            })
            .collect()
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut command = Command::new("ssh");
        command.arg(&self.host);
        command.arg(remote);
        command
    }

    async fn poke(&self) -> Result<Option<i32>, TransportError> {
        run_quiet(self.ssh_command("echo POKE"), PROBE_TIMEOUT).await
    }
}

#[async_trait]
impl Supervisor for CustomSupervisor {
    fn id(&self) -> &str {
        &self.host
    }

    async fn start(&mut self, timeout: Duration) -> Result<(), StartupError> {
        debug!("verifying reachability of {}", self.host);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.poke().await {
                Ok(Some(0)) => return Ok(()),
                Ok(_) | Err(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(StartupError::Timeout { timeout });
                }
                Ok(_) | Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    async fn run_test(
        &mut self,
        test: &dyn TestCase,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, TransportError> {
        let remote = format!("cd {}; {}", self.fstests_dir, test.command());
        match run_streamed(self.ssh_command(&remote), timeout, stdout, stderr).await? {
            CommandEnd::Exited(status) => Ok(RunOutput {
                exit_code: status.code(),
                timed_out: false,
            }),
            CommandEnd::TimedOut => Ok(RunOutput {
                exit_code: None,
                timed_out: true,
            }),
        }
    }

    async fn probe(&mut self) -> Liveness {
        match self.poke().await {
            Ok(Some(0)) => Liveness::Alive,
            _ => Liveness::Dead,
        }
    }

    async fn collect_artifacts(
        &mut self,
        test: &dyn TestCase,
        dest: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError> {
        let patterns = test.artifact_patterns();
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        let remote = format!(
            "cd {}; bash -O globstar -c 'tar -cf - {} 2>/dev/null'",
            self.fstests_dir,
            patterns.join(" "),
        );
        collect_tar_artifacts(self.ssh_command(&remote), dest).await
    }

    async fn stop(&mut self) {
        // Externally managed; leave the host exactly as we found it.
    }
}
