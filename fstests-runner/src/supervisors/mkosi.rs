// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The mkosi VM supervisor.
//!
//! Each supervisor owns one `mkosi qemu` machine, named `ff-<index>-<suffix>`
//! so parallel invocations cannot collide. All remote work goes through
//! `mkosi --machine <name> ssh`.

use super::{
    collect_tar_artifacts, find_program, run_quiet, run_streamed, CommandEnd, ARTIFACT_TIMEOUT,
    PROBE_TIMEOUT,
};
use crate::{
    config::Config,
    errors::{ConfigError, StartupError, TransportError},
    supervisor::{Liveness, RunOutput, Supervisor, SupervisorState},
    test_case::TestCase,
    test_output::{CaptureSink, OutputSink},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use std::{process::Stdio, time::Duration};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct MkosiSupervisor {
    name: String,
    program: Utf8PathBuf,
    config_dir: Utf8PathBuf,
    machine_args: Vec<String>,
    fstests_dir: Utf8PathBuf,
    dmesg: bool,
    state: SupervisorState,
    qemu: Option<Child>,
}

impl MkosiSupervisor {
    /// Creates the configured number of supervisors, each with a unique
    /// machine name.
    pub fn pool(config: &Config) -> Result<Vec<Self>, ConfigError> {
        let config_dir = config
            .mkosi
            .config
            .clone()
            .ok_or_else(|| ConfigError::invalid("mkosi config path not specified"))?;
        let fstests_dir = config
            .mkosi
            .fstests
            .clone()
            .ok_or_else(|| ConfigError::invalid("path to fstests on the mkosi VM not specified"))?;
        let program = find_program("mkosi")
            .ok_or_else(|| ConfigError::invalid("mkosi not found on PATH"))?;

        let mut rng = rand::thread_rng();
        Ok((0..config.mkosi.num)
            .map(|index| {
                let suffix: String = (0..8)
                    .map(|_| rng.gen_range(b'a'..=b'z') as char)
                    .collect();
                let name = format!("ff-{index}-{suffix}");

                let mut machine_args = vec!["--machine".to_owned(), name.clone()];
                if let Some(include) = &config.mkosi.include {
                    machine_args.push(format!("--include={include}"));
                }
                machine_args.extend(config.mkosi.options.iter().cloned());

                Self {
                    name,
                    program: program.clone(),
                    config_dir: config_dir.clone(),
                    machine_args,
                    fstests_dir: fstests_dir.clone(),
                    dmesg: config.test_runner.dmesg,
                    state: SupervisorState::Uninitialized,
                    qemu: None,
                }
            })
            .collect())
    }

    /// Builds the VM image before the pool is spawned, inheriting the
    /// terminal so mkosi's own progress is visible. `force` is how many
    /// `-f`s to pass.
    pub fn build_image(&self, force: u32) -> Result<(), StartupError> {
        let mut command = std::process::Command::new(&self.program);
        command.args(&self.machine_args);
        if force > 0 {
            command.arg(format!("-{}", "f".repeat(force as usize)));
        }
        command.arg("build");
        command.current_dir(&self.config_dir);
        let display = format!("{} build", self.program);

        let status = command.status().map_err(|error| StartupError::Spawn {
            command: display.clone(),
            error,
        })?;
        if !status.success() {
            return Err(StartupError::Exited {
                message: format!("`{display}` exited with {status}"),
            });
        }
        Ok(())
    }

    fn mkosi_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.machine_args);
        command.current_dir(&self.config_dir);
        command
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut command = self.mkosi_command();
        command.arg("ssh");
        command.arg(remote);
        command
    }

    fn machine_running(&mut self) -> bool {
        match self.qemu.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn poke(&self) -> Result<Option<i32>, TransportError> {
        run_quiet(self.ssh_command("echo POKE"), PROBE_TIMEOUT).await
    }

    /// Polls the machine until it answers over ssh. The qemu process dying
    /// first is a startup failure.
    async fn wait_for_machine(&mut self) -> Result<(), StartupError> {
        loop {
            if !self.machine_running() {
                return Err(StartupError::Exited {
                    message: self.drain_qemu_output().await,
                });
            }
            match self.poke().await {
                Ok(Some(0)) => return Ok(()),
                Ok(Some(_)) | Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                // The probe itself timed out; the machine is still booting.
                Ok(None) => {}
            }
        }
    }

    /// Kills the qemu child and returns whatever it printed, for error
    /// reporting.
    async fn drain_qemu_output(&mut self) -> String {
        let Some(mut child) = self.qemu.take() else {
            return "mkosi machine exited unexpectedly".to_owned();
        };
        let _ = child.start_kill();
        match tokio::time::timeout(Duration::from_secs(5), child.wait_with_output()).await {
            Ok(Ok(output)) => format!(
                "mkosi machine exited unexpectedly\n\
                 make sure the image was built with the same flags passed to fast-fstests\n\
                 mkosi stdout: {}\nmkosi stderr: {}",
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim(),
            ),
            _ => "mkosi machine exited unexpectedly".to_owned(),
        }
    }
}

#[async_trait]
impl Supervisor for MkosiSupervisor {
    fn id(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, timeout: Duration) -> Result<(), StartupError> {
        debug!("spawning mkosi machine {}", self.name);
        self.state = SupervisorState::Starting;
        let mut command = self.mkosi_command();
        command
            .arg("qemu")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|error| StartupError::Spawn {
            command: format!("{} qemu", self.program),
            error,
        })?;
        self.qemu = Some(child);

        match tokio::time::timeout(timeout, self.wait_for_machine()).await {
            Ok(Ok(())) => {
                self.state = SupervisorState::Ready;
                Ok(())
            }
            Ok(Err(error)) => {
                self.state = SupervisorState::Crashed;
                Err(error)
            }
            Err(_) => {
                let detail = self.drain_qemu_output().await;
                warn!("timed out waiting for mkosi machine {}: {detail}", self.name);
                self.state = SupervisorState::Crashed;
                Err(StartupError::Timeout { timeout })
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
        if !self.machine_running() {
            self.state = SupervisorState::Crashed;
            return Err(TransportError::Disconnected);
        }
        self.state = SupervisorState::Busy;
        let remote = format!("cd {}; {}", self.fstests_dir, test.command());
        let end = run_streamed(self.ssh_command(&remote), timeout, stdout, stderr).await;
        match end {
            Ok(CommandEnd::Exited(status)) => {
                self.state = SupervisorState::Ready;
                Ok(RunOutput {
                    exit_code: status.code(),
                    timed_out: false,
                })
            }
            Ok(CommandEnd::TimedOut) => {
                self.state = SupervisorState::Ready;
                Ok(RunOutput {
                    exit_code: None,
                    timed_out: true,
                })
            }
            Err(error) => {
                self.state = SupervisorState::Crashed;
                Err(error)
            }
        }
    }

    async fn probe(&mut self) -> Liveness {
        if self.state != SupervisorState::Ready || !self.machine_running() {
            return Liveness::Dead;
        }
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
        let mut collected = Vec::new();

        if !patterns.is_empty() {
            // globstar so `**` patterns expand on the VM side.
            let remote = format!(
                "cd {}; bash -O globstar -c 'tar -cf - {} 2>/dev/null'",
                self.fstests_dir,
                patterns.join(" "),
            );
            collected = collect_tar_artifacts(self.ssh_command(&remote), dest).await?;
        } else {
            debug!("no artifact patterns defined for test {}", test.id());
        }

        if self.dmesg {
            let dmesg_path = dest.join("dmesg");
            let mut sink = CaptureSink::file_backed(&dmesg_path)
                .await
                .map_err(TransportError::Io)?;
            let mut discard = CaptureSink::memory_only();
            match run_streamed(
                self.ssh_command("dmesg"),
                Some(ARTIFACT_TIMEOUT),
                &mut sink,
                &mut discard,
            )
            .await
            {
                Ok(CommandEnd::Exited(status)) if status.success() => {
                    let _ = sink.finish().await;
                    collected.push(Utf8PathBuf::from("dmesg"));
                }
                Ok(_) | Err(_) => {
                    warn!("dmesg capture failed on {}", self.name);
                    let _ = std::fs::remove_file(&dmesg_path);
                }
            }
        }

        Ok(collected)
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.qemu.take() {
            debug!("stopping mkosi machine {}", self.name);
            self.state = SupervisorState::Stopping;
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
        self.state = SupervisorState::Stopped;
    }
}
