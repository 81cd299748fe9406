// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration.
//!
//! One plain [`Config`] record is produced by two parsers: the TOML file
//! loader here (unknown keys are rejected) and the clap-derived override
//! structs the CLI flattens in. CLI values merge over file values field by
//! field.

use crate::{errors::ConfigError, record::SourceRef};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::io;

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "FAST_FSTESTS_CONFIG_PATH";

/// Default configuration file name, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// The settled configuration for one invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the fstests checkout on the host, used for test collection.
    pub fstests: Option<Utf8PathBuf>,

    /// Which tests to run.
    #[serde(default)]
    pub test_selection: TestSelection,

    /// How to run them.
    #[serde(default)]
    pub test_runner: TestRunnerOpts,

    /// Where results go and how they are summarized.
    #[serde(default)]
    pub output: OutputOpts,

    /// mkosi VM pool settings.
    #[serde(default)]
    pub mkosi: MkosiOpts,

    /// Externally managed VM settings.
    #[serde(default)]
    pub custom_vm: CustomVmOpts,
}

/// Test selection options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSelection {
    /// Tests (or test globs) to run, e.g. `btrfs/001` or `generic/0*`.
    #[serde(default)]
    pub tests: Vec<String>,

    /// Groups to include tests from.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Tests (or test globs) to exclude.
    #[serde(default)]
    pub exclude_tests: Vec<String>,

    /// Path to a file with a line-separated list of tests to exclude.
    pub exclude_tests_file: Option<Utf8PathBuf>,

    /// Groups to exclude tests from.
    #[serde(default)]
    pub exclude_groups: Vec<String>,

    /// Only include a specific fstests section.
    pub section: Option<String>,

    /// Exclude a specific fstests section.
    pub exclude_section: Option<String>,

    /// Restrict to tests for this file system (plus `generic/`).
    pub file_system: Option<String>,

    /// Shuffle the test list before scheduling.
    #[serde(default)]
    pub randomize: bool,

    /// Run each selected test this many times (>= 1).
    #[serde(default = "default_iterate")]
    pub iterate: u32,

    /// Order the queue largest-duration-first using durations from this run.
    pub slowest_first: Option<SourceRef>,

    /// Restrict the run to tests that failed or errored in this run.
    pub rerun_failures: Option<SourceRef>,
}

fn default_iterate() -> u32 {
    1
}

impl Default for TestSelection {
    fn default() -> Self {
        Self {
            tests: Vec::new(),
            groups: Vec::new(),
            exclude_tests: Vec::new(),
            exclude_tests_file: None,
            exclude_groups: Vec::new(),
            section: None,
            exclude_section: None,
            file_system: None,
            randomize: false,
            iterate: default_iterate(),
            slowest_first: None,
            rerun_failures: None,
        }
    }
}

/// Test runner policy options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestRunnerOpts {
    /// Leave supervisors running after the drain, for manual debugging.
    #[serde(default)]
    pub keep_alive: bool,

    /// Per-test time budget in seconds; exceeding it records `timed-out`.
    pub test_timeout: Option<u64>,

    /// Seconds between liveness probes of idle supervisors (0 disables).
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,

    /// How many supervisors one test may crash before it is isolated as a
    /// poison pill and recorded `errored`.
    #[serde(default = "default_max_supervisor_restarts")]
    pub max_supervisor_restarts: u32,

    /// How many times a failed or timed-out test is retried before its last
    /// attempt is recorded as authoritative.
    #[serde(default)]
    pub retry_failures: u32,

    /// Stream dmesg during test execution (backend-level).
    #[serde(default = "default_true")]
    pub dmesg: bool,
}

fn default_probe_interval() -> u64 {
    30
}

fn default_max_supervisor_restarts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for TestRunnerOpts {
    fn default() -> Self {
        Self {
            keep_alive: false,
            test_timeout: None,
            probe_interval: default_probe_interval(),
            max_supervisor_restarts: default_max_supervisor_restarts(),
            retry_failures: 0,
            dmesg: true,
        }
    }
}

/// Output and reporting options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputOpts {
    /// Results directory; enables persistence, recordings and comparisons.
    pub results_dir: Option<Utf8PathBuf>,

    /// Write debug logs to `RESULTS_DIR/log`.
    #[serde(default)]
    pub verbose: bool,

    /// Print failed tests as a pasteable list.
    #[serde(default)]
    pub print_failure_list: bool,

    /// Print the N slowest tests (0 disables).
    #[serde(default)]
    pub print_n_slowest: usize,

    /// Print a bucketed histogram of test durations.
    #[serde(default)]
    pub print_duration_hist: bool,

    /// After completion, create a recording with this label.
    pub record: Option<String>,
}

/// mkosi VM pool options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkosiOpts {
    /// Number of mkosi VMs to spawn.
    #[serde(default = "default_num_vms")]
    pub num: usize,

    /// mkosi config directory (e.g. `~/mkosi-kernel/`).
    pub config: Option<Utf8PathBuf>,

    /// Options passed through to mkosi.
    #[serde(default)]
    pub options: Vec<String>,

    /// Extra mkosi config passed through via `--include`.
    pub include: Option<Utf8PathBuf>,

    /// fstests directory on the VM.
    pub fstests: Option<Utf8PathBuf>,

    /// Max seconds to wait for a VM to come up.
    #[serde(default = "default_startup_timeout")]
    pub timeout: u64,
}

fn default_num_vms() -> usize {
    10
}

fn default_startup_timeout() -> u64 {
    30
}

impl Default for MkosiOpts {
    fn default() -> Self {
        Self {
            num: default_num_vms(),
            config: None,
            options: Vec::new(),
            include: None,
            fstests: None,
            timeout: default_startup_timeout(),
        }
    }
}

/// Externally managed VM options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomVmOpts {
    /// `HOST:FSTESTS_PATH` pairs, each an ssh destination plus the fstests
    /// path on that host.
    #[serde(default)]
    pub vms: Vec<String>,
}

impl Config {
    /// The configuration file location: `$FAST_FSTESTS_CONFIG_PATH` or
    /// `config.toml`.
    pub fn default_path() -> Utf8PathBuf {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Utf8PathBuf::from(path),
            _ => Utf8PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Loads the configuration from a TOML file. A missing file yields the
    /// default configuration; unknown keys are an error.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no config file at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };
        toml::from_str(&contents).map_err(|error| ConfigError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Serializes the settled configuration, for the per-run snapshot.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).expect("config serializes to TOML")
    }

    /// Merges CLI overrides over this configuration.
    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        let sel = &mut self.test_selection;
        merge_vec(&mut sel.tests, &cli.tests);
        merge_vec(&mut sel.groups, &cli.groups);
        merge_vec(&mut sel.exclude_tests, &cli.exclude_tests);
        merge_vec(&mut sel.exclude_groups, &cli.exclude_groups);
        merge_opt(&mut sel.exclude_tests_file, &cli.exclude_tests_file);
        merge_opt(&mut sel.section, &cli.section);
        merge_opt(&mut sel.exclude_section, &cli.exclude_section);
        merge_opt(&mut sel.file_system, &cli.file_system);
        sel.randomize |= cli.randomize;
        if let Some(iterate) = cli.iterate {
            sel.iterate = iterate;
        }
        merge_opt(&mut sel.slowest_first, &cli.slowest_first);
        merge_opt(&mut sel.rerun_failures, &cli.rerun_failures);

        let runner = &mut self.test_runner;
        runner.keep_alive |= cli.keep_alive;
        merge_opt(&mut runner.test_timeout, &cli.test_timeout);
        if let Some(interval) = cli.probe_interval {
            runner.probe_interval = interval;
        }
        if let Some(max) = cli.max_supervisor_restarts {
            runner.max_supervisor_restarts = max;
        }
        if let Some(retries) = cli.retry_failures {
            runner.retry_failures = retries;
        }
        if let Some(dmesg) = cli.dmesg {
            runner.dmesg = dmesg;
        }

        let output = &mut self.output;
        merge_opt(&mut output.results_dir, &cli.results_dir);
        output.verbose |= cli.verbose;
        output.print_failure_list |= cli.print_failure_list;
        if let Some(n) = cli.print_n_slowest {
            output.print_n_slowest = n;
        }
        output.print_duration_hist |= cli.print_duration_hist;
        merge_opt(&mut output.record, &cli.record);
        merge_opt(&mut self.fstests, &cli.fstests);

        let mkosi = &mut self.mkosi;
        if let Some(num) = cli.num {
            mkosi.num = num;
        }
        merge_opt(&mut mkosi.config, &cli.mkosi_config);
        merge_vec(&mut mkosi.options, &cli.mkosi_options);
        merge_opt(&mut mkosi.include, &cli.mkosi_include);
        merge_opt(&mut mkosi.fstests, &cli.mkosi_fstests);
        if let Some(timeout) = cli.startup_timeout {
            mkosi.timeout = timeout;
        }
        merge_vec(&mut self.custom_vm.vms, &cli.vms);
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_selection.iterate < 1 {
            return Err(ConfigError::invalid("iterate must be >= 1"));
        }
        if self.test_selection.randomize && self.test_selection.slowest_first.is_some() {
            return Err(ConfigError::invalid(
                "slowest_first and randomize are mutually exclusive",
            ));
        }
        if self.output.results_dir.is_none() {
            if self.test_selection.slowest_first.is_some() {
                return Err(ConfigError::invalid("slowest_first requires results_dir"));
            }
            if self.test_selection.rerun_failures.is_some() {
                return Err(ConfigError::invalid("rerun_failures requires results_dir"));
            }
            if self.output.record.is_some() {
                return Err(ConfigError::invalid("record requires results_dir"));
            }
            if self.output.verbose {
                return Err(ConfigError::invalid("verbose requires results_dir"));
            }
        }
        if self.custom_vm.vms.is_empty() {
            if self.mkosi.config.is_none() {
                return Err(ConfigError::invalid(
                    "mkosi config path not specified (set mkosi.config or custom_vm.vms)",
                ));
            }
            if self.mkosi.fstests.is_none() {
                return Err(ConfigError::invalid(
                    "path to fstests on the mkosi VM not specified (mkosi.fstests)",
                ));
            }
        }
        for vm in &self.custom_vm.vms {
            if !vm.contains(':') {
                return Err(ConfigError::invalid(format!(
                    "custom VM `{vm}` must be HOST:FSTESTS_PATH"
                )));
            }
        }
        Ok(())
    }
}

fn merge_opt<T: Clone>(into: &mut Option<T>, from: &Option<T>) {
    if let Some(value) = from {
        *into = Some(value.clone());
    }
}

fn merge_vec<T: Clone>(into: &mut Vec<T>, from: &[T]) {
    if !from.is_empty() {
        *into = from.to_vec();
    }
}

/// CLI overrides, producing the same record shape as the TOML file.
#[derive(Clone, Debug, Default, Args)]
pub struct CliOverrides {
    /// Tests to run
    #[arg(value_name = "TEST")]
    pub tests: Vec<String>,

    /// Comma-separated list of groups to include tests from
    #[arg(short, long, value_name = "GROUP", value_delimiter = ',')]
    pub groups: Vec<String>,

    /// Comma-separated list of tests to exclude
    #[arg(short, long, value_name = "TEST", value_delimiter = ',')]
    pub exclude_tests: Vec<String>,

    /// Path to a file containing a line-separated list of tests to exclude
    #[arg(short = 'E', long, value_name = "PATH")]
    pub exclude_tests_file: Option<Utf8PathBuf>,

    /// Comma-separated list of groups to exclude tests from
    #[arg(short = 'x', long, value_name = "GROUP", value_delimiter = ',')]
    pub exclude_groups: Vec<String>,

    /// Only include a specific section
    #[arg(short, long, value_name = "SECTION")]
    pub section: Option<String>,

    /// Exclude a specific section
    #[arg(short = 'S', long, value_name = "SECTION")]
    pub exclude_section: Option<String>,

    /// Specify the file system to be tested
    #[arg(long, value_name = "FILESYSTEM")]
    pub file_system: Option<String>,

    /// Randomize test order
    #[arg(short, long)]
    pub randomize: bool,

    /// Number of times to run each test
    #[arg(short, long, value_name = "N")]
    pub iterate: Option<u32>,

    /// Run the slowest tests first, using durations from a prior run
    #[arg(
        long,
        value_name = "SOURCE",
        num_args = 0..=1,
        default_missing_value = "latest",
        allow_hyphen_values = true,
    )]
    pub slowest_first: Option<SourceRef>,

    /// Only rerun tests that failed or errored in a prior run
    #[arg(
        long,
        value_name = "SOURCE",
        num_args = 0..=1,
        default_missing_value = "latest",
        allow_hyphen_values = true,
    )]
    pub rerun_failures: Option<SourceRef>,

    /// Keep hosts alive after the run, for debugging
    #[arg(long)]
    pub keep_alive: bool,

    /// Max seconds for an individual test
    #[arg(long, value_name = "SECONDS")]
    pub test_timeout: Option<u64>,

    /// Seconds between liveness probes of idle hosts (0 disables)
    #[arg(long, value_name = "SECONDS")]
    pub probe_interval: Option<u64>,

    /// Max times a test can kill a supervisor before being marked errored
    #[arg(long, value_name = "N")]
    pub max_supervisor_restarts: Option<u32>,

    /// Times to retry a failed or timed-out test
    #[arg(long, value_name = "N")]
    pub retry_failures: Option<u32>,

    /// Stream dmesg output during test execution
    #[arg(long, value_name = "BOOL")]
    pub dmesg: Option<bool>,

    /// Path to the results directory
    #[arg(long, value_name = "PATH")]
    pub results_dir: Option<Utf8PathBuf>,

    /// Print debugging logs to RESULTS_DIR/log
    #[arg(short, long)]
    pub verbose: bool,

    /// Print all failed tests in a pasteable way
    #[arg(long)]
    pub print_failure_list: bool,

    /// Print the N slowest tests
    #[arg(long, value_name = "N")]
    pub print_n_slowest: Option<usize>,

    /// Print a histogram of test durations
    #[arg(long)]
    pub print_duration_hist: bool,

    /// Record this run after completion (label defaults to a timestamp)
    #[arg(
        long,
        value_name = "LABEL",
        num_args = 0..=1,
        default_missing_value = "",
    )]
    pub record: Option<String>,

    /// Path to fstests on the host
    #[arg(long, value_name = "PATH")]
    pub fstests: Option<Utf8PathBuf>,

    /// Number of mkosi VMs to spawn
    #[arg(short, long, value_name = "N")]
    pub num: Option<usize>,

    /// mkosi config path (e.g. ~/mkosi-kernel/)
    #[arg(long, value_name = "PATH")]
    pub mkosi_config: Option<Utf8PathBuf>,

    /// Space-separated options to pass through to mkosi
    #[arg(long, value_name = "OPTION", value_delimiter = ' ')]
    pub mkosi_options: Vec<String>,

    /// Path to a mkosi config to pass through via --include
    #[arg(long, value_name = "PATH")]
    pub mkosi_include: Option<Utf8PathBuf>,

    /// fstests dir path on the mkosi VM
    #[arg(long, value_name = "PATH")]
    pub mkosi_fstests: Option<Utf8PathBuf>,

    /// Max seconds to wait for a VM to come up
    #[arg(long, value_name = "SECONDS")]
    pub startup_timeout: Option<u64>,

    /// Comma-separated HOST:FSTESTS_PATH pairs of externally managed VMs
    #[arg(long, value_name = "HOST:PATH", value_delimiter = ',')]
    pub vms: Vec<String>,
}
