// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The CLI: argument parsing and subcommand execution.

use crate::{
    errors::{ExpectedError, FfExitCode},
    output::{Color, OutputContext},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgAction, Parser, Subcommand};
use fstests_runner::{
    compare::{compare_runs, load_outcomes},
    config::{CliOverrides, Config},
    errors::RecordingError,
    fstests::collect_tests,
    record::{create_recording, resolve_source, SourceRef},
    reporter::{event_channel, write_comparison, Reporter, ReporterOpts, Styles},
    runner::TestRunnerBuilder,
    schedule,
    store::{final_outcomes, read_run_results, ResultStore, RunId},
    supervisor::Supervisor,
    supervisors::{CustomSupervisor, MkosiSupervisor},
    test_case::{TestCase, TestId, TestStatus, WorkItem},
};
use std::{
    collections::{HashMap, HashSet},
    io::Write,
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

/// fast-fstests is an fstests wrapper that parallelizes test execution with
/// VMs.
#[derive(Debug, Parser)]
#[command(
    name = "ff",
    bin_name = "ff",
    version,
    args_conflicts_with_subcommands = true
)]
pub struct FastFstestsApp {
    /// Path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// When to colorize output
    #[arg(long, global = true, value_enum, default_value = "auto", value_name = "WHEN")]
    color: Color,

    #[command(flatten)]
    run_opts: CliOverrides,

    /// Build the VM image before spawning VMs (repeat to force)
    #[arg(short = 'f', long = "build", action = ArgAction::Count)]
    build: u8,

    /// List matched tests and exit without running any
    #[arg(short, long)]
    list: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the tests matched by the selection without running them
    List {
        #[command(flatten)]
        opts: CliOverrides,
    },

    /// Create a named recording of the latest run
    Record {
        /// Label for the recording (defaults to a timestamp)
        label: Option<String>,

        /// Replace an existing recording with the same label
        #[arg(long)]
        force: bool,

        /// Path to the results directory
        #[arg(long, value_name = "PATH")]
        results_dir: Option<Utf8PathBuf>,
    },

    /// Diff two runs and report regressions
    Compare {
        /// Baseline run: a label, -K, or `latest` [default: -2]
        #[arg(
            short = 'a',
            long = "baseline",
            value_name = "SOURCE",
            allow_hyphen_values = true
        )]
        baseline: Option<SourceRef>,

        /// Changed run [default: -1]
        #[arg(
            short = 'b',
            long = "changed",
            value_name = "SOURCE",
            allow_hyphen_values = true
        )]
        changed: Option<SourceRef>,

        /// Path to the results directory
        #[arg(long, value_name = "PATH")]
        results_dir: Option<Utf8PathBuf>,
    },
}

impl FastFstestsApp {
    /// Executes the app, returning the process exit code.
    pub fn exec(self) -> Result<i32, ExpectedError> {
        let config_path = self
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path);

        match self.command {
            None if self.list => exec_list(&config_path, &self.run_opts, self.color),
            None => exec_run(&config_path, &self.run_opts, self.color, self.build),
            Some(Command::List { opts }) => exec_list(&config_path, &opts, self.color),
            Some(Command::Record {
                label,
                force,
                results_dir,
            }) => exec_record(&config_path, self.color, label, force, results_dir),
            Some(Command::Compare {
                baseline,
                changed,
                results_dir,
            }) => exec_compare(&config_path, self.color, baseline, changed, results_dir),
        }
    }
}

fn exec_run(
    config_path: &Utf8Path,
    cli: &CliOverrides,
    color: Color,
    build: u8,
) -> Result<i32, ExpectedError> {
    let mut config = Config::from_file(config_path)?;
    config.apply_cli(cli);
    config.validate()?;

    let log_file = config.output.results_dir.as_ref().map(|dir| {
        // The log lives inside the results dir, so it must exist first.
        let _ = std::fs::create_dir_all(dir);
        dir.join("log")
    });
    color.init(log_file.as_deref(), config.output.verbose);
    let output_cx = OutputContext {
        verbose: config.output.verbose,
        color,
    };

    let tests = collect_tests(&config)?;
    if tests.is_empty() {
        return Err(ExpectedError::NoTestsToRun);
    }

    let mut items: Vec<WorkItem> = tests
        .into_iter()
        .map(|test| WorkItem::new(Arc::new(test) as Arc<dyn TestCase>))
        .collect();

    // Prior-run-derived policies resolve against the store before this run
    // claims `latest`.
    if let Some(source) = &config.test_selection.rerun_failures {
        let results_dir = expect_results_dir(&config);
        let run_dir = resolve_source(results_dir, source)?;
        let results = read_run_results(&run_dir)?;
        let failed: HashSet<TestId> = final_outcomes(&results)
            .into_iter()
            .filter(|(_, result)| {
                matches!(
                    result.status,
                    TestStatus::Failed | TestStatus::TimedOut | TestStatus::Errored
                )
            })
            .map(|(test_id, _)| test_id)
            .collect();
        items = schedule::filter_rerun_failures(items, &failed);
        if items.is_empty() {
            info!("nothing failed in {source}; no tests to rerun");
            return Ok(FfExitCode::OK);
        }
    }

    if let Some(source) = &config.test_selection.slowest_first {
        let results_dir = expect_results_dir(&config);
        match resolve_source(results_dir, source) {
            Ok(run_dir) => {
                let results = read_run_results(&run_dir)?;
                let durations: HashMap<TestId, f64> = final_outcomes(&results)
                    .into_iter()
                    .map(|(test_id, result)| (test_id, result.duration_seconds))
                    .collect();
                items = schedule::order_slowest_first(items, &durations);
            }
            Err(RecordingError::NoLatestRun { .. }) if *source == SourceRef::Latest => {
                warn!("no previous results found for slowest-first, using default order");
            }
            Err(error) => return Err(error.into()),
        }
    }

    if config.test_selection.randomize {
        schedule::randomize(&mut items);
    }

    let supervisors: Vec<Box<dyn Supervisor>> = if !config.custom_vm.vms.is_empty() {
        CustomSupervisor::pool(&config)?
            .into_iter()
            .map(|supervisor| Box::new(supervisor) as Box<dyn Supervisor>)
            .collect()
    } else {
        let pool = MkosiSupervisor::pool(&config)?;
        if build > 0 {
            if let Some(first) = pool.first() {
                first.build_image(build as u32)?;
            }
        }
        pool.into_iter()
            .map(|supervisor| Box::new(supervisor) as Box<dyn Supervisor>)
            .collect()
    };

    let recorder = match &config.output.results_dir {
        Some(dir) => {
            let store = ResultStore::new(dir)?;
            Some(store.begin_run(RunId::now(), &config.to_toml())?)
        }
        None => None,
    };

    let mut builder = TestRunnerBuilder::from_opts(&config.test_runner);
    builder.set_startup_timeout(Duration::from_secs(config.mkosi.timeout));
    let runner = builder.build(items, supervisors, recorder)?;

    let mut styles = Styles::default();
    if output_cx.colorize_stdout() {
        styles.colorize();
    }
    let reporter = Reporter::new(
        ReporterOpts {
            print_failure_list: config.output.print_failure_list,
            print_n_slowest: config.output.print_n_slowest,
            print_duration_hist: config.output.print_duration_hist,
            verbose: config.output.verbose,
        },
        styles,
    );

    let (mut forwarder, event_rx) = event_channel();
    let reporter_thread = std::thread::spawn(move || {
        let mut stdout = std::io::stdout().lock();
        let _ = reporter.run(event_rx, &mut stdout);
    });

    let result = runner.execute(move |event| forwarder.forward(event));
    // The forwarder went down with the callback; the reporter drains the
    // channel and exits.
    let _ = reporter_thread.join();
    let stats = result?;

    if let Some(label) = &config.output.record {
        let results_dir = expect_results_dir(&config);
        // An empty label (bare --record) falls back to a timestamp.
        let label = Some(label.clone()).filter(|label| !label.is_empty());
        match create_recording(results_dir, label, false) {
            Ok((label, _)) => info!("recorded run as {label}"),
            Err(error) => warn!("could not create recording: {error}"),
        }
    }

    if stats.cancelled {
        Ok(FfExitCode::SIGNAL_CANCELED)
    } else if stats.errored > 0 {
        Ok(FfExitCode::INFRA_FAILURES)
    } else if stats.failed > 0 || stats.timed_out > 0 {
        Ok(FfExitCode::TEST_FAILURES)
    } else {
        Ok(FfExitCode::OK)
    }
}

/// Only called on paths `Config::validate` has already guarded.
fn expect_results_dir(config: &Config) -> &Utf8Path {
    config
        .output
        .results_dir
        .as_deref()
        .unwrap_or_else(|| unreachable!("validated: results_dir is set"))
}

fn exec_list(
    config_path: &Utf8Path,
    cli: &CliOverrides,
    color: Color,
) -> Result<i32, ExpectedError> {
    let mut config = Config::from_file(config_path)?;
    config.apply_cli(cli);
    color.init(None, false);

    let tests = collect_tests(&config)?;
    let mut stdout = std::io::stdout().lock();
    for test in &tests {
        writeln!(stdout, "{}", test.id()).map_err(ExpectedError::Output)?;
    }
    Ok(FfExitCode::OK)
}

fn exec_record(
    config_path: &Utf8Path,
    color: Color,
    label: Option<String>,
    force: bool,
    results_dir: Option<Utf8PathBuf>,
) -> Result<i32, ExpectedError> {
    color.init(None, false);
    let results_dir = settle_results_dir(config_path, results_dir, "record")?;

    let (label, run_dir) = create_recording(&results_dir, label, force)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Recorded {} as {label}", run_dir.file_name().unwrap_or("run"))
        .map_err(ExpectedError::Output)?;
    Ok(FfExitCode::OK)
}

fn exec_compare(
    config_path: &Utf8Path,
    color: Color,
    baseline: Option<SourceRef>,
    changed: Option<SourceRef>,
    results_dir: Option<Utf8PathBuf>,
) -> Result<i32, ExpectedError> {
    color.init(None, false);
    let results_dir = settle_results_dir(config_path, results_dir, "compare")?;

    // By default the two most recent recordings are compared.
    let baseline = baseline.unwrap_or(SourceRef::Nth(2));
    let changed = changed.unwrap_or(SourceRef::Nth(1));

    let baseline_dir = resolve_source(&results_dir, &baseline)?;
    let changed_dir = resolve_source(&results_dir, &changed)?;
    let baseline_outcomes = load_outcomes(&baseline_dir)?;
    let changed_outcomes = load_outcomes(&changed_dir)?;

    let comparison = compare_runs(
        baseline_dir.file_name().unwrap_or("baseline"),
        changed_dir.file_name().unwrap_or("changed"),
        &baseline_outcomes,
        &changed_outcomes,
    );

    let mut styles = Styles::default();
    if color.should_colorize(supports_color::Stream::Stdout) {
        styles.colorize();
    }
    let mut stdout = std::io::stdout().lock();
    write_comparison(&comparison, &styles, &mut stdout).map_err(ExpectedError::Output)?;

    if comparison.has_regressions() {
        Ok(FfExitCode::TEST_FAILURES)
    } else {
        Ok(FfExitCode::OK)
    }
}

/// A subcommand's results dir: the flag if given, the config file otherwise.
fn settle_results_dir(
    config_path: &Utf8Path,
    results_dir: Option<Utf8PathBuf>,
    subcommand: &'static str,
) -> Result<Utf8PathBuf, ExpectedError> {
    if let Some(dir) = results_dir {
        return Ok(dir);
    }
    let config = Config::from_file(config_path)?;
    config
        .output
        .results_dir
        .ok_or(ExpectedError::ResultsDirRequired { subcommand })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        FastFstestsApp::command().debug_assert();
    }

    #[test]
    fn run_is_the_default_subcommand() {
        let app = FastFstestsApp::parse_from(["ff", "btrfs/001", "-g", "quick", "-n", "4"]);
        assert!(app.command.is_none());
        assert_eq!(app.run_opts.tests, ["btrfs/001"]);
        assert_eq!(app.run_opts.groups, ["quick"]);
        assert_eq!(app.run_opts.num, Some(4));
    }

    #[test]
    fn compare_accepts_negative_sources() {
        let app = FastFstestsApp::parse_from(["ff", "compare", "-a", "-2", "-b", "baseline"]);
        let Some(Command::Compare {
            baseline, changed, ..
        }) = app.command
        else {
            panic!("expected compare subcommand");
        };
        assert_eq!(baseline, Some(SourceRef::Nth(2)));
        assert_eq!(changed, Some(SourceRef::Label("baseline".to_owned())));
    }

    #[test]
    fn record_takes_an_optional_label() {
        let app = FastFstestsApp::parse_from(["ff", "record", "my-baseline", "--force"]);
        let Some(Command::Record { label, force, .. }) = app.command else {
            panic!("expected record subcommand");
        };
        assert_eq!(label.as_deref(), Some("my-baseline"));
        assert!(force);
    }
}
