// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of terminal output: colorization and logging setup.

use camino::Utf8Path;
use clap::ValueEnum;
use owo_colors::{style, OwoColorize, Style};
use std::{fmt, fs::File, sync::Arc};
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{format, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

/// High-level output options, settled once per invocation.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    /// Verbose output was requested.
    pub verbose: bool,

    /// How colorization is determined.
    pub color: Color,
}

impl OutputContext {
    /// Whether stdout (where the reporter writes) should be colorized.
    pub fn colorize_stdout(self) -> bool {
        self.color.should_colorize(supports_color::Stream::Stdout)
    }
}

/// Specifies whether to colorize output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub enum Color {
    /// Colorize if the terminal supports it and `NO_COLOR` is unset.
    #[default]
    Auto,

    /// Always try to colorize.
    Always,

    /// Never colorize.
    Never,
}

impl Color {
    /// Installs the tracing subscriber: a formatted stderr layer, plus a
    /// debug-level file layer under the results directory when requested.
    ///
    /// `FF_LOG` overrides the stderr filter.
    pub fn init(self, log_file: Option<&Utf8Path>, verbose: bool) {
        let mut log_styles = LogStyles::default();
        if self.should_colorize(supports_color::Stream::Stderr) {
            log_styles.colorize();
        }

        let level_str = std::env::var("FF_LOG").unwrap_or_default();
        let targets = if level_str.is_empty() {
            let default = if verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            };
            Targets::new().with_default(default)
        } else {
            level_str.parse().expect("unable to parse FF_LOG")
        };

        let stderr_layer = tracing_subscriber::fmt::layer()
            .event_format(SimpleFormatter { styles: log_styles })
            .with_writer(std::io::stderr)
            .with_filter(targets);

        let file_layer = log_file.and_then(|path| match File::create(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(Targets::new().with_default(LevelFilter::DEBUG)),
            ),
            Err(error) => {
                eprintln!("warning: could not open log file {path}: {error}");
                None
            }
        });

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
    }

    /// Whether the given stream should be colorized.
    pub fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

struct SimpleFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        match *metadata.level() {
            Level::ERROR => write!(writer, "{}: ", "error".style(self.styles.error))?,
            Level::WARN => write!(writer, "{}: ", "warning".style(self.styles.warning))?,
            Level::INFO => write!(writer, "{}: ", "info".style(self.styles.info))?,
            Level::DEBUG => write!(writer, "{}: ", "debug".style(self.styles.debug))?,
            Level::TRACE => write!(writer, "{}: ", "trace".style(self.styles.trace))?,
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            // Show non-message fields for debug and trace output.
            show_other: *metadata.level() >= Level::DEBUG,
            error: None,
        };
        event.record(&mut visitor);
        if let Some(error) = visitor.error {
            return Err(error);
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    show_other: bool,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            if let Err(error) = write!(self.writer, "{value:?}") {
                self.error = Some(error);
            }
        } else if self.show_other {
            if let Err(error) = write!(self.writer, "; {} = {:?}", field.name(), value) {
                self.error = Some(error);
            }
        }
    }
}

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    info: Style,
    debug: Style,
    trace: Style,
}

impl LogStyles {
    fn colorize(&mut self) {
        self.error = style().red().bold();
        self.warning = style().yellow().bold();
        self.info = style().bold();
        self.debug = style().bold();
        self.trace = style().dimmed();
    }
}
