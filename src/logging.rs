//! Logging setup for the broker binary.
//!
//! Two layers: a detailed layer writing to a daily-rolling file (or
//! stderr on request), and an optional clean stdout layer whose lines are
//! colorized by severity for operators watching the broker interactively.

use anyhow::Result;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// A tracing event formatter that colors the whole line by level
///
/// Used only on the stdout layer, where operators want clean output
/// without timestamps or level prefixes.
struct LevelColorFormatter;

impl<S, N> FormatEvent<S, N> for LevelColorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so color applies to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_line = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };
        writeln!(writer, "{}", colored_line)
    }
}

/// Initialize the global tracing subscriber
///
/// Verbosity maps from repeated `-v` flags: INFO by default, DEBUG at
/// `-v`, TRACE beyond. The returned guard must stay alive for the life of
/// the process or file logging silently stops.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&str>) -> Result<Option<WorkerGuard>> {
    let log_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_layer;
    if let Some("stderr") = log_file {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match log_file {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_name = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("nsb_broker.log"));
                tracing_appender::rolling::daily(log_dir, log_name)
            }
            None => tracing_appender::rolling::daily(".", "nsb_broker.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_layer = if !quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(LevelColorFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}
