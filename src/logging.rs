use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Produces clean, user-facing output where the entire log line is colored
/// according to its severity, without timestamps or level tags. Meant for
/// the stdout layer; the file layer uses the default formatter instead.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
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
        // Buffered so color can wrap the whole line; format_fields writes directly otherwise.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Installs the dual-layer subscriber: a detailed, plain-text daily-rolling
/// file log at `log_dir`, and a colorized stdout layer at `console_level`
/// (silenced entirely when `quiet` is set).
pub fn init(log_dir: &std::path::Path, file_level: Level, console_level: Level, quiet: bool) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "mlperf-power.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(EnvFilter::new(file_level.to_string()));

    let registry = tracing_subscriber::registry().with(file_layer);

    if quiet {
        registry.init();
    } else {
        let console_layer = fmt::layer()
            .event_format(ColorizedFormatter)
            .with_writer(std::io::stdout)
            .with_filter(EnvFilter::new(console_level.to_string()));
        registry.with(console_layer).init();
    }

    guard
}
