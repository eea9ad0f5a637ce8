use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Console formatter for a daemon's user-facing stdout output.
///
/// An operator bringing up a pool typically tails several daemons side by
/// side, so every line is prefixed with the endpoint this daemon dials.
/// The line body is colored by severity: reconnect warnings in yellow,
/// transport failures in bold red, routine lifecycle messages plain, and
/// diagnostics dimmed, without timestamp or level clutter next to the
/// structured stderr/file logs.
pub struct DaemonConsoleFormatter {
    endpoint: String,
}

impl DaemonConsoleFormatter {
    /// `endpoint` is the dial URL the daemon was started against.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for DaemonConsoleFormatter
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
        // Buffer the fields first so the color applies to the whole body.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let body = match *event.metadata().level() {
            Level::ERROR => buffer.red().bold(),
            Level::WARN => buffer.yellow(),
            Level::INFO => buffer.normal(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.dimmed(),
        };

        writeln!(writer, "{} {}", self.endpoint.dimmed(), body)
    }
}
