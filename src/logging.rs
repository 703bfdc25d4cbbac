//! Logging sink selection and subsystem prefixes.
//!
//! Two sinks: plain stdout lines, or sd-daemon priority framing for journald
//! (`<N>` prefix per line, see sd-daemon(3)). The sink and verbosity are
//! picked once by `main` and injected; no component reaches for ambient
//! logger state afterwards.

use std::fmt;

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Message prefixes identifying the originating subsystem.
pub mod prefix {
    pub const CONFIG: &str = "[CONFIG]";
    pub const COVER: &str = "[COVER]";
    pub const MODBUS: &str = "[MODBUS]";
    pub const MQTT: &str = "[MQTT]";
}

/// Where log lines go.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum LogSink {
    #[default]
    Stdout,
    Systemd,
}

impl std::str::FromStr for LogSink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogSink::Stdout),
            "systemd" => Ok(LogSink::Systemd),
            other => Err(format!("unknown log sink '{other}' (expected 'stdout' or 'systemd')")),
        }
    }
}

/// Map `-v` occurrences to a tracing level. No flag means warnings only.
pub fn verbosity_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Config file log levels (`logging.level`), mapped onto tracing levels.
pub fn config_level(level: &str) -> Option<Level> {
    match level {
        "error" => Some(Level::ERROR),
        "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        _ => None,
    }
}

/// Event formatter emitting sd-daemon priority prefixes.
///
/// journald reads the `<N>` prefix and drops it from the rendered message,
/// so the line itself stays bare like the stdout format.
pub struct SystemdFormat;

impl<S, N> FormatEvent<S, N> for SystemdFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let priority = match *event.metadata().level() {
            Level::ERROR => "<3>",
            Level::WARN => "<4>",
            Level::INFO => "<6>",
            Level::DEBUG | Level::TRACE => "<7>",
        };
        write!(writer, "{priority}")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber for the chosen sink and level.
pub fn init(sink: LogSink, level: Level) {
    match sink {
        LogSink::Stdout => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_target(false)
                .without_time()
                .init();
        }
        LogSink::Systemd => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .event_format(SystemdFormat)
                .init();
        }
    }
}
