//! Log subscriber setup
//!
//! The library only emits `tracing` events. Applications and test harnesses
//! that want them on stderr call [`init_logging`] once at startup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
    EnvFilter,
};

use crate::error::{LinkError, Result};

/// `[INFO]`, `[WARN]`, ...
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event format `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809412Z [INFO] [meter] connected to /dev/ttyUSB0`
pub struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Build the filter: `RUST_LOG` wins over `default_filter`
pub fn build_filter(default_filter: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| LinkError::config(format!("Invalid log filter {}: {}", default_filter, e))),
    }
}

/// Install the global stderr subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_logging(default_filter: &str) -> Result<bool> {
    let filter = build_filter(default_filter)?;
    let installed = tracing_subscriber::fmt()
        .event_format(BracketedLevelFormat)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bracketed_format() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .with_max_level(Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("[meter] nothing read, marking connection as down");
            tracing::trace!("filtered out");
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[WARN] [meter] nothing read, marking connection as down"));
        let timestamp = lines[0].split(' ').next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(matches!(build_filter("devlink=loud"), Err(LinkError::Config(_))));
        assert!(build_filter("devlink=debug,warn").is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        // another test may have installed one first; the second call never does
        let _first = init_logging("warn").unwrap();
        let second = init_logging("warn").unwrap();
        assert!(!second);
    }
}
