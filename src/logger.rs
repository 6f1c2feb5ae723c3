//! Logging setup for programs built on apex-diffopt.
//!
//! The library itself only emits `tracing` events: per-iteration tables at DEBUG, run
//! summaries at INFO, failing batch elements at WARN and errors at ERROR. These helpers
//! install a subscriber printing them as
//!
//! ```text
//! [INFO 2025-01-01 12:00:00 apex_diffopt::optimizer::driver] ...      INFO/WARN/ERROR
//! [DEBUG 2025-01-01 12:00:00 driver.rs:212] ...                        DEBUG/TRACE
//! ```
//!
//! `RUST_LOG` overrides the default level, e.g. `RUST_LOG=apex_diffopt=debug`.

use std::error::Error;
use tracing::Level;

/// Install the subscriber with INFO as default level.
///
/// ```no_run
/// apex_diffopt::init_logger().ok();
/// tracing::info!("ready");
/// ```
pub fn init_logger() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_logger_with_level(Level::INFO)
}

/// Install the subscriber with a custom default level. Fails if a global subscriber is
/// already set.
pub fn init_logger_with_level(default_level: Level) -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter { ansi: true })
        .try_init()
}

/// `[LEVEL timestamp location] message`, location being the module for INFO and above and
/// `file:line` below.
struct BracketFormatter {
    ansi: bool,
}

impl BracketFormatter {
    fn level_label(&self, level: Level) -> String {
        let color = match level {
            Level::ERROR => 31,
            Level::WARN => 33,
            Level::INFO => 32,
            Level::DEBUG => 34,
            Level::TRACE => 35,
        };
        if self.ansi {
            format!("\x1b[{color}m{level}\x1b[0m")
        } else {
            level.to_string()
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        write!(
            writer,
            "[{} {} ",
            self.level_label(level),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        // more verbose levels compare greater
        match (level >= Level::DEBUG, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}")?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{line}")?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
