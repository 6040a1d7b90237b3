//! Logging setup.
//!
//! A small `sloggers` config, built once by the embedding host and threaded
//! down as child loggers (`log.new(o!(...))`) rather than reached for
//! through a global. The core never calls `slog_scope` or installs a
//! process-wide logger itself — it has no main loop (spec.md 1).

use slog::o;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Build a reasonable default logger for hosts that don't want to wire up
/// their own `slog::Logger`: a terminal drain, stderr, debug level, built
/// through the builder API since the core has no config file of its own to
/// parse settings from.
pub fn default_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    match builder.build() {
        Ok(logger) => logger.new(o!("crate" => "qmi-core")),
        Err(_) => slog::Logger::root(slog::Discard, o!()),
    }
}

/// A child logger tagged with the component name, the pattern every
/// subsystem (`Device`, `Endpoint`, `TransactionManager`, `NetPortManager`)
/// uses to scope its own log lines.
pub fn component(parent: &slog::Logger, name: &'static str) -> slog::Logger {
    parent.new(o!("component" => name))
}
