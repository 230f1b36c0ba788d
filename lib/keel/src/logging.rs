pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds the process-wide root logger. Every long-lived component derives a
/// child logger from this one via `log.new(o!(...))`.
pub fn init(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to construct the terminal logger")
}

/// A logger that drops everything. Used by tests and detached components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
