//! Logging front end. Components take a `Logger` and derive children with
//! `log.new(o!(...))`; the daemon builds the root drain here.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

/// Maps the daemon's 1-5 verbosity scale onto slog severities.
pub fn severity(level: u8) -> Severity {
    match level {
        0 | 1 => Severity::Error,
        2 => Severity::Warning,
        3 => Severity::Info,
        4 => Severity::Debug,
        _ => Severity::Trace,
    }
}

/// Builds a terminal root logger writing to stderr.
pub fn init(level: u8) -> Result<Logger, sloggers::Error> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity(level));
    builder.destination(Destination::Stderr);
    builder.build()
}

/// Builds a root logger appending to the given file.
pub fn init_file(level: u8, path: &Path) -> Result<Logger, sloggers::Error> {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(severity(level));
    builder.build()
}

/// Root logger that swallows everything. For tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_scale() {
        assert_eq!(severity(1), Severity::Error);
        assert_eq!(severity(2), Severity::Warning);
        assert_eq!(severity(3), Severity::Info);
        assert_eq!(severity(4), Severity::Debug);
        assert_eq!(severity(5), Severity::Trace);
    }

    #[test]
    fn test_out_of_range_levels_are_clamped() {
        assert_eq!(severity(0), Severity::Error);
        assert_eq!(severity(200), Severity::Trace);
    }
}
