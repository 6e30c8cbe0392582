//! Logging setup.
//!
//! Events carry one of three targets — `CORE`, `SIMULATION`, `BACKEND` — so
//! stderr output is prefixed per component. The `--log` level keeps the
//! launcher's historical names; `verbose` slots between `debug` and `info`,
//! which maps onto tracing's TRACE/DEBUG pair.

use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    Critical,
    Quiet,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::TRACE,
            LogLevel::Verbose => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
            LogLevel::Quiet => LevelFilter::OFF,
        }
    }
}

/// Install the global subscriber: compact format on stderr, filtered to the
/// requested level.
pub fn install(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level.filter())
        .with_target(true)
        .init();
}
