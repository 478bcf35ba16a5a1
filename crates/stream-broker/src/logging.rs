use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Logging arguments shared by the broker binary.
#[derive(Debug, Clone, clap::Args)]
pub struct LogArgs {
    /// Level at which to emit logs. Directives of `RUST_LOG`, if set, take precedence.
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info", value_enum)]
    pub level: LogLevel,
    /// Format in which logs are written to stderr.
    #[arg(long = "log.format", env = "LOG_FORMAT", default_value = "json", value_enum)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable text.
    Text,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Install a global tracing subscriber which writes to stderr.
/// Panics if a global subscriber is already installed.
pub fn init_logging(args: &LogArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(args.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());

    match args.format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
        LogFormat::Text => builder.with_target(false).init(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Debug, clap::Parser)]
    struct Args {
        #[command(flatten)]
        log: LogArgs,
    }

    #[test]
    fn test_log_args_parse() {
        let args = Args::try_parse_from(["broker", "--log.level=debug", "--log.format", "text"])
            .unwrap();
        assert_eq!(args.log.level, LogLevel::Debug);
        assert_eq!(args.log.format, LogFormat::Text);
        assert_eq!(LevelFilter::from(args.log.level), LevelFilter::DEBUG);

        assert!(Args::try_parse_from(["broker", "--log.level=loud"]).is_err());
    }
}
