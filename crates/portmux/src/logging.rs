use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (`info`, `portmux_protocol=trace`, ...).
pub const LOG_FILTER_ENV: &str = "PORTMUX_LOG";

/// Environment variable holding the log format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "PORTMUX_LOG_FORMAT";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> tracing::level_filters::LevelFilter {
        match self {
            LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
            LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogConfigError {
    #[error("invalid PORTMUX_LOG filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("invalid PORTMUX_LOG_FORMAT: {0}")]
    Format(String),
}

/// Install a stderr subscriber. A subscriber that is already installed wins.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    init_with_filter(format, EnvFilter::default().add_directive(level.as_filter().into()));
}

fn init_with_filter(format: LogFormat, filter: EnvFilter) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

/// Filter and format read from [`LOG_FILTER_ENV`] and [`LOG_FORMAT_ENV`].
///
/// Unset variables fall back to `info` and text output.
pub fn config_from_env() -> Result<(LogFormat, EnvFilter), LogConfigError> {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::default().add_directive(LogLevel::default().as_filter().into()),
    };
    let format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(value) => parse_format(&value)?,
        Err(_) => LogFormat::default(),
    };
    Ok((format, filter))
}

/// Install a stderr subscriber configured from the environment.
///
/// Nothing is installed if either variable does not parse.
pub fn init_from_env() -> Result<(), LogConfigError> {
    let (format, filter) = config_from_env()?;
    init_with_filter(format, filter);
    Ok(())
}

fn parse_format(value: &str) -> Result<LogFormat, LogConfigError> {
    <LogFormat as ValueEnum>::from_str(value.trim(), true).map_err(LogConfigError::Format)
}
