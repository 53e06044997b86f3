use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" => Some(Self::Verbose),
            _ => None,
        }
    }

    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Verbose => Level::TRACE,
        }
    }

    fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "trace",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid logging.level '{0}'. Allowed values: error, warn, info, debug, verbose")]
    InvalidLevel(String),
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter for the configured level. `RUST_LOG`, when set, wins.
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Installs the global subscriber: ANSI text when `human_friendly`, JSON
/// lines otherwise.
pub fn init(config: &LoggingConfig) -> Result<LogLevel, LoggingError> {
    let level = LogLevel::from_config_value(&config.level)
        .ok_or_else(|| LoggingError::InvalidLevel(config.level.clone()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true);

    let installed = if config.human_friendly {
        builder.with_ansi(true).try_init()
    } else {
        builder.json().with_ansi(false).try_init()
    };
    installed.map_err(|error| LoggingError::Install(error.to_string()))?;

    Ok(level)
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use crate::config::LoggingConfig;

    use super::{init, LogLevel, LoggingError};

    #[test]
    fn parses_configured_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_config_value(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value("trace"), None);
    }

    #[test]
    fn verbose_maps_to_trace() {
        assert_eq!(LogLevel::Verbose.as_tracing_level(), Level::TRACE);
        assert!(LogLevel::Debug < LogLevel::Verbose);
    }

    #[test]
    fn init_rejects_unknown_level_before_installing() {
        let err = init(&LoggingConfig {
            level: "loud".to_owned(),
            human_friendly: false,
        })
        .expect_err("unknown level should fail");

        assert!(matches!(err, LoggingError::InvalidLevel(level) if level == "loud"));
    }
}
