//! Logging setup.
//!
//! stdout carries the demo narration, so log lines always go to stderr.
//! Level precedence: `-v` flags, then `RUST_LOG`, then the configured level.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Level implied by repeated `-v` flags: warn, info, debug, then trace.
pub fn verbosity_level(count: u8) -> Option<LevelFilter> {
    match count {
        0 => None,
        1 => Some(LevelFilter::WARN),
        2 => Some(LevelFilter::INFO),
        3 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

/// Validate a level name taken from config or the environment.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    let trimmed = level.trim();
    // `LevelFilter` reads "" as ERROR; an empty setting is a mistake here.
    if trimmed.is_empty() {
        return Err(AppError::Config("log level must not be empty".into()));
    }
    trimmed.parse::<LevelFilter>().map_err(|_| {
        AppError::Config(format!(
            "invalid log level '{level}' (expected off, error, warn, info, debug or trace)"
        ))
    })
}

/// Install the global subscriber.
///
/// With `from_flags` the given level is used as is. Otherwise a parseable
/// `RUST_LOG` wins and `level` is only the fallback.
pub fn init(level: LevelFilter, from_flags: bool) -> Result<(), AppError> {
    let from_env = if from_flags { None } else { EnvFilter::try_from_default_env().ok() };
    let filter = from_env.unwrap_or_else(|| EnvFilter::default().add_directive(level.into()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_counts_map_to_levels() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some(LevelFilter::WARN));
        assert_eq!(verbosity_level(3), Some(LevelFilter::DEBUG));
        assert_eq!(verbosity_level(9), Some(LevelFilter::TRACE));
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level(" Debug ").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
        assert!(matches!(parse_level(""), Err(AppError::Config(_))));
        assert!(matches!(parse_level("verbose"), Err(AppError::Config(m)) if m.contains("verbose")));
    }

    #[test]
    fn second_init_reports_logger_error() {
        // Whichever call comes first in this process installs the subscriber.
        let _ = init(LevelFilter::INFO, true);
        assert!(matches!(init(LevelFilter::INFO, false), Err(AppError::Logger(_))));
    }
}
