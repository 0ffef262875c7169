//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[error("failed to parse log level '{0}', available options are 'error', 'warn', 'info', 'debug' or 'trace'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// returns the level requested through the command line, the explicit
/// `--log-level` flag taking precedence over `-v` occurrences
pub fn resolve(verbosity: u8, log_level: Option<&str>) -> Result<Level, Error> {
    let Some(log_level) = log_level else {
        return Ok(level(verbosity));
    };

    Ok(match log_level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => {
            return Err(Error::Parse(log_level.to_string()));
        }
    })
}

pub fn initialize(level: Level) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_should_saturate_at_trace() {
        assert_eq!(Level::ERROR, level(0));
        assert_eq!(Level::INFO, level(2));
        assert_eq!(Level::TRACE, level(4));
        assert_eq!(Level::TRACE, level(250));
    }

    #[test]
    fn resolve_should_prefer_the_explicit_flag() {
        assert_eq!(Level::DEBUG, resolve(0, Some("debug")).unwrap());
        assert_eq!(Level::WARN, resolve(1, None).unwrap());
        assert!(resolve(0, Some("verbose")).is_err());
    }
}
