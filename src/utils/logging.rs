use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid log level {0:?}; expected one of debug, info, warn, error")]
pub struct InvalidLevel(pub String);

/// Parse a `LOG_LEVEL` value.
pub fn parse_level(level: &str) -> Result<tracing::Level, InvalidLevel> {
    match level.trim().to_lowercase().as_str() {
        "error" => Ok(tracing::Level::ERROR),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "info" => Ok(tracing::Level::INFO),
        "debug" => Ok(tracing::Level::DEBUG),
        _ => Err(InvalidLevel(level.to_string())),
    }
}

/// Initialize tracing/logging for the process.
///
/// Uses `try_init` so tests and libraries can call this multiple times
/// without panicking; only the first call installs a subscriber.
pub fn init(level: &str) -> Result<(), InvalidLevel> {
    let lvl = parse_level(level)?;
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
    Ok(())
}
