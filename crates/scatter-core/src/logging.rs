//! Logger setup shared by the hub and probe binaries.

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Initializes the global tracing subscriber from a level and format.
///
/// Supported levels: trace, debug, info, warn, error.
/// Supported formats: json, text.
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    if !matches!(level, "trace" | "debug" | "info" | "warn" | "error") {
        return Err(Error::Config(format!("invalid log level: {level}")));
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        "text" => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        other => return Err(Error::Config(format!("invalid log format: {other}"))),
    };

    result.map_err(|e| Error::Config(format!("failed to install logger: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level_and_format() {
        assert!(init_logging("loud", "json").is_err());
        assert!(init_logging("info", "xml").is_err());
    }
}
