//! Probe configuration from environment variables.
//!
//! Probes are designed for containerized deployments, so everything is
//! environment-driven: `LOG_LEVEL`, `LOG_FORMAT`, `PORT`, and the required
//! `SECRET` shared with hubs.

use std::env;

use scatter_core::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Logging verbosity level.
    pub log_level: String,
    /// Log output format (json or text).
    pub log_format: String,
    /// Port for the forward-stream listener.
    pub port: u16,
    /// Authentication secret required from hubs.
    pub secret: String,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

        let port = match env::var("PORT") {
            Ok(value) => value
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid PORT: {value}")))?,
            Err(_) => 8000,
        };

        let secret = env::var("SECRET")
            .map_err(|_| Error::Config("SECRET environment variable is required".into()))?;
        if secret.is_empty() {
            return Err(Error::Config("SECRET must not be empty".into()));
        }

        Ok(Self {
            log_level,
            log_format,
            port,
            secret,
        })
    }
}
