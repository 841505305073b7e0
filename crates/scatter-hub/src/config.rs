//! Hub configuration: YAML file, `CONFIG_FILE` override, validation.

use std::env;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use scatter_core::error::{Error, Result};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,

    pub proxies: ProxiesSection,

    #[serde(default)]
    pub telemetry: Option<TelemetrySection>,

    /// Probe groups; every `host:port` inside a group becomes one pool entry.
    pub probes: Vec<ProbeGroup>,
}

/// `proxies:` section of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxiesSection {
    #[serde(default)]
    pub http: Option<HttpProxySection>,
}

/// `proxies.http:` section.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpProxySection {
    /// Port for the HTTP proxy listener.
    pub port: u16,
}

/// `telemetry:` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    /// Port for the telemetry subscription server.
    pub port: u16,
    /// Environment variable holding the subscriber secret.
    #[serde(default)]
    pub secret_env: Option<String>,
}

/// One group of probes sharing a secret and TLS requirement.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeGroup {
    /// Environment variable holding the group's shared secret.
    #[serde(default)]
    pub secret_env: Option<String>,
    /// Whether connections to these probes use TLS.
    pub require_tls: bool,
    /// The address of each probe in this group.
    pub hosts: Vec<String>,
}

impl ProbeGroup {
    /// Resolves the group's secret from the environment, if configured.
    pub fn secret(&self) -> Result<Option<String>> {
        resolve_secret_env(self.secret_env.as_deref())
    }
}

impl TelemetrySection {
    pub fn secret(&self) -> Result<Option<String>> {
        resolve_secret_env(self.secret_env.as_deref())
    }
}

fn resolve_secret_env(name: Option<&str>) -> Result<Option<String>> {
    match name {
        None => Ok(None),
        Some(name) => match env::var(name) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ => Err(Error::Config(format!(
                "environment variable {name} not set or empty"
            ))),
        },
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Loads and validates the configuration.
    ///
    /// The `CONFIG_FILE` environment variable, when set, overrides
    /// `default_path`.
    pub fn load(default_path: &str) -> Result<Self> {
        let path = env::var("CONFIG_FILE").unwrap_or_else(|_| default_path.to_string());
        Self::load_file(Path::new(&path))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("error reading config file {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(Error::Config(format!(
                "invalid log level: {}",
                self.log_level
            )));
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            return Err(Error::Config(format!(
                "invalid log format: {}",
                self.log_format
            )));
        }
        if self.probes.is_empty() {
            return Err(Error::Config("at least one probe group is required".into()));
        }
        for group in &self.probes {
            if group.hosts.is_empty() {
                return Err(Error::Config(
                    "every probe group needs at least one host".into(),
                ));
            }
            // Fails fast when a named env var is missing.
            group.secret()?;
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.secret()?;
        }
        Ok(())
    }

    /// All probe endpoints in pool order, paired with their group secret
    /// and TLS flag.
    pub fn probe_endpoints(&self) -> Result<Vec<ProbeEndpoint>> {
        let mut endpoints = Vec::new();
        for group in &self.probes {
            let secret = group.secret()?;
            for host in &group.hosts {
                endpoints.push(ProbeEndpoint {
                    host: host.clone(),
                    secret: secret.clone(),
                    require_tls: group.require_tls,
                });
            }
        }
        Ok(endpoints)
    }
}

/// One resolved probe endpoint.
#[derive(Debug, Clone)]
pub struct ProbeEndpoint {
    pub host: String,
    pub secret: Option<String>,
    pub require_tls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn full_config_parses() {
        std::env::set_var("SCATTER_TEST_GROUP_SECRET", "s3cret");
        let config = parse(
            r#"
log_level: info
log_format: text
proxies:
  http:
    port: 8080
telemetry:
  port: 9090
probes:
  - secret_env: SCATTER_TEST_GROUP_SECRET
    require_tls: false
    hosts:
      - probe-a:8000
      - probe-b:8000
  - require_tls: true
    hosts:
      - probe-c:8443
"#,
        )
        .unwrap();

        let endpoints = config.probe_endpoints().unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].host, "probe-a:8000");
        assert_eq!(endpoints[0].secret.as_deref(), Some("s3cret"));
        assert!(!endpoints[0].require_tls);
        assert!(endpoints[2].require_tls);
        assert_eq!(config.proxies.http.as_ref().unwrap().port, 8080);
        assert_eq!(config.telemetry.as_ref().unwrap().port, 9090);
    }

    #[test]
    fn empty_probe_list_is_rejected() {
        let err = parse(
            r#"
proxies:
  http:
    port: 8080
probes: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_secret_env_is_rejected() {
        std::env::remove_var("SCATTER_TEST_MISSING_SECRET");
        let err = parse(
            r#"
proxies:
  http:
    port: 8080
probes:
  - secret_env: SCATTER_TEST_MISSING_SECRET
    require_tls: false
    hosts: [probe:8000]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = parse(
            r#"
log_level: shouting
proxies:
  http:
    port: 8080
probes:
  - require_tls: false
    hosts: [probe:8000]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
