//! Server configuration.
//!
//! Loaded from a TOML document in which every field is optional. Parsing is
//! followed by semantic validation that reports every problem at once, so a
//! bad deployment fails with the whole list instead of one error per attempt.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:4000"
//! environment = "production"
//! request_timeout_secs = 30
//!
//! [limiter]
//! rps = 2.0
//! burst = 4
//! key = "peer"
//!
//! [cors]
//! trusted_origins = ["https://app.example.com"]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::rate_limit::{KeyStrategy, MIN_RPS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub limiter: LimiterConfig,
    pub cors: CorsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Reported by the health check.
    pub environment: String,
    /// Larger request bodies are refused with `413`.
    pub max_body_bytes: usize,
    /// Unset means no deadline.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".into(),
            environment: "development".into(),
            max_body_bytes: 1024 * 1024,
            request_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    pub enabled: bool,
    /// Sustained requests per second per client.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: u32,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub key: KeyStrategy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rps: 2.0,
            burst: 4,
            idle_ttl_secs: 180,
            sweep_interval_secs: 60,
            key: KeyStrategy::Peer,
        }
    }
}

impl LimiterConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub trusted_origins: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { trusted_origins: Vec::new(), max_age_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Prefix of every Prometheus metric name.
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { namespace: "marquee".into() }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", ValidationErrors(.0))]
    Invalid(Vec<ValidationError>),
}

/// One semantic problem with an otherwise well-formed configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("server.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("server.max_body_bytes must be greater than zero")]
    MaxBodyBytes,

    #[error("server.request_timeout_secs must be greater than zero")]
    RequestTimeout,

    #[error("limiter.rps must be a number of at least 0.001, got {0}")]
    Rate(f64),

    #[error("limiter.burst must be at least 1")]
    Burst,

    #[error("limiter.idle_ttl_secs must be greater than zero")]
    IdleTtl,

    #[error("limiter.sweep_interval_secs must be greater than zero")]
    SweepInterval,

    #[error("cors.trusted_origins entry `{0}` must be scheme://host[:port] with no path or trailing slash")]
    Origin(String),

    #[error("metrics.namespace `{0}` must match [a-zA-Z_][a-zA-Z0-9_]*")]
    Namespace(String),
}

struct ValidationErrors<'a>(&'a [ValidationError]);

impl fmt::Display for ValidationErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl Config {
    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::BindAddress(self.server.bind_address.clone()));
        }
        if self.server.max_body_bytes == 0 {
            errors.push(ValidationError::MaxBodyBytes);
        }
        if self.server.request_timeout_secs == Some(0) {
            errors.push(ValidationError::RequestTimeout);
        }

        let limiter = &self.limiter;
        if !(limiter.rps.is_finite() && limiter.rps >= MIN_RPS) {
            errors.push(ValidationError::Rate(limiter.rps));
        }
        if limiter.burst == 0 {
            errors.push(ValidationError::Burst);
        }
        if limiter.idle_ttl_secs == 0 {
            errors.push(ValidationError::IdleTtl);
        }
        if limiter.sweep_interval_secs == 0 {
            errors.push(ValidationError::SweepInterval);
        }

        for origin in &self.cors.trusted_origins {
            if !is_origin(origin) {
                errors.push(ValidationError::Origin(origin.clone()));
            }
        }

        if !is_metric_namespace(&self.metrics.namespace) {
            errors.push(ValidationError::Namespace(self.metrics.namespace.clone()));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// `scheme://host[:port]`, exactly as a browser sends it in `Origin`.
fn is_origin(origin: &str) -> bool {
    let Some((scheme, rest)) = origin.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https")
        && !rest.is_empty()
        && !rest.contains(['/', '?', '#', ' '])
}

fn is_metric_namespace(ns: &str) -> bool {
    let mut chars = ns.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.limiter.rps, 2.0);
        assert_eq!(config.limiter.burst, 4);
        assert_eq!(config.limiter.idle_ttl(), Duration::from_secs(180));
        assert_eq!(config.limiter.key, KeyStrategy::Peer);
        assert_eq!(config.cors.max_age_secs, 60);
        assert_eq!(config.server.request_timeout(), None);
    }

    #[test]
    fn full_document_parses() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind_address = "127.0.0.1:8080"
            environment = "staging"
            max_body_bytes = 4096
            request_timeout_secs = 10

            [limiter]
            enabled = false
            rps = 0.5
            burst = 1
            key = "credential"

            [cors]
            trusted_origins = ["https://app.example.com", "http://localhost:3000"]

            [metrics]
            namespace = "greenlight"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.environment, "staging");
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(10)));
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.key, KeyStrategy::Credential);
        assert_eq!(config.cors.trusted_origins.len(), 2);
        assert_eq!(config.limiter.sweep_interval_secs, 60);
    }

    #[test]
    fn every_validation_error_is_reported() {
        let err = Config::from_toml_str(
            r#"
            [server]
            bind_address = "localhost"
            max_body_bytes = 0
            [limiter]
            rps = -1.0
            burst = 0
            [cors]
            trusted_origins = ["https://ok.example.com", "https://slash.example.com/", "null", "ftp://x"]
            [metrics]
            namespace = "9lives"
            "#,
        )
        .unwrap_err();

        let errors = match err {
            ConfigError::Invalid(errors) => errors,
            other => panic!("expected validation errors, got {other}"),
        };
        assert_eq!(
            errors,
            vec![
                ValidationError::BindAddress("localhost".into()),
                ValidationError::MaxBodyBytes,
                ValidationError::Rate(-1.0),
                ValidationError::Burst,
                ValidationError::Origin("https://slash.example.com/".into()),
                ValidationError::Origin("null".into()),
                ValidationError::Origin("ftp://x".into()),
                ValidationError::Namespace("9lives".into()),
            ]
        );
    }

    #[test]
    fn rates_below_the_floor_are_rejected() {
        for rps in ["1e-20", "0.0", "0.0009"] {
            let err = Config::from_toml_str(&format!("[limiter]\nrps = {rps}")).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(ref e) if matches!(e[..], [ValidationError::Rate(_)])), "{rps}");
        }
        assert!(Config::from_toml_str("[limiter]\nrps = 0.001").is_ok());
    }

    #[test]
    fn unknown_keys_and_bad_types_are_parse_errors() {
        assert!(matches!(Config::from_toml_str("[server]\nport = 80"), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::from_toml_str("[limiter]\nkey = \"cookie\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
