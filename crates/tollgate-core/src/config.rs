use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tollgate_http::CodecLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// How long a handler waits for a reviewer verdict before treating the
    /// request as blocked.
    pub verdict_timeout: Duration,
    pub max_line_bytes: usize,
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
    pub leaf_cache_capacity: usize,
    /// Hold origin responses of reviewed requests for a reviewer verdict.
    pub review_responses: bool,
    pub upstream_connect_retries: u32,
    pub upstream_retry_delay: Duration,
    pub upstream_connect_timeout: Duration,
    /// Overall deadline for the whole connect sequence, retries and delays
    /// included; per-attempt timeouts are clamped to what remains of it.
    pub upstream_connect_budget: Duration,
    /// How long a stale blocklist snapshot may serve filter-mode decisions
    /// while the store is unreachable.
    pub policy_snapshot_max_age: Duration,
    pub upstream_tls_insecure_skip_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8080,
            ca_cert_path: PathBuf::from("./ca.crt"),
            ca_key_path: PathBuf::from("./ca.key"),
            verdict_timeout: Duration::from_secs(5 * 60),
            max_line_bytes: 64 * 1024,
            max_head_bytes: 256 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            leaf_cache_capacity: 1024,
            review_responses: false,
            upstream_connect_retries: 2,
            upstream_retry_delay: Duration::from_millis(150),
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_connect_budget: Duration::from_millis(500),
            policy_snapshot_max_age: Duration::from_secs(30),
            upstream_tls_insecure_skip_verify: false,
        }
    }
}

impl ProxyConfig {
    /// Read `TOLLGATE_*` overrides from the process environment on top of
    /// the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (name, value) in vars {
            match name.as_str() {
                "TOLLGATE_LISTEN_ADDR" => config.listen_addr = value,
                "TOLLGATE_LISTEN_PORT" => {
                    config.listen_port = parse_number(&name, &value)?;
                }
                "TOLLGATE_CA_CERT" => config.ca_cert_path = PathBuf::from(value),
                "TOLLGATE_CA_KEY" => config.ca_key_path = PathBuf::from(value),
                "TOLLGATE_VERDICT_TIMEOUT_SECS" => {
                    config.verdict_timeout = Duration::from_secs(parse_number(&name, &value)?);
                }
                "TOLLGATE_MAX_LINE_BYTES" => {
                    config.max_line_bytes = parse_number(&name, &value)?;
                }
                "TOLLGATE_MAX_HEAD_BYTES" => {
                    config.max_head_bytes = parse_number(&name, &value)?;
                }
                "TOLLGATE_MAX_BODY_BYTES" => {
                    config.max_body_bytes = parse_number(&name, &value)?;
                }
                "TOLLGATE_CERT_CACHE_CAPACITY" => {
                    config.leaf_cache_capacity = parse_number(&name, &value)?;
                }
                "TOLLGATE_REVIEW_RESPONSES" => {
                    config.review_responses = parse_bool(&name, &value)?;
                }
                "TOLLGATE_UPSTREAM_TLS_INSECURE_SKIP_VERIFY" => {
                    config.upstream_tls_insecure_skip_verify = parse_bool(&name, &value)?;
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "listen_addr must not be empty".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes < self.max_line_bytes {
            return Err(ConfigError::Invalid(
                "max_head_bytes must be at least max_line_bytes".to_string(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if self.upstream_connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "upstream_connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.upstream_connect_budget.is_zero() {
            return Err(ConfigError::Invalid(
                "upstream_connect_budget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_line_bytes: self.max_line_bytes,
            max_head_bytes: self.max_head_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value: {value}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ConfigError::Invalid(format!(
            "{name} must be a boolean, got: {other}"
        ))),
    }
}
