use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Final, merged relay configuration used by the running process.
///
/// Flags win over environment variables (clap handles that layer); the
/// remaining holes are filled with the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind host for the HTTP listener.
    pub host: String,
    pub port: u16,
    /// Relay's own credentials toward the upstream.
    pub upstream_access_key: String,
    pub upstream_secret_key: String,
    pub upstream_region: String,
    pub upstream_host: String,
    /// Per-attempt timeout for upstream calls.
    #[serde(with = "duration_secs")]
    pub upstream_timeout: Duration,
    /// Database DSN (sqlite or postgres).
    pub dsn: String,
    /// Base64 of the 32-byte AES key protecting stored secrets.
    pub encryption_key: String,
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// Minimum wall time between successive SubmitTask dispatch starts.
    #[serde(with = "duration_secs")]
    pub submit_min_interval: Duration,
    #[serde(with = "duration_secs")]
    pub idempotency_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub idempotency_sweep_interval: Duration,
}

/// Optional layer used when merging flag/env values into a config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstream_access_key: Option<String>,
    pub upstream_secret_key: Option<String>,
    pub upstream_region: Option<String>,
    pub upstream_host: Option<String>,
    pub upstream_timeout: Option<Duration>,
    pub dsn: Option<String>,
    pub encryption_key: Option<String>,
    pub max_concurrent: Option<usize>,
    pub max_queue: Option<usize>,
    pub submit_min_interval: Option<Duration>,
    pub idempotency_ttl: Option<Duration>,
    pub idempotency_sweep_interval: Option<Duration>,
}

impl RelayConfigPatch {
    pub fn overlay(&mut self, other: RelayConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(upstream_access_key);
        take!(upstream_secret_key);
        take!(upstream_region);
        take!(upstream_host);
        take!(upstream_timeout);
        take!(dsn);
        take!(encryption_key);
        take!(max_concurrent);
        take!(max_queue);
        take!(submit_min_interval);
        take!(idempotency_ttl);
        take!(idempotency_sweep_interval);
    }

    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        Ok(RelayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            upstream_access_key: self
                .upstream_access_key
                .ok_or(ConfigError::MissingField("upstream_access_key"))?,
            upstream_secret_key: self
                .upstream_secret_key
                .ok_or(ConfigError::MissingField("upstream_secret_key"))?,
            upstream_region: self
                .upstream_region
                .unwrap_or_else(|| "cn-north-1".to_string()),
            upstream_host: self
                .upstream_host
                .unwrap_or_else(|| "visual.volcengineapi.com".to_string()),
            upstream_timeout: self.upstream_timeout.unwrap_or(Duration::from_secs(30)),
            dsn: self.dsn.ok_or(ConfigError::MissingField("dsn"))?,
            encryption_key: self
                .encryption_key
                .ok_or(ConfigError::MissingField("encryption_key"))?,
            max_concurrent: self.max_concurrent.unwrap_or(1),
            max_queue: self.max_queue.unwrap_or(100),
            submit_min_interval: self.submit_min_interval.unwrap_or(Duration::ZERO),
            idempotency_ttl: self
                .idempotency_ttl
                .unwrap_or(Duration::from_secs(24 * 60 * 60)),
            idempotency_sweep_interval: self
                .idempotency_sweep_interval
                .unwrap_or(Duration::from_secs(5 * 60)),
        })
    }
}

impl From<RelayConfig> for RelayConfigPatch {
    fn from(value: RelayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            upstream_access_key: Some(value.upstream_access_key),
            upstream_secret_key: Some(value.upstream_secret_key),
            upstream_region: Some(value.upstream_region),
            upstream_host: Some(value.upstream_host),
            upstream_timeout: Some(value.upstream_timeout),
            dsn: Some(value.dsn),
            encryption_key: Some(value.encryption_key),
            max_concurrent: Some(value.max_concurrent),
            max_queue: Some(value.max_queue),
            submit_min_interval: Some(value.submit_min_interval),
            idempotency_ttl: Some(value.idempotency_ttl),
            idempotency_sweep_interval: Some(value.idempotency_sweep_interval),
        }
    }
}

/// Parse a human duration: bare integers are seconds, `ms`/`s`/`m`/`h`
/// suffixes select the unit.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidValue {
        field: "duration",
        value: raw.to_string(),
    };

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(invalid()),
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
