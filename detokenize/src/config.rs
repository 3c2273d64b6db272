use batchflow::flow::validate_vault_url;
use batchflow::retry::ExponentialBackoff;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid vault URL: {0}")]
    InvalidVaultUrl(String),

    #[error("vault.max_batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("vault.api_timeout_secs must be at least 1")]
    ZeroTimeout,

    #[error("Bearer token is empty")]
    EmptyBearer,

    #[error("retry.{0}")]
    InvalidRetry(&'static str),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "Listener::admin")]
    pub admin_listener: Listener,
    pub vault: VaultConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Enables GCP Cloud Trace ids on request logs.
    pub gcp_project_id: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.vault.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn admin() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8081,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct VaultConfig {
    /// Base URL of the vault API. Must be https unless it is localhost.
    pub url: Url,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Deadline for a single vault API request. BigQuery allows 20 minutes
    /// for the whole remote function call.
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    pub bearer: BearerSource,
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_api_timeout_secs() -> u64 {
    300
}

impl VaultConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_vault_url(&self.url).map_err(|e| ValidationError::InvalidVaultUrl(e.to_string()))?;
        if self.max_batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }
        if self.api_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if matches!(&self.bearer, BearerSource::Static { token } if token.is_empty()) {
            return Err(ValidationError::EmptyBearer);
        }
        Ok(())
    }
}

/// Where the vault bearer token comes from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum BearerSource {
    Static { token: String },
    /// A file kept up to date by a credentials agent. Re-read whenever the
    /// cached token has expired.
    File { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_tries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        RetryConfig {
            max_tries: backoff.max_tries,
            initial_interval_ms: backoff.initial_interval.as_millis() as u64,
            max_interval_ms: backoff.max_interval.as_millis() as u64,
            multiplier: backoff.multiplier,
            randomization_factor: backoff.randomization_factor,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_tries == 0 {
            return Err(ValidationError::InvalidRetry("max_tries must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(ValidationError::InvalidRetry("multiplier must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(ValidationError::InvalidRetry(
                "randomization_factor must be between 0 and 1",
            ));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(ValidationError::InvalidRetry(
                "max_interval_ms must not be below initial_interval_ms",
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_tries: self.max_tries,
        }
    }
}
