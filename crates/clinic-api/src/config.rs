use std::env;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_audience: String,
    /// Largest accepted push batch and changes page
    pub max_batch: usize,
    /// Attempts at assigning a free queue token before giving up
    pub token_retry_limit: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_audience", &self.jwt_audience)
            .field("max_batch", &self.max_batch)
            .field("token_retry_limit", &self.token_retry_limit)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CLINIC_API_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(
            &lookup,
            "CLINIC_API_DB_PATH",
            "clinic-api.db",
        ));

        let jwt_secret = required_trimmed(&lookup, "CLINIC_API_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "CLINIC_API_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        let jwt_audience = value_or_default(&lookup, "CLINIC_API_JWT_AUDIENCE", "clinic-sync");

        let max_batch = value_or_default(&lookup, "CLINIC_API_MAX_BATCH", "100")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("CLINIC_API_MAX_BATCH must be an integer in [1, 500]".to_string())
            })?;
        if !(1..=500).contains(&max_batch) {
            return Err(ConfigError::Invalid(
                "CLINIC_API_MAX_BATCH must be in [1, 500]".to_string(),
            ));
        }

        let token_retry_limit = value_or_default(&lookup, "CLINIC_API_TOKEN_RETRY_LIMIT", "5")
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CLINIC_API_TOKEN_RETRY_LIMIT must be an integer in [1, 50]".to_string(),
                )
            })?;
        if !(1..=50).contains(&token_retry_limit) {
            return Err(ConfigError::Invalid(
                "CLINIC_API_TOKEN_RETRY_LIMIT must be in [1, 50]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            db_path,
            jwt_secret,
            jwt_audience,
            max_batch,
            token_retry_limit,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    clinic_core::config::setting(lookup(name))
}
