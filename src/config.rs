//! Process-level pipeline configuration shared by the binaries.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::trip_archives::TripArchiveConfig;
use crate::City;

pub const STORE_FILE_NAME: &str = "feature_store.sqlite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub data_root: PathBuf,
    pub store_root: PathBuf,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let archives = TripArchiveConfig::default();
        Self {
            data_root: archives.data_root,
            store_root: PathBuf::from("data/store"),
            http_timeout_ms: archives.http_timeout_ms,
            max_retries: archives.max_retries,
            retry_backoff_ms: archives.retry_backoff_ms,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl PipelineConfig {
    /// Defaults overridden by `BIKECAST_*` environment variables.
    ///
    /// Empty values are ignored; numbers that do not parse are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(root) = non_empty_var("BIKECAST_DATA_ROOT") {
            cfg.data_root = PathBuf::from(root);
        }
        if let Some(root) = non_empty_var("BIKECAST_STORE_ROOT") {
            cfg.store_root = PathBuf::from(root);
        }
        if let Some(raw) = non_empty_var("BIKECAST_HTTP_TIMEOUT_MS") {
            cfg.http_timeout_ms = parse_number("BIKECAST_HTTP_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = non_empty_var("BIKECAST_MAX_RETRIES") {
            cfg.max_retries = parse_number("BIKECAST_MAX_RETRIES", &raw)?;
        }

        Ok(cfg)
    }

    /// `{store_root}/{city}/feature_store.sqlite`
    pub fn store_path(&self, city: City) -> PathBuf {
        self.store_root.join(city.as_str()).join(STORE_FILE_NAME)
    }

    pub fn archive_config(&self) -> TripArchiveConfig {
        TripArchiveConfig {
            data_root: self.data_root.clone(),
            http_timeout_ms: self.http_timeout_ms,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}
