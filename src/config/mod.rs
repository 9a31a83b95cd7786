//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or malformed vars.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;

use crate::dispatch::{DEFAULT_RETRY_STATUS_CODES, DispatchConfig};
use crate::engine::cron::{CronJob, CronJobConfig, validate_cron_jobs};
use crate::engine::supervisor::DEFAULT_POLL_INTERVAL;
use crate::error::{Error, Result};
use crate::shard::Sharding;

/// Which [`crate::store::WorkItemStore`] implementation to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(Error::Config(format!(
                "STORE_BACKEND must be postgres or memory, got {other}"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// Required for the postgres backend.
    pub database_url: Option<SecretString>,
    pub base_url: Option<Url>,
    pub max_shards: i16,
    pub poll_interval: Duration,
    pub single_db_connection: bool,
    pub retry_status_codes: BTreeSet<u16>,
    pub cron_config: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let store_backend = var("STORE_BACKEND")
            .map(|v| v.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or_default();

        let database_url = var("DATABASE_URL").map(SecretString::from);
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(Error::Config(
                "required environment variable DATABASE_URL is not set".to_string(),
            ));
        }

        let base_url = var("BASE_URL")
            .map(|v| {
                Url::parse(&v).map_err(|e| Error::Config(format!("BASE_URL {v} is invalid: {e}")))
            })
            .transpose()?;

        let max_shards = match var("MAX_SHARDS") {
            Some(v) => parse_var("MAX_SHARDS", &v)?,
            None => 1,
        };
        Sharding::new(max_shards)?;

        let poll_interval = match var("POLL_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_var("POLL_INTERVAL_SECS", &v)?),
            None => DEFAULT_POLL_INTERVAL,
        };

        let single_db_connection = match var("SINGLE_DB_CONNECTION") {
            Some(v) => parse_bool("SINGLE_DB_CONNECTION", &v)?,
            None => false,
        };

        let retry_status_codes = match var("RETRY_STATUS_CODES") {
            Some(v) => parse_status_codes(&v)?,
            None => DEFAULT_RETRY_STATUS_CODES.iter().copied().collect(),
        };

        Ok(Self {
            store_backend,
            database_url,
            base_url,
            max_shards,
            poll_interval,
            single_db_connection,
            retry_status_codes,
            cron_config: var("CRON_CONFIG").map(PathBuf::from),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn sharding(&self) -> Result<Sharding> {
        Sharding::new(self.max_shards)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            base_url: self.base_url.clone(),
            retry_status_codes: self.retry_status_codes.clone(),
            timeout: None,
        }
    }

    /// Validated cron jobs from `CRON_CONFIG`, empty when unset.
    pub fn cron_jobs(&self) -> Result<Vec<CronJob>> {
        match &self.cron_config {
            Some(path) => load_cron_jobs(path),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CronFile {
    #[serde(default)]
    cron: Vec<CronJobConfig>,
}

/// Parse a TOML document of `[[cron]]` entries.
pub fn parse_cron_jobs(toml_text: &str) -> Result<Vec<CronJob>> {
    let file: CronFile = toml::from_str(toml_text)
        .map_err(|e| Error::Config(format!("invalid cron config: {e}")))?;
    validate_cron_jobs(file.cron)
}

pub fn load_cron_jobs(path: &Path) -> Result<Vec<CronJob>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read cron config {}: {e}", path.display()))
    })?;
    parse_cron_jobs(&text)
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value} is invalid: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name}={value} is not a boolean"))),
    }
}

fn parse_status_codes(value: &str) -> Result<BTreeSet<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let code: u16 = parse_var("RETRY_STATUS_CODES", s)?;
            if !(100..=599).contains(&code) {
                return Err(Error::Config(format!(
                    "RETRY_STATUS_CODES entry {code} is not an http status"
                )));
            }
            Ok(code)
        })
        .collect()
}
