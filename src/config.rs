use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("both PAWBOOK_TLS_CERT and PAWBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `PAWBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Activities older than this are soft-deleted. `None` keeps them forever.
    pub activity_retention_days: Option<u32>,
    pub reserve_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let reserve_timeout_ms: u64 = parse_or(&lookup, "PAWBOOK_RESERVE_TIMEOUT_MS", 5000)?;
        let tls_cert = lookup("PAWBOOK_TLS_CERT");
        let tls_key = lookup("PAWBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: lookup("PAWBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PAWBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("PAWBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("PAWBOOK_PASSWORD").unwrap_or_else(|| "pawbook".into()),
            max_connections: parse_or(&lookup, "PAWBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "PAWBOOK_COMPACT_THRESHOLD", 1000)?,
            activity_retention_days: parse_opt(&lookup, "PAWBOOK_ACTIVITY_RETENTION_DAYS")?,
            reserve_timeout: Duration::from_millis(reserve_timeout_ms),
            metrics_port: parse_opt(&lookup, "PAWBOOK_METRICS_PORT")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("pawbook.wal")
    }

    pub fn activity_retention_ms(&self) -> Option<Ms> {
        self.activity_retention_days.map(|d| Ms::from(d) * DAY_MS)
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}
