use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tenant::TenantSettings;

const DEFAULT_PORT: u16 = 5433;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_PASSWORD: &str = "courtbook";
const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
const DEFAULT_COMPLETION_SWEEP_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once from `COURTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub completion_sweep: Duration,
    pub tls: Option<TlsFiles>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    PartialTls,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::PartialTls => write!(
                f,
                "both COURTBOOK_TLS_CERT and COURTBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (get("COURTBOOK_TLS_CERT"), get("COURTBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            port: parsed(&get, "COURTBOOK_PORT").unwrap_or(DEFAULT_PORT),
            bind: get("COURTBOOK_BIND").unwrap_or_else(|| DEFAULT_BIND.into()),
            data_dir: get("COURTBOOK_DATA_DIR")
                .unwrap_or_else(|| DEFAULT_DATA_DIR.into())
                .into(),
            password: get("COURTBOOK_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            max_connections: parsed::<usize>(&get, "COURTBOOK_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            compact_threshold: parsed(&get, "COURTBOOK_COMPACT_THRESHOLD")
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            completion_sweep: Duration::from_secs(
                parsed::<u64>(&get, "COURTBOOK_COMPLETION_SWEEP_SECS")
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_COMPLETION_SWEEP_SECS),
            ),
            tls,
            metrics_port: parsed(&get, "COURTBOOK_METRICS_PORT"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            completion_sweep: self.completion_sweep,
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
