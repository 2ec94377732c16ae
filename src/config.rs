use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server configuration from `AUTOBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    TlsPairIncomplete,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::TlsPairIncomplete => write!(
                f,
                "both AUTOBOOK_TLS_CERT and AUTOBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and empty values take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tls = match (get("AUTOBOOK_TLS_CERT"), get("AUTOBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPairIncomplete),
        };

        let max_connections: usize =
            parse_or(get("AUTOBOOK_MAX_CONNECTIONS"), "AUTOBOOK_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "AUTOBOOK_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        Ok(Self {
            port: parse_or(get("AUTOBOOK_PORT"), "AUTOBOOK_PORT", 5433)?,
            bind: get("AUTOBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("AUTOBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            user: get("AUTOBOOK_USER").unwrap_or_else(|| "autobook".into()),
            password: get("AUTOBOOK_PASSWORD").unwrap_or_else(|| "autobook".into()),
            max_connections,
            compact_threshold: parse_or(
                get("AUTOBOOK_COMPACT_THRESHOLD"),
                "AUTOBOOK_COMPACT_THRESHOLD",
                1000,
            )?,
            metrics_port: get("AUTOBOOK_METRICS_PORT")
                .map(|v| parse(&v, "AUTOBOOK_METRICS_PORT"))
                .transpose()?,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |v| parse(&v, key))
}
