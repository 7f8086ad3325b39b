//! Server configuration, read from `LEASEHOLD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::LeasePolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Cleartext password every client must present.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    /// Prometheus exporter port. `None` disables metrics.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub policy: LeasePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "leasehold".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            policy: LeasePolicy::default(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::TlsPair => write!(
                f,
                "both LEASEHOLD_TLS_CERT and LEASEHOLD_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let tls_cert = lookup("LEASEHOLD_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("LEASEHOLD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            port: parsed(&lookup, "LEASEHOLD_PORT")?.unwrap_or(defaults.port),
            bind: lookup("LEASEHOLD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("LEASEHOLD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("LEASEHOLD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "LEASEHOLD_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "LEASEHOLD_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "LEASEHOLD_METRICS_PORT")?,
            tls_cert,
            tls_key,
            policy: LeasePolicy {
                enforce_month_alignment: flag(&lookup, "LEASEHOLD_ENFORCE_MONTH_ALIGNMENT")?,
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("leasehold.wal")
    }
}

fn parsed<T: FromStr>(
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

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    match lookup(var) {
        None => Ok(false),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert!(!config.policy.enforce_month_alignment);
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("LEASEHOLD_PORT", "6000"),
            ("LEASEHOLD_BIND", "127.0.0.1"),
            ("LEASEHOLD_DATA_DIR", "/var/lib/leasehold"),
            ("LEASEHOLD_PASSWORD", "s3cret"),
            ("LEASEHOLD_MAX_CONNECTIONS", "8"),
            ("LEASEHOLD_COMPACT_THRESHOLD", "50"),
            ("LEASEHOLD_METRICS_PORT", "9100"),
            ("LEASEHOLD_TLS_CERT", "cert.pem"),
            ("LEASEHOLD_TLS_KEY", "key.pem"),
            ("LEASEHOLD_ENFORCE_MONTH_ALIGNMENT", "true"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/leasehold/leasehold.wal"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.tls_key, Some(PathBuf::from("key.pem")));
        assert!(config.policy.enforce_month_alignment);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            from_pairs(&[("LEASEHOLD_PORT", "http")]),
            Err(ConfigError::Invalid {
                var: "LEASEHOLD_PORT",
                value: "http".into()
            })
        );
        assert!(from_pairs(&[("LEASEHOLD_ENFORCE_MONTH_ALIGNMENT", "maybe")]).is_err());
        assert_eq!(
            from_pairs(&[("LEASEHOLD_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPair)
        );
    }
}
