//! Pipeline configuration.
//!
//! `PipelineConfig` is the TOML file as written. `resolve` turns it into an
//! immutable [`RunSettings`], pulling secrets from the environment, and fails
//! with a [`ConfigError`] before any key is processed.

use chrono::{DateTime, Utc};
use cryptoetl_core::data::cryptocompare::{CryptoCompareConfig, DEFAULT_BASE_URL};
use cryptoetl_core::domain::{Asset, ExtractionWindow, IntervalKind, InvalidWindow, SeriesKey};
use cryptoetl_core::load::store::postgres::DEFAULT_TABLE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "cryptoetl.toml";
pub const DRY_RUN_ENV: &str = "DRY_RUN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("environment variable {var} is not set ({purpose})")]
    MissingSecret { var: String, purpose: &'static str },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "all_assets")]
    pub assets: Vec<Asset>,
    #[serde(default = "all_intervals")]
    pub intervals: Vec<IntervalKind>,
    pub window: WindowConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

fn all_assets() -> Vec<Asset> {
    Asset::ALL.to_vec()
}

fn all_intervals() -> Vec<IntervalKind> {
    IntervalKind::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub start: DateTime<Utc>,
    /// Defaults to the time of the run.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub quote_currency: String,
    pub page_limit: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: "CRYPTOCOMPARE_API_KEY".to_string(),
            quote_currency: "USD".to_string(),
            page_limit: 2000,
            max_retries: 3,
            base_delay_ms: 500,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub url_env: String,
    pub pool_max_size: u32,
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            url_env: "CRYPTOETL_DB_URL".to_string(),
            pool_max_size: 4,
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub audit_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("staging"),
            backup_dir: PathBuf::from("backups"),
            audit_log: None,
        }
    }
}

/// Which secrets a command needs. `load` never talks to the API; `extract`
/// never talks to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub api: bool,
    pub store: bool,
}

impl Requirements {
    pub const NONE: Requirements = Requirements {
        api: false,
        store: false,
    };
    pub const ALL: Requirements = Requirements {
        api: true,
        store: true,
    };
    pub const EXTRACT: Requirements = Requirements {
        api: true,
        store: false,
    };
    pub const LOAD: Requirements = Requirements {
        api: false,
        store: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Postgres {
        url: String,
        pool_max_size: u32,
        table: String,
    },
    Memory,
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub keys: Vec<SeriesKey>,
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    pub provider: CryptoCompareConfig,
    pub store: StoreSettings,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub audit_log: Option<PathBuf>,
    pub dry_run: bool,
}

impl RunSettings {
    /// The extraction window for `interval`, ending at the configured end or
    /// `now`, with both bounds floored to the interval's granularity.
    pub fn window_for(
        &self,
        interval: IntervalKind,
        now: DateTime<Utc>,
    ) -> Result<ExtractionWindow, InvalidWindow> {
        let end = self.window_end.unwrap_or(now);
        Ok(ExtractionWindow::new(self.window_start, end)?.truncated(interval))
    }

    /// Restrict the run to `keys`. Keys outside the configured set are allowed.
    pub fn with_keys(mut self, keys: Vec<SeriesKey>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = self.dry_run || dry_run;
        self
    }
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Resolve against the process environment.
    pub fn resolve(&self, needs: Requirements) -> Result<RunSettings, ConfigError> {
        self.resolve_with(needs, |var| std::env::var(var).ok())
    }

    /// Resolve against an arbitrary environment lookup.
    pub fn resolve_with(
        &self,
        needs: Requirements,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<RunSettings, ConfigError> {
        if self.assets.is_empty() {
            return Err(ConfigError::Invalid("assets must not be empty".into()));
        }
        if self.intervals.is_empty() {
            return Err(ConfigError::Invalid("intervals must not be empty".into()));
        }
        if let Some(end) = self.window.end {
            if end < self.window.start {
                return Err(ConfigError::Invalid(format!(
                    "window end {end} precedes start {}",
                    self.window.start
                )));
            }
        }
        if self.api.page_limit == 0 {
            return Err(ConfigError::Invalid("api.page_limit must be positive".into()));
        }

        let env_value = |var: &str| env(var).filter(|v| !v.trim().is_empty());

        let api_key = env_value(&self.api.api_key_env);
        if needs.api && api_key.is_none() {
            return Err(ConfigError::MissingSecret {
                var: self.api.api_key_env.clone(),
                purpose: "market data API key",
            });
        }

        let store = match self.store.kind {
            StoreKind::Memory => StoreSettings::Memory,
            StoreKind::Postgres => {
                let url = match env_value(&self.store.url_env) {
                    Some(url) => url,
                    None if needs.store => {
                        return Err(ConfigError::MissingSecret {
                            var: self.store.url_env.clone(),
                            purpose: "target database URL",
                        })
                    }
                    None => String::new(),
                };
                StoreSettings::Postgres {
                    url,
                    pool_max_size: self.store.pool_max_size,
                    table: self.store.table.clone(),
                }
            }
        };

        if self.paths.staging_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.staging_dir must be set".into()));
        }
        if needs.store && self.paths.backup_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.backup_dir must be set".into()));
        }

        let dry_run = match env(DRY_RUN_ENV) {
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("{DRY_RUN_ENV}={raw:?} is not a boolean"))
            })?,
            None => false,
        };

        Ok(RunSettings {
            keys: SeriesKey::cross(&self.assets, &self.intervals),
            window_start: self.window.start,
            window_end: self.window.end,
            provider: CryptoCompareConfig {
                base_url: self.api.base_url.trim_end_matches('/').to_string(),
                api_key,
                quote_currency: self.api.quote_currency.clone(),
                page_limit: self.api.page_limit,
                max_retries: self.api.max_retries,
                base_delay: Duration::from_millis(self.api.base_delay_ms),
                timeout: Duration::from_secs(self.api.timeout_secs),
            },
            store,
            staging_dir: self.paths.staging_dir.clone(),
            backup_dir: self.paths.backup_dir.clone(),
            audit_log: self.paths.audit_log.clone(),
            dry_run,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
assets = ["BTC", "ETH", "SOL"]
intervals = ["daily", "hourly"]

[window]
start = "2020-03-24T00:00:00Z"

[api]
base_url = "https://min-api.cryptocompare.com/"
api_key_env = "CC_KEY"
quote_currency = "USD"
page_limit = 2000
max_retries = 3

[store]
kind = "postgres"
url_env = "DB_URL"
pool_max_size = 4

[paths]
staging_dir = "staging"
backup_dir = "backups"
audit_log = "audit.jsonl"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn parse_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.assets, Asset::ALL.to_vec());
        assert_eq!(config.intervals, vec![IntervalKind::Daily, IntervalKind::Hourly]);
        assert_eq!(config.store.kind, StoreKind::Postgres);
        assert_eq!(config.paths.audit_log, Some(PathBuf::from("audit.jsonl")));
        assert_eq!(config.window.end, None);
    }

    #[test]
    fn resolve_reads_secrets_from_env() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config
            .resolve_with(
                Requirements::ALL,
                env(&[("CC_KEY", "secret"), ("DB_URL", "postgres://localhost/etl")]),
            )
            .unwrap();
        assert_eq!(settings.keys.len(), 6);
        assert_eq!(settings.provider.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.provider.base_url, "https://min-api.cryptocompare.com");
        assert!(matches!(settings.store, StoreSettings::Postgres { ref url, .. } if url == "postgres://localhost/etl"));
        assert!(!settings.dry_run);
    }

    #[test]
    fn missing_secret_is_a_config_error() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let err = config
            .resolve_with(Requirements::ALL, env(&[("DB_URL", "postgres://x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { ref var, .. } if var == "CC_KEY"));

        let err = config
            .resolve_with(Requirements::LOAD, env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { ref var, .. } if var == "DB_URL"));

        // Extract-only runs need no database.
        assert!(config
            .resolve_with(Requirements::EXTRACT, env(&[("CC_KEY", "k")]))
            .is_ok());
    }

    #[test]
    fn dry_run_env_forces_preview() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config
            .resolve_with(
                Requirements::LOAD,
                env(&[("DB_URL", "postgres://x"), ("DRY_RUN", "true")]),
            )
            .unwrap();
        assert!(settings.dry_run);

        let err = config
            .resolve_with(
                Requirements::LOAD,
                env(&[("DB_URL", "postgres://x"), ("DRY_RUN", "maybe")]),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_fields_and_bad_windows_are_rejected() {
        let typo = SAMPLE.replace("page_limit", "page_limt");
        assert!(matches!(
            PipelineConfig::from_toml_str(&typo),
            Err(ConfigError::Parse { .. })
        ));

        let minimal = r#"
[window]
start = "2020-04-22T00:00:00Z"
end = "2020-04-20T00:00:00Z"

[store]
kind = "memory"
"#;
        let config = PipelineConfig::from_toml_str(minimal).unwrap();
        assert!(matches!(
            config.resolve_with(Requirements::LOAD, env(&[])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn window_is_truncated_per_interval() {
        let minimal = r#"
[window]
start = "2020-04-20T05:30:00Z"

[store]
kind = "memory"
"#;
        let settings = PipelineConfig::from_toml_str(minimal)
            .unwrap()
            .resolve_with(Requirements::LOAD, env(&[]))
            .unwrap();
        assert_eq!(settings.store, StoreSettings::Memory);

        let now = Utc.with_ymd_and_hms(2020, 4, 22, 17, 45, 0).unwrap();
        let daily = settings.window_for(IntervalKind::Daily, now).unwrap();
        assert_eq!(daily.start(), Utc.with_ymd_and_hms(2020, 4, 20, 0, 0, 0).unwrap());
        assert_eq!(daily.end(), Utc.with_ymd_and_hms(2020, 4, 22, 0, 0, 0).unwrap());
        let hourly = settings.window_for(IntervalKind::Hourly, now).unwrap();
        assert_eq!(hourly.start(), Utc.with_ymd_and_hms(2020, 4, 20, 5, 0, 0).unwrap());
        assert_eq!(hourly.end(), Utc.with_ymd_and_hms(2020, 4, 22, 17, 0, 0).unwrap());
    }

    #[test]
    fn shipped_config_parses() {
        let config = PipelineConfig::from_toml_str(include_str!("../../cryptoetl.toml")).unwrap();
        assert_eq!(config.store.kind, StoreKind::Postgres);
        let settings = config.resolve_with(Requirements::NONE, env(&[])).unwrap();
        assert_eq!(settings.keys.len(), 6);
        assert!(!settings.dry_run);
    }
}
