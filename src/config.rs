//! Environment-style configuration.
//!
//! Values are read through a lookup function so the same parser serves the
//! process environment ([`PipelineConfig::from_env`]) and tests
//! ([`PipelineConfig::from_lookup`]). Any problem is a [`ConfigError`],
//! reported once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_FEED_URL: &str = "https://jeap.rio.rj.gov.br/je-api/api/v2/gps";

/// Upper bound for every `*_SECONDS` key.
pub const MAX_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// S3 or an S3-compatible endpoint.
    S3 { bucket: String },
    /// A local directory standing in for a bucket.
    Local { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub folder: String,
    pub endpoint_url: Option<String>,
    pub credentials_profile: Option<String>,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub enabled: bool,
    pub command: String,
    pub project_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub warehouse_project_id: Option<String>,
    pub generate_docs: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub feed_url: String,
    pub window_size: usize,
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub fetch_retry_delay: Duration,
    pub data_dir: PathBuf,
    pub storage: StorageConfig,
    pub downstream: DownstreamConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let window_size: usize = env.parse("AGGREGATION_MINUTES", 10)?;
        if window_size == 0 {
            return Err(ConfigError::Invalid {
                key: "AGGREGATION_MINUTES",
                value: "0".into(),
                reason: "window size must be at least 1".into(),
            });
        }
        let interval = env.nonzero_secs("RUN_INTERVAL_SECONDS", 60)?;

        let backend = match env.get("STORAGE_BACKEND").as_deref().unwrap_or("s3") {
            "s3" => StorageBackend::S3 {
                bucket: env.get("STORAGE_BUCKET").ok_or(ConfigError::Missing("STORAGE_BUCKET"))?,
            },
            "local" => StorageBackend::Local {
                root: env.path("STORAGE_LOCAL_ROOT", "./object-store"),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected `s3` or `local`".into(),
                });
            }
        };

        let storage = StorageConfig {
            backend,
            folder: env.get("STORAGE_FOLDER").unwrap_or_else(|| "brt-data".to_string()),
            endpoint_url: env.get("STORAGE_ENDPOINT_URL"),
            credentials_profile: env.get("STORAGE_CREDENTIALS_PROFILE"),
            retries: env.parse("UPLOAD_RETRIES", 2)?,
            retry_delay: env.secs("UPLOAD_RETRY_DELAY_SECONDS", 60)?,
            timeout: env.nonzero_secs("UPLOAD_TIMEOUT_SECONDS", 120)?,
        };

        let project_dir = env.path("DBT_PROJECT_DIR", "dbt_brt");
        let downstream = DownstreamConfig {
            enabled: env.flag("DOWNSTREAM_ENABLED", true)?,
            command: env.get("DBT_BIN").unwrap_or_else(|| "dbt".to_string()),
            profiles_dir: env
                .get("DBT_PROFILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| project_dir.clone()),
            project_dir,
            warehouse_project_id: env.get("WAREHOUSE_PROJECT_ID"),
            generate_docs: env.flag("DBT_GENERATE_DOCS", true)?,
            timeout: env.nonzero_secs("DOWNSTREAM_TIMEOUT_SECONDS", 900)?,
        };

        Ok(Self {
            feed_url: env.get("BRT_API_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            window_size,
            interval,
            fetch_timeout: env.nonzero_secs("FETCH_TIMEOUT_SECONDS", 30)?,
            fetch_retries: env.parse("FETCH_RETRIES", 3)?,
            fetch_retry_delay: env.secs("FETCH_RETRY_DELAY_SECONDS", 30)?,
            data_dir: env.path("DATA_DIR", "./data"),
            storage,
            downstream,
        })
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    /// Trimmed value, with empty strings treated as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    /// Whole seconds in `0..=MAX_SECONDS`.
    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parse(key, default)?;
        if secs > MAX_SECONDS {
            return Err(ConfigError::Invalid {
                key,
                value: secs.to_string(),
                reason: format!("must be at most {MAX_SECONDS} seconds"),
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn nonzero_secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let duration = self.secs(key, default)?;
        if duration.is_zero() {
            return Err(ConfigError::Invalid {
                key,
                value: "0".into(),
                reason: "must be at least one second".into(),
            });
        }
        Ok(duration)
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or_else(|| default.to_string()))
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                key,
                value: other.to_string(),
                reason: "expected a boolean".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("STORAGE_BUCKET", "brt-data-civitas")]).unwrap();

        assert_eq!(cfg.feed_url, DEFAULT_FEED_URL);
        assert_eq!(cfg.window_size, 10);
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.fetch_retries, 3);
        assert_eq!(cfg.storage.folder, "brt-data");
        assert_eq!(
            cfg.storage.backend,
            StorageBackend::S3 { bucket: "brt-data-civitas".into() }
        );
        assert!(cfg.downstream.enabled);
        assert_eq!(cfg.downstream.profiles_dir, PathBuf::from("dbt_brt"));
    }

    #[test]
    fn test_missing_bucket_is_fatal() {
        let err = config(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STORAGE_BUCKET")));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let err = config(&[("STORAGE_BUCKET", "   ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STORAGE_BUCKET")));
    }

    #[test]
    fn test_local_backend_needs_no_bucket() {
        let cfg = config(&[("STORAGE_BACKEND", "local"), ("STORAGE_LOCAL_ROOT", "/tmp/objects")]).unwrap();
        assert_eq!(
            cfg.storage.backend,
            StorageBackend::Local { root: PathBuf::from("/tmp/objects") }
        );
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = config(&[("STORAGE_BUCKET", "b"), ("AGGREGATION_MINUTES", "ten")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AGGREGATION_MINUTES", .. }));

        let err = config(&[("STORAGE_BUCKET", "b"), ("AGGREGATION_MINUTES", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AGGREGATION_MINUTES", .. }));
    }

    #[test]
    fn test_durations_are_bounded_at_startup() {
        let huge = u64::MAX.to_string();
        for key in [
            "FETCH_RETRY_DELAY_SECONDS",
            "UPLOAD_RETRY_DELAY_SECONDS",
            "UPLOAD_TIMEOUT_SECONDS",
            "RUN_INTERVAL_SECONDS",
        ] {
            let err = config(&[("STORAGE_BUCKET", "b"), (key, &huge)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}: {err}"
            );
        }

        let err = config(&[("STORAGE_BUCKET", "b"), ("UPLOAD_TIMEOUT_SECONDS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "UPLOAD_TIMEOUT_SECONDS", .. }));

        let cfg = config(&[("STORAGE_BUCKET", "b"), ("FETCH_RETRY_DELAY_SECONDS", "0")]).unwrap();
        assert_eq!(cfg.fetch_retry_delay, Duration::ZERO);
        let cfg = config(&[("STORAGE_BUCKET", "b"), ("UPLOAD_RETRY_DELAY_SECONDS", "86400")]).unwrap();
        assert_eq!(cfg.storage.retry_delay, Duration::from_secs(MAX_SECONDS));
    }

    #[test]
    fn test_unknown_backend_and_bad_flag() {
        let err = config(&[("STORAGE_BACKEND", "gcs")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STORAGE_BACKEND", .. }));

        let err = config(&[("STORAGE_BUCKET", "b"), ("DOWNSTREAM_ENABLED", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DOWNSTREAM_ENABLED", .. }));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("STORAGE_BUCKET", "b"),
            ("BRT_API_URL", "http://localhost:8080/gps"),
            ("AGGREGATION_MINUTES", "3"),
            ("RUN_INTERVAL_SECONDS", "15"),
            ("DOWNSTREAM_ENABLED", "false"),
            ("DBT_PROFILES_DIR", "/etc/dbt"),
        ])
        .unwrap();
        assert_eq!(cfg.feed_url, "http://localhost:8080/gps");
        assert_eq!(cfg.window_size, 3);
        assert_eq!(cfg.interval, Duration::from_secs(15));
        assert!(!cfg.downstream.enabled);
        assert_eq!(cfg.downstream.profiles_dir, PathBuf::from("/etc/dbt"));
    }
}
