//! Ingest configuration
//!
//! Loaded from environment variables (a `.env` file is honoured by the
//! binary), validated, and then overridden by command-line flags.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::coordinator::CoordinatorOptions;
use crate::error::Result;
use crate::normalizer::{GeohashOptions, NormalizeOptions};
use crate::verifier::DEFAULT_SLACK;
use crate::writer::{WritePolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_IN_FLIGHT};
use tabload_common::TabloadError;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tabload";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_LOCAL_DIRECTORY: &str = "./data";
pub const DEFAULT_CATALOG: &str = "./catalog.json";
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_JOB_CONCURRENCY: usize = 1;
pub const DEFAULT_YIELD_EVERY: u64 = 1000;
pub const DEFAULT_LEASE_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestConfig {
    #[serde(skip_serializing)]
    pub database_url: String,
    pub max_connections: u32,
    pub local_directory: PathBuf,
    pub catalog_path: PathBuf,
    pub batch_size: usize,
    /// K: concurrent batch writes per job
    pub max_concurrent_writes: usize,
    pub write_timeout_secs: u64,
    pub write_max_attempts: u32,
    /// Base of the linear retry backoff
    pub retry_delay_ms: u64,
    /// Rows to skip at the start of each file
    pub resume: u64,
    /// First file index to load (0-based, inclusive)
    pub start_file: usize,
    /// Last file index to load (inclusive)
    pub end_file: Option<usize>,
    pub verify_slack: u64,
    pub geohash: bool,
    pub truncate_staging: bool,
    /// Jobs (files) loaded at the same time
    pub job_concurrency: usize,
    pub yield_every: u64,
    pub lease_secs: u64,
    #[serde(skip_serializing)]
    pub slack_webhook_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            local_directory: PathBuf::from(DEFAULT_LOCAL_DIRECTORY),
            catalog_path: PathBuf::from(DEFAULT_CATALOG),
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_writes: DEFAULT_MAX_IN_FLIGHT,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            write_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            resume: 0,
            start_file: 0,
            end_file: None,
            verify_slack: DEFAULT_SLACK,
            geohash: false,
            truncate_staging: false,
            job_concurrency: DEFAULT_JOB_CONCURRENCY,
            yield_every: DEFAULT_YIELD_EVERY,
            lease_secs: DEFAULT_LEASE_SECS,
            slack_webhook_url: None,
        }
    }
}

impl IngestConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys take their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
            local_directory: get("LOCAL_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_directory),
            catalog_path: get("TABLOAD_CATALOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            batch_size: parse(&get, "TABLOAD_BATCH_SIZE", defaults.batch_size)?,
            max_concurrent_writes: parse(
                &get,
                "TABLOAD_MAX_CONCURRENT_WRITES",
                defaults.max_concurrent_writes,
            )?,
            write_timeout_secs: parse(
                &get,
                "TABLOAD_WRITE_TIMEOUT_SECS",
                defaults.write_timeout_secs,
            )?,
            write_max_attempts: parse(
                &get,
                "TABLOAD_WRITE_MAX_ATTEMPTS",
                defaults.write_max_attempts,
            )?,
            retry_delay_ms: parse(&get, "TABLOAD_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            resume: parse(&get, "TABLOAD_RESUME", defaults.resume)?,
            start_file: parse(&get, "TABLOAD_START_FILE", defaults.start_file)?,
            end_file: get("TABLOAD_END_FILE")
                .map(|v| parse_value("TABLOAD_END_FILE", &v))
                .transpose()?,
            verify_slack: parse(&get, "TABLOAD_VERIFY_SLACK", defaults.verify_slack)?,
            geohash: parse(&get, "TABLOAD_GEOHASH", defaults.geohash)?,
            truncate_staging: parse(&get, "TABLOAD_TRUNCATE_STAGING", defaults.truncate_staging)?,
            job_concurrency: parse(&get, "TABLOAD_JOB_CONCURRENCY", defaults.job_concurrency)?,
            yield_every: parse(&get, "TABLOAD_YIELD_EVERY", defaults.yield_every)?,
            lease_secs: parse(&get, "TABLOAD_LEASE_SECS", defaults.lease_secs)?,
            slack_webhook_url: get("SLACK_WEBHOOK_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(TabloadError::config(msg).into()) };

        if self.batch_size == 0 {
            return fail("batch size must be at least 1");
        }
        if self.max_concurrent_writes == 0 {
            return fail("max concurrent writes must be at least 1");
        }
        if self.write_max_attempts == 0 {
            return fail("write attempts must be at least 1");
        }
        if self.write_timeout_secs == 0 {
            return fail("write timeout must be greater than zero");
        }
        if self.job_concurrency == 0 {
            return fail("job concurrency must be at least 1");
        }
        if self.max_connections == 0 {
            return fail("database connections must be at least 1");
        }
        if let Some(end) = self.end_file {
            if end < self.start_file {
                return Err(TabloadError::config(format!(
                    "end file {} is before start file {}",
                    end, self.start_file
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            max_in_flight: self.max_concurrent_writes,
            max_attempts: self.write_max_attempts,
            attempt_timeout: Duration::from_secs(self.write_timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        let options = NormalizeOptions::default();
        if self.geohash {
            options.with_geohash(GeohashOptions::default())
        } else {
            options
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            batch_size: self.batch_size,
            write_policy: self.write_policy(),
            normalize: self.normalize_options(),
            resume: self.resume,
            verify_slack: self.verify_slack,
            truncate_staging: self.truncate_staging,
            yield_every: self.yield_every,
            lease: Duration::from_secs(self.lease_secs),
        }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match get(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        TabloadError::Parse(format!("{} has an invalid value: '{}'", key, value)).into()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = IngestConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_concurrent_writes, 5);
        assert_eq!(config.write_max_attempts, 3);
        assert_eq!(config.verify_slack, 1000);
        assert_eq!(config.resume, 0);
        assert!(!config.geohash);
        assert!(config.normalize_options().geohash.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = IngestConfig::from_lookup(lookup(&[
            ("TABLOAD_BATCH_SIZE", "250"),
            ("TABLOAD_GEOHASH", "true"),
            ("TABLOAD_START_FILE", "2"),
            ("TABLOAD_END_FILE", "4"),
            ("SLACK_WEBHOOK_URL", "https://hooks.example/x"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.end_file, Some(4));
        assert!(config.normalize_options().geohash.is_some());
        assert_eq!(config.slack_webhook_url.as_deref(), Some("https://hooks.example/x"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = IngestConfig::from_lookup(lookup(&[("TABLOAD_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, IngestError::Common(TabloadError::Parse(_))), "{err}");
        assert!(IngestConfig::from_lookup(lookup(&[("TABLOAD_BATCH_SIZE", "0")])).is_err());
        assert!(IngestConfig::from_lookup(lookup(&[
            ("TABLOAD_START_FILE", "5"),
            ("TABLOAD_END_FILE", "3"),
        ]))
        .is_err());
    }

    #[test]
    fn test_write_policy() {
        let policy = IngestConfig::default().write_policy();
        assert_eq!(policy.max_in_flight, 5);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(60));
        assert_eq!(policy.retry_delay, Duration::from_millis(1000));
    }
}
