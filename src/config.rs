//! Process configuration, read from the environment.
//!
//! Every field has a default so a bare `cargo run` talks to a local Redis on
//! the standard port. Durations accept plain seconds (`10`) or a unit suffix
//! (`100ms`, `5s`, `2m`).

use crate::coordinator::StampedeConfig;
use anyhow::{Context, ensure};
use figment::{Figment, providers::Env};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Longest accepted lock or cache TTL.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the proxy listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Crate log level, used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    #[serde(default, deserialize_with = "deserialize_opt_string")]
    pub redis_password: Option<String>,

    /// Single lock key shared by every resource.
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    #[serde(
        default = "default_lock_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub lock_ttl: Duration,
    #[serde(
        default = "default_cache_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub cache_ttl: Duration,
    #[serde(
        default = "default_wait_budget",
        deserialize_with = "deserialize_duration"
    )]
    pub wait_budget: Duration,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,

    /// Upper bound on a single origin request, body included.
    #[serde(
        default = "default_origin_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub origin_timeout: Duration,
    /// Grace period for in-flight requests after a shutdown signal.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, anyhow::Error> {
        Self::from_figment(Figment::new().merge(Env::raw()))
    }

    /// Extract configuration from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self, anyhow::Error> {
        let config: Self = figment.extract().context("Failed to load config")?;
        config.validate().context("Invalid config")?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        ensure!(!self.poll_interval.is_zero(), "POLL_INTERVAL must be greater than zero");
        ensure!(!self.origin_timeout.is_zero(), "ORIGIN_TIMEOUT must be greater than zero");
        for (name, ttl) in [("LOCK_TTL", self.lock_ttl), ("CACHE_TTL", self.cache_ttl)] {
            ensure!(!ttl.is_zero(), "{name} must be greater than zero");
            ensure!(
                ttl <= MAX_TTL,
                "{name} of {ttl:?} exceeds the {}-day limit",
                MAX_TTL.as_secs() / 86_400
            );
        }
        Ok(())
    }

    /// Stampede-control settings for the coordinator.
    pub fn stampede(&self) -> StampedeConfig {
        StampedeConfig {
            lock_key: self.lock_key.clone(),
            lock_ttl: self.lock_ttl,
            cache_ttl: self.cache_ttl,
            wait_budget: self.wait_budget,
            poll_interval: self.poll_interval,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_lock_key() -> String {
    StampedeConfig::default().lock_key
}

fn default_lock_ttl() -> Duration {
    StampedeConfig::default().lock_ttl
}

fn default_cache_ttl() -> Duration {
    StampedeConfig::default().cache_ttl
}

fn default_wait_budget() -> Duration {
    StampedeConfig::default().wait_budget
}

fn default_poll_interval() -> Duration {
    StampedeConfig::default().poll_interval
}

fn default_origin_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Parse a human duration such as `250ms`, `5s` or `2m`. A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let parser = DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ]);
    let parsed = parser
        .parse(value.trim())
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration {value:?}: {e}"))
}

/// Accepts either an integer (seconds) or a string understood by [`parse_duration`].
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Env values that look numeric arrive as numbers; passwords still need to be strings.
fn deserialize_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Signed(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
    }))
}
