use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::request::RequestConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "fanout".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Timeouts of the HTTP transport.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Global timeout for a single request, including reading the response body.
    #[serde(with = "humantime_serde")]
    pub max_request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            max_request: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The capacity of the response cache in megabytes, where one megabyte is 1,000,000 bytes.
    ///
    /// A capacity of `0` disables the response cache.
    pub cache_capacity_mb: f64,

    /// Configuration of the logging system.
    pub logging: Logging,

    /// Configuration of the metrics system.
    pub metrics: Metrics,

    /// Timeouts of the HTTP transport.
    pub timeouts: Timeouts,

    /// The `User-Agent` sent with every request, unless the request sets its own.
    pub user_agent: String,

    /// The defaults applied to requests that do not bring their own [`RequestConfig`].
    pub default_request: RequestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_capacity_mb: 10.0,
            logging: Logging::default(),
            metrics: Metrics::default(),
            timeouts: Timeouts::default(),
            user_agent: format!("fanout/{}", env!("CARGO_PKG_VERSION")),
            default_request: RequestConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        if !(config.cache_capacity_mb >= 0.0 && config.cache_capacity_mb.is_finite()) {
            anyhow::bail!(
                "cache_capacity_mb must be a non-negative number, got {}",
                config.cache_capacity_mb
            );
        }
        Ok(config)
    }

    /// The response cache capacity in bytes.
    pub fn cache_capacity_bytes(&self) -> usize {
        megabytes_to_bytes(self.cache_capacity_mb)
    }
}

/// Converts a capacity given in (decimal) megabytes into bytes.
///
/// Negative and non-finite inputs yield `0`.
pub fn megabytes_to_bytes(megabytes: f64) -> usize {
    let bytes = megabytes * 1_000_000.0;
    if bytes.is_finite() && bytes > 0.0 {
        // `as` saturates at `usize::MAX`.
        bytes as usize
    } else {
        0
    }
}

struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
