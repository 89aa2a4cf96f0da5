//! Deployment configuration, loaded from a YAML file.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other).
    Auto,
    /// With colors.
    Pretty,
    /// Simplified log output.
    Simplified,
    /// Dump out JSON lines.
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the gateway.
    pub level: String,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: "info".to_owned(),
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance.
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "besgate".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection settings for the Backend Execution Service.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BesConfig {
    /// Hostname of the BES.
    pub host: String,
    /// Port the BES listens on.
    pub port: u16,
    /// Per-transaction time budget, forwarded to the BES as the
    /// `bes_timeout` context.
    ///
    /// This is a per-call value; it is stripped from descriptors before they
    /// are cached, since a cached descriptor may be replayed later under a
    /// different timeout policy.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum response size the BES is asked to produce, in bytes.
    /// 0 means unlimited.
    pub max_response_size: u64,
}

impl Default for BesConfig {
    fn default() -> Self {
        BesConfig {
            host: "localhost".to_owned(),
            port: 10022,
            timeout: Duration::from_secs(300),
            max_response_size: 0,
        }
    }
}

/// Fine-tuning of the catalog transaction cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CatalogCacheConfig {
    /// Number of transactions kept in memory. Must be greater than 0.
    pub max_entries: usize,
    /// How often the background task re-executes cached transactions against
    /// the BES. A value of 0 disables the refresh task but not the cache.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for CatalogCacheConfig {
    fn default() -> Self {
        CatalogCacheConfig {
            max_entries: 50,
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Policy values for the deferred (asynchronous) response machinery.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DeferredConfig {
    /// How long the gateway estimates a slow data response will take.
    #[serde(with = "humantime_serde")]
    pub response_delay: Duration,
    /// How long a completed result remains retrievable after it is ready.
    #[serde(with = "humantime_serde")]
    pub result_lifetime: Duration,
    /// Upper bound on how long a request worker blocks executing a now-due
    /// request before returning a pending response instead.
    #[serde(with = "humantime_serde")]
    pub ready_wait_ceiling: Duration,
    /// When false, pending and gone responses are reported as plain
    /// not-found hints instead of the distinguishing status codes.
    pub use_pending_and_gone: bool,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        DeferredConfig {
            response_delay: Duration::from_secs(60),
            result_lifetime: Duration::from_secs(3600),
            ready_wait_ceiling: Duration::from_secs(90),
            use_pending_and_gone: true,
        }
    }
}

/// See `docs/` for more information on config values.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: Option<String>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Connection settings for the BES.
    pub bes: BesConfig,

    /// Fine-tune the catalog transaction cache.
    pub catalog_cache: CatalogCacheConfig,

    /// Policy for asynchronous data responses.
    pub deferred: DeferredConfig,
}

impl Config {
    /// The address to bind the HTTP server to.
    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or("127.0.0.1:3017")
    }

    /// Loads the config from a file, or falls back to defaults.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_yaml::from_reader(reader).context("failed to parse YAML")
    }

    /// Rejects configurations the gateway must not start with.
    ///
    /// Invalid policy values fail here, at load time, rather than surfacing
    /// as request-time errors.
    fn validate(&self) -> Result<()> {
        ensure!(
            self.catalog_cache.max_entries > 0,
            "catalog_cache.max_entries must be greater than 0"
        );
        ensure!(!self.bes.host.is_empty(), "bes.host must not be empty");
        Ok(())
    }
}
