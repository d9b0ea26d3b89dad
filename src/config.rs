use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

/// Top-level configuration for the refresh worker.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Warehouse task endpoint.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Refresh loop configuration.
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Metrics, health and read API server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Warehouse task endpoint configuration.
///
/// Requests go to `{scheme}://{server}/{base}{route}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// "http" or "https". Default: "http".
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host and optional port, e.g. "erp.local:8080".
    #[serde(default)]
    pub server: String,

    /// Published base path of the warehouse database, e.g. "trade/hs".
    #[serde(default)]
    pub base: String,

    /// Route of the task service, e.g. "/tasks".
    #[serde(default)]
    pub route: String,

    #[serde(default)]
    pub api_key: String,

    /// Basic auth user. Empty disables basic auth.
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Upper bound for `refresh.lookback_days`, about ten years.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

/// Refresh loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Time between refresh cycles. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How many days of history to request when nothing is retained yet.
    /// Default: 7.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

/// Health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_scheme() -> String {
    "http".to_string()
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_lookback_days() -> u32 {
    7
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            server: String::new(),
            base: String::new(),
            route: String::new(),
            api_key: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: default_upstream_timeout(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
            lookback_days: default_lookback_days(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let upstream = &self.upstream;

        if upstream.server.is_empty() {
            bail!("upstream.server is required");
        }

        if upstream.route.is_empty() {
            bail!("upstream.route is required");
        }

        if upstream.api_key.is_empty() {
            bail!("upstream.api_key is required");
        }

        if upstream.scheme != "http" && upstream.scheme != "https" {
            bail!(
                "upstream.scheme must be \"http\" or \"https\", got {:?}",
                upstream.scheme
            );
        }

        if Url::parse(&upstream.url()).is_err() {
            bail!(
                "upstream.server/base/route form an invalid URL: {}",
                upstream.url()
            );
        }

        if upstream.username.is_empty() && !upstream.password.is_empty() {
            bail!("upstream.password requires upstream.username");
        }

        if upstream.timeout.is_zero() {
            bail!("upstream.timeout must be positive");
        }

        if self.refresh.interval.is_zero() {
            bail!("refresh.interval must be positive");
        }

        if self.refresh.lookback_days == 0 {
            bail!("refresh.lookback_days must be positive");
        }

        if self.refresh.lookback_days > MAX_LOOKBACK_DAYS {
            bail!(
                "refresh.lookback_days must be at most {MAX_LOOKBACK_DAYS}, got {}",
                self.refresh.lookback_days
            );
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }
}

impl UpstreamConfig {
    /// Full task endpoint URL, without query parameters.
    pub fn url(&self) -> String {
        let server = self.server.trim_end_matches('/');
        let base = self.base.trim_matches('/');
        let route = self.route.trim_start_matches('/');

        if base.is_empty() {
            format!("{}://{}/{}", self.scheme, server, route)
        } else {
            format!("{}://{}/{}/{}", self.scheme, server, base, route)
        }
    }
}
