//! Typed harness configuration.
//!
//! Values come from an optional TOML file named by `WORKQ_HARNESS_CONFIG`,
//! then environment variables, which win. Everything has a default, so an
//! empty environment is valid; malformed values are an error.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Default unit timeout. Device builds for ARM mobile targets run slower.
#[cfg(all(
    any(target_arch = "arm", target_arch = "aarch64"),
    any(target_os = "ios", target_os = "watchos", target_os = "tvos")
))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
#[cfg(not(all(
    any(target_arch = "arm", target_arch = "aarch64"),
    any(target_os = "ios", target_os = "watchos", target_os = "tvos")
)))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How long a fixture waits for a unit before reporting a timeout.
    pub default_timeout: Duration,
    /// How long teardown waits for an owned queue to drain before cancelling.
    pub teardown_grace: Duration,
    /// Bound for the shared concurrent queue. `None` means unbounded.
    pub max_concurrent: Option<usize>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            max_concurrent: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk form. Durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    timeout_ms: Option<u64>,
    teardown_grace_ms: Option<u64>,
    max_concurrent: Option<usize>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("WORKQ_HARNESS_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(ms) = parse_var::<u64>("WORKQ_HARNESS_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("WORKQ_HARNESS_TEARDOWN_GRACE_MS")? {
            config.teardown_grace = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>("WORKQ_HARNESS_MAX_CONCURRENT")? {
            config.max_concurrent = Some(n);
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            config.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();
        let config = Self {
            default_timeout: file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_timeout),
            teardown_grace: file
                .teardown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.teardown_grace),
            max_concurrent: file.max_concurrent,
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::Config("timeout must be greater than zero".to_string()));
        }
        if self.max_concurrent == Some(0) {
            return Err(Error::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// Process-wide configuration, loaded on first use.
///
/// An invalid environment falls back to defaults with a warning rather
/// than failing every test in the process.
pub fn global() -> &'static Config {
    GLOBAL.get_or_init(|| {
        dotenvy::dotenv().ok();
        Config::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "invalid harness configuration, using defaults");
            Config::default()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            timeout_ms = 2500
            max_concurrent = 3
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.teardown_grace, DEFAULT_TEARDOWN_GRACE);
        assert_eq!(config.max_concurrent, Some(3));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml_str("timeout = 5").is_err());
    }

    #[test]
    fn zero_bounds_are_rejected() {
        assert!(Config::from_toml_str("timeout_ms = 0").is_err());
        assert!(Config::from_toml_str("max_concurrent = 0").is_err());
    }
}
