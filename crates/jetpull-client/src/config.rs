// Client-side defaults and configuration loading.
use anyhow::{Context, Result};
use jetpull_wire::DEFAULT_API_PREFIX;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_NEXT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_STREAM_BATCH: usize = 100;
pub(crate) const DEFAULT_STREAM_EXPIRY: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Gap between the expiry sent to the server and the local deadline, so the
/// server gives up on a pull before the client does.
pub(crate) const EXPIRY_MARGIN: Duration = Duration::from_millis(10);
/// Below this, `next` sends no expiry at all.
pub(crate) const MIN_EXPIRING_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_prefix: String,
    // Used by `next` when the caller passes no timeout.
    pub next_timeout: Duration,
    pub stream_batch: usize,
    pub stream_expiry: Duration,
    pub admin_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            next_timeout: DEFAULT_NEXT_TIMEOUT,
            stream_batch: DEFAULT_STREAM_BATCH,
            stream_expiry: DEFAULT_STREAM_EXPIRY,
            admin_timeout: DEFAULT_ADMIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    api_prefix: Option<String>,
    next_timeout_ms: Option<u64>,
    stream_batch: Option<usize>,
    stream_expiry_ms: Option<u64>,
    admin_timeout_ms: Option<u64>,
}

impl ClientConfig {
    /// Defaults, then `JETPULL_*` environment variables, then the YAML file at
    /// `config_path` (or `JETPULL_CLIENT_CONFIG`) if one is given.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("JETPULL_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("JETPULL_API_PREFIX")
            && !value.trim().is_empty()
        {
            config.api_prefix = value.trim().to_string();
        }
        if let Some(value) = read_millis_env("JETPULL_NEXT_TIMEOUT_MS") {
            config.next_timeout = value;
        }
        if let Some(value) = read_usize_env("JETPULL_STREAM_BATCH") {
            config.stream_batch = value;
        }
        if let Some(value) = read_millis_env("JETPULL_STREAM_EXPIRY_MS") {
            config.stream_expiry = value;
        }
        if let Some(value) = read_millis_env("JETPULL_ADMIN_TIMEOUT_MS") {
            config.admin_timeout = value;
        }
        config
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_next_timeout(mut self, timeout: Duration) -> Self {
        self.next_timeout = timeout;
        self
    }

    pub fn with_stream_defaults(mut self, batch: usize, expiry: Duration) -> Self {
        self.stream_batch = batch;
        self.stream_expiry = expiry;
        self
    }

    pub fn with_admin_timeout(mut self, timeout: Duration) -> Self {
        self.admin_timeout = timeout;
        self
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.api_prefix
            && !value.trim().is_empty()
        {
            config.api_prefix = value.trim().to_string();
        }
        if let Some(value) = self.next_timeout_ms
            && value > 0
        {
            config.next_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.stream_batch
            && value > 0
        {
            config.stream_batch = value;
        }
        if let Some(value) = self.stream_expiry_ms
            && value > 0
        {
            config.stream_expiry = Duration::from_millis(value);
        }
        if let Some(value) = self.admin_timeout_ms
            && value > 0
        {
            config.admin_timeout = Duration::from_millis(value);
        }
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}
