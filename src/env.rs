use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::properties::{self, CommitMode, Properties};

/// Settings taken from `MESSENGER_*` environment variables (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub broker_uri: String,
    pub queue: String,
    pub prefetch_count: u16,
    pub receive_timeout_ms: Option<u64>,
    pub close_timeout_ms: u64,
    pub optimize_acknowledge: bool,
    pub commit_mode: CommitMode,
}

fn default_broker_uri() -> String {
    "mock://broker".to_string()
}

fn default_queue() -> String {
    "orders".to_string()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_close_timeout_ms() -> u64 {
    1000
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `load` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(value) => Ok(Some(
                    value.trim().parse::<u64>().with_context(|| format!("{} must be a number, got '{}'", key, value))?,
                )),
                None => Ok(None),
            }
        };

        Ok(EnvConfig {
            broker_uri: lookup("MESSENGER_BROKER_URI").unwrap_or_else(default_broker_uri),
            queue: lookup("MESSENGER_QUEUE").unwrap_or_else(default_queue),
            prefetch_count: match lookup("MESSENGER_PREFETCH_COUNT") {
                Some(value) => value
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("MESSENGER_PREFETCH_COUNT must fit in u16, got '{}'", value))?,
                None => default_prefetch_count(),
            },
            receive_timeout_ms: parsed("MESSENGER_RECEIVE_TIMEOUT_MS")?,
            close_timeout_ms: parsed("MESSENGER_CLOSE_TIMEOUT_MS")?.unwrap_or_else(default_close_timeout_ms),
            optimize_acknowledge: lookup("MESSENGER_OPTIMIZE_ACKNOWLEDGE")
                .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
                .unwrap_or(false),
            commit_mode: match lookup("MESSENGER_COMMIT_MODE") {
                Some(value) => value
                    .parse::<CommitMode>()
                    .map_err(anyhow::Error::msg)
                    .context("MESSENGER_COMMIT_MODE")?,
                None => CommitMode::Auto,
            },
        })
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    /// Properties to hand to Connect.
    pub fn connection_properties(&self) -> Properties {
        let mut properties = Properties::new()
            .with(properties::PREFETCH_COUNT, self.prefetch_count)
            .with(properties::CLOSE_TIMEOUT_MS, self.close_timeout_ms)
            .with(properties::OPTIMIZE_ACKNOWLEDGE, self.optimize_acknowledge)
            .with(properties::COMMIT_MODE, self.commit_mode.as_str());
        if let Some(timeout) = self.receive_timeout_ms {
            properties.set(properties::RECEIVE_TIMEOUT_MS, timeout);
        }
        properties
    }
}
