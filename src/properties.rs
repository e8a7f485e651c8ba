// src/properties.rs
// Named options handed to Connect, CreateSender and CreateReceiver

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const PREFETCH_COUNT: &str = "prefetch.count";
pub const RECEIVE_TIMEOUT_MS: &str = "receive.timeout.ms";
pub const DURABLE: &str = "durable";
pub const COMMIT_MODE: &str = "commit.mode";
pub const CLOSE_TIMEOUT_MS: &str = "close.timeout.ms";
pub const OPTIMIZE_ACKNOWLEDGE: &str = "optimize.acknowledge";
pub const CONNECT_ATTEMPTS: &str = "connect.attempts";
pub const CONNECT_RETRY_DELAY_MS: &str = "connect.retry.delay.ms";
pub const SHUTDOWN_COMMIT: &str = "shutdown.commit";
pub const MAX_FRAME_SIZE: &str = "max.frame.size";

fn default_prefetch_count() -> u16 {
    1
}
fn default_close_timeout_ms() -> u64 {
    1000
}
fn default_connect_attempts() -> u32 {
    1
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}
fn default_max_frame_size() -> usize {
    4 * 1024 * 1024
}

/// String-keyed option map. Keys nobody recognizes are carried along and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a copy of `self` with every entry of `overrides` applied on top.
    pub fn merged(&self, overrides: &Properties) -> Properties {
        let mut values = self.values.clone();
        values.extend(overrides.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Properties { values }
    }

    /// Typed lookup. A value that does not parse is reported and treated as absent.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = raw, "Ignoring unparseable property value");
                None
            }
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        let raw = self.get(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => {
                warn!(key, value = raw, "Ignoring unparseable boolean property");
                None
            }
        }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Properties::new();
        for (key, value) in iter {
            properties.set(key, value);
        }
        properties
    }
}

/// When the session's transaction boundaries are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// Every send/receive is committed before the session lock is released.
    #[default]
    Auto,
    /// Work accumulates until the caller commits or rolls back.
    Manual,
}

impl CommitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitMode::Auto => "auto",
            CommitMode::Manual => "manual",
        }
    }
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(CommitMode::Auto),
            "manual" => Ok(CommitMode::Manual),
            other => Err(format!("unknown commit mode '{}'", other)),
        }
    }
}

/// Connection-wide policy read from the properties given to Connect.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub commit_mode: CommitMode,
    pub close_timeout: Duration,
    /// Trades delivery guarantees for throughput on transports that support it.
    pub optimize_acknowledge: bool,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Commit (rather than roll back) pending work during Shutdown.
    pub shutdown_commit: bool,
    pub max_frame_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Auto,
            close_timeout: Duration::from_millis(default_close_timeout_ms()),
            optimize_acknowledge: false,
            connect_attempts: default_connect_attempts(),
            connect_retry_delay: Duration::from_millis(default_connect_retry_delay_ms()),
            shutdown_commit: false,
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ConnectionOptions {
    pub fn from_properties(properties: &Properties) -> Self {
        let defaults = Self::default();
        Self {
            commit_mode: properties.parse(COMMIT_MODE).unwrap_or(defaults.commit_mode),
            close_timeout: properties
                .parse(CLOSE_TIMEOUT_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.close_timeout),
            optimize_acknowledge: properties
                .flag(OPTIMIZE_ACKNOWLEDGE)
                .unwrap_or(defaults.optimize_acknowledge),
            connect_attempts: properties
                .parse::<u32>(CONNECT_ATTEMPTS)
                .map(|attempts| attempts.max(1))
                .unwrap_or(defaults.connect_attempts),
            connect_retry_delay: properties
                .parse(CONNECT_RETRY_DELAY_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_retry_delay),
            shutdown_commit: properties.flag(SHUTDOWN_COMMIT).unwrap_or(defaults.shutdown_commit),
            max_frame_size: properties.parse(MAX_FRAME_SIZE).unwrap_or(defaults.max_frame_size),
        }
    }
}

/// Per-destination settings for a sender or receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationOptions {
    pub prefetch_count: u16,
    /// `None` waits until a message arrives.
    pub receive_timeout: Option<Duration>,
    pub durable: bool,
    pub optimize_acknowledge: bool,
}

impl Default for DestinationOptions {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch_count(),
            receive_timeout: None,
            durable: true,
            optimize_acknowledge: false,
        }
    }
}

impl DestinationOptions {
    /// Destination properties override the connection-level defaults.
    pub fn resolve(connection: &Properties, destination: &Properties) -> Self {
        let properties = connection.merged(destination);
        let defaults = Self::default();
        Self {
            prefetch_count: properties.parse(PREFETCH_COUNT).unwrap_or(defaults.prefetch_count),
            receive_timeout: properties
                .parse(RECEIVE_TIMEOUT_MS)
                .map(Duration::from_millis)
                .or(defaults.receive_timeout),
            durable: properties.flag(DURABLE).unwrap_or(defaults.durable),
            optimize_acknowledge: properties
                .flag(OPTIMIZE_ACKNOWLEDGE)
                .unwrap_or(defaults.optimize_acknowledge),
        }
    }
}
