use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bar_store::writer::RetryPolicy;
use crate::binance::ws::ReconnectPolicy;
use crate::error::AppError;
use crate::ingest::IngestConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub ws_url: String,
    /// Label written to the `source` column of every bar.
    #[serde(default = "default_source")]
    pub source: String,
    /// Per-symbol stream suffix: `trade`, `aggTrade` or `kline_1m`.
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Late-trade tolerance after a minute boundary.
    #[serde(default = "default_tick_buffer_sec")]
    pub tick_buffer_sec: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Streaming time after which a connection counts as healthy and the
    /// failure count starts over.
    #[serde(default = "default_healthy_after_ms")]
    pub healthy_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_true")]
    pub persist_ticks: bool,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_write_retry_delay_ms")]
    pub write_retry_delay_ms: u64,
    /// Pending write requests the live writer holds before new ones are dropped.
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
    /// Time the writer gets to empty its queue once the feed has stopped.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_safety_lag_minutes")]
    pub safety_lag_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_source() -> String {
    "binance".to_string()
}
fn default_stream() -> String {
    "trade".to_string()
}
fn default_channel_capacity() -> usize {
    4096
}
fn default_tick_buffer_sec() -> u64 {
    5
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_stats_interval_secs() -> u64 {
    60
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_healthy_after_ms() -> u64 {
    30_000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/bars.sqlite")
}
fn default_true() -> bool {
    true
}
fn default_write_retries() -> u32 {
    3
}
fn default_write_retry_delay_ms() -> u64 {
    200
}
fn default_write_queue_capacity() -> usize {
    1024
}
fn default_shutdown_drain_ms() -> u64 {
    10_000
}
fn default_safety_lag_minutes() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            tick_buffer_sec: default_tick_buffer_sec(),
            flush_interval_ms: default_flush_interval_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            healthy_after_ms: default_healthy_after_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            persist_ticks: true,
            write_retries: default_write_retries(),
            write_retry_delay_ms: default_write_retry_delay_ms(),
            write_queue_capacity: default_write_queue_capacity(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            safety_lag_minutes: default_safety_lag_minutes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Trim, uppercase and de-duplicate a symbol list, keeping first-seen order.
pub fn normalize_symbols<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for sym in raw {
        let s = sym.as_ref().trim().to_ascii_uppercase();
        if !s.is_empty() && !out.iter().any(|v| v == &s) {
            out.push(s);
        }
    }
    out
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .ok()
        .with_context(|| format!("{} has invalid value '{}'", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{} has invalid boolean '{}'", key, value),
    }
}

impl Config {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(toml_str).context("failed to parse config")?;
        config.feed.symbols = normalize_symbols(&config.feed.symbols);
        Ok(config)
    }

    /// Load `.env`, read the TOML file (`TR_CONFIG` or `config/default.toml`),
    /// apply `TR_*` environment overrides and validate.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("TR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_path(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    /// Apply `TR_*` overrides through `lookup`, so tests need not touch the
    /// process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TR_FEED_URL") {
            self.feed.ws_url = v.trim().to_string();
        }
        if let Some(v) = lookup("TR_SYMBOLS") {
            self.feed.symbols = normalize_symbols(v.split(','));
        }
        if let Some(v) = lookup("TR_TICK_BUFFER_SEC") {
            self.ingest.tick_buffer_sec = parse_env("TR_TICK_BUFFER_SEC", &v)?;
        }
        if let Some(v) = lookup("TR_BACKOFF_BASE_MS") {
            self.reconnect.base_delay_ms = parse_env("TR_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("TR_BACKOFF_CAP_MS") {
            self.reconnect.max_delay_ms = parse_env("TR_BACKOFF_CAP_MS", &v)?;
        }
        if let Some(v) = lookup("TR_MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = parse_env("TR_MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TR_PERSIST_TICKS") {
            self.storage.persist_ticks = parse_bool("TR_PERSIST_TICKS", &v)?;
        }
        if let Some(v) = lookup("TR_DB_PATH") {
            self.storage.db_path = PathBuf::from(v.trim());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let url = url::Url::parse(&self.feed.ws_url)
            .map_err(|e| AppError::Config(format!("feed.ws_url '{}': {}", self.feed.ws_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AppError::Config(format!(
                "feed.ws_url must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        if self.feed.symbols.is_empty() {
            return Err(AppError::Config("feed.symbols is empty".to_string()));
        }
        if self.feed.stream.trim().is_empty() {
            return Err(AppError::Config("feed.stream is empty".to_string()));
        }
        if self.feed.channel_capacity == 0 {
            return Err(AppError::Config("feed.channel_capacity must be > 0".to_string()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(AppError::Config("reconnect.base_delay_ms must be > 0".to_string()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(AppError::Config(format!(
                "reconnect.base_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(AppError::Config("reconnect.max_attempts must be >= 1".to_string()));
        }
        if self.storage.write_queue_capacity == 0 {
            return Err(AppError::Config("storage.write_queue_capacity must be > 0".to_string()));
        }
        if self.ingest.flush_interval_ms == 0 {
            return Err(AppError::Config("ingest.flush_interval_ms must be > 0".to_string()));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(AppError::Config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.storage.write_retries.max(1),
            delay: Duration::from_millis(self.storage.write_retry_delay_ms),
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            source: self.feed.source.clone(),
            tick_buffer_sec: self.ingest.tick_buffer_sec,
            flush_interval: Duration::from_millis(self.ingest.flush_interval_ms),
            persist_ticks: self.storage.persist_ticks,
            stats_interval: Duration::from_secs(self.ingest.stats_interval_secs.max(1)),
        }
    }
}
