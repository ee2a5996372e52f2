//! Configuration loading for hugd.
//!
//! Configuration is TOML sections with serde defaults, resolved from:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//! 4. built-in defaults
//!
//! The environment then overrides the interop-critical knobs (API key,
//! account, region, transport, port, cache URL, log level), so a bare
//! container needs no file at all. The library consumes the resulting
//! [`HuginnConfig`] as an opaque struct; only the binary loads it.

#[cfg(feature = "server")]
use std::path::Path;

use serde::Deserialize;

use crate::backend::{BreakerConfig, RateLimitConfig, RetryConfig};
use crate::discovery::DiscoveryConfig;
use crate::state::StateConfig;
use crate::tools::DispatchLimits;
use crate::types::QualityWeights;
use crate::validator::ValidatorLimits;
use crate::{HuginnError, Result};

/// Environment variable names, the fixed interop contract.
pub mod env {
    pub const API_KEY: &str = "HUGINN_API_KEY";
    pub const ACCOUNT: &str = "HUGINN_ACCOUNT";
    pub const REGION: &str = "HUGINN_REGION";
    pub const TRANSPORT: &str = "HUGINN_TRANSPORT";
    pub const PORT: &str = "HUGINN_PORT";
    pub const CACHE_URL: &str = "HUGINN_CACHE_URL";
    pub const LOG_LEVEL: &str = "HUGINN_LOG_LEVEL";
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HuginnConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub quality: QualityWeights,
    #[serde(default)]
    pub validator: ValidatorLimits,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub ratelimit: RateLimitSection,
}

/// Server and transport selection.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Transport: "stdio", "http", or "sse". Default: stdio.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Bind address for http/sse. Default: 127.0.0.1.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port for http/sse. Default: 8143.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log filter. Default: info.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8143
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Backend credentials and addressing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    /// API key; usually supplied via `HUGINN_API_KEY` instead.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Default account (tenant) id.
    #[serde(default)]
    pub account: i64,
    /// Region: "us", "eu", or "staging". Default: us.
    #[serde(default = "default_region")]
    pub region: String,
    /// Explicit endpoint override (tests, proxies).
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_region() -> String {
    "us".to_string()
}

/// Cache and session store.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Networked backend URL (redis). In-process store when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Key prefix for the networked backend.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Byte budget for cached values, in MiB. Default: 64.
    #[serde(default = "default_cache_mb")]
    pub max_memory_mb: usize,
    /// Shard count for the in-process store. Default: 16.
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Session inactivity TTL in minutes. Default: 30.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_minutes: u64,
    /// Expiry sweeper cadence in seconds. Default: 60.
    #[serde(default = "default_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            url: None,
            prefix: default_prefix(),
            max_memory_mb: default_cache_mb(),
            shards: default_shards(),
            session_ttl_minutes: default_session_ttl(),
            sweep_interval_secs: default_sweep(),
        }
    }
}

fn default_prefix() -> String {
    "huginn".to_string()
}

fn default_cache_mb() -> usize {
    64
}

fn default_shards() -> usize {
    16
}

fn default_session_ttl() -> u64 {
    30
}

fn default_sweep() -> u64 {
    60
}

impl CacheSection {
    pub fn state_config(&self) -> StateConfig {
        StateConfig {
            shards: self.shards,
            max_bytes: self.max_memory_mb * 1024 * 1024,
            session_ttl: std::time::Duration::from_secs(self.session_ttl_minutes * 60),
            sweep_interval: std::time::Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

/// Dispatcher limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default = "default_per_tool")]
    pub per_tool_concurrency: usize,
    #[serde(default = "default_queue")]
    pub queue_depth: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_ceiling_secs")]
    pub timeout_ceiling_secs: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            per_tool_concurrency: default_per_tool(),
            queue_depth: default_queue(),
            default_timeout_secs: default_timeout_secs(),
            timeout_ceiling_secs: default_ceiling_secs(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_global_concurrency() -> usize {
    16
}

fn default_per_tool() -> usize {
    4
}

fn default_queue() -> usize {
    32
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_ceiling_secs() -> u64 {
    120
}

fn default_min_confidence() -> f64 {
    0.7
}

impl LimitsSection {
    pub fn dispatch_limits(&self) -> DispatchLimits {
        DispatchLimits {
            global_concurrency: self.global_concurrency,
            per_tool_concurrency: self.per_tool_concurrency,
            queue_depth: self.queue_depth,
            default_timeout: std::time::Duration::from_secs(self.default_timeout_secs),
            timeout_ceiling: std::time::Duration::from_secs(self.timeout_ceiling_secs),
            min_confidence: self.min_confidence,
        }
    }
}

/// Discovery engine section.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_window")]
    pub window_minutes: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,
    #[serde(default = "default_edges")]
    pub max_edges_per_pair: usize,
    #[serde(default = "default_catalog_limit")]
    pub catalog_count_limit: usize,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            window_minutes: default_window(),
            min_confidence: default_min_confidence(),
            identifier_pattern: default_identifier_pattern(),
            max_edges_per_pair: default_edges(),
            catalog_count_limit: default_catalog_limit(),
        }
    }
}

fn default_window() -> u32 {
    60
}

fn default_identifier_pattern() -> String {
    r"(?i)(^|[._])(id|guid|name)$".to_string()
}

fn default_edges() -> usize {
    3
}

fn default_catalog_limit() -> usize {
    25
}

impl DiscoverySection {
    pub fn engine_config(&self, quality: QualityWeights) -> DiscoveryConfig {
        DiscoveryConfig {
            min_confidence: self.min_confidence,
            window_minutes: self.window_minutes,
            identifier_pattern: self.identifier_pattern.clone(),
            max_edges_per_pair: self.max_edges_per_pair,
            catalog_count_limit: self.catalog_count_limit,
            quality_weights: quality,
        }
    }
}

/// Retry section.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_jitter() -> bool {
    true
}

impl RetrySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.max_attempts)
            .initial_delay(std::time::Duration::from_millis(self.initial_delay_ms))
            .max_delay(std::time::Duration::from_secs(self.max_delay_secs))
            .jitter(self.jitter)
    }
}

/// Circuit breaker section.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl BreakerSection {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: std::time::Duration::from_secs(self.cooldown_secs),
        }
    }
}

/// Rate limiter section.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill(),
        }
    }
}

fn default_capacity() -> f64 {
    20.0
}

fn default_refill() -> f64 {
    5.0
}

impl RateLimitSection {
    pub fn ratelimit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
        }
    }
}

impl HuginnConfig {
    /// Load from the standard TOML locations, falling back to defaults
    /// when no file exists.
    #[cfg(feature = "server")]
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(HuginnError::Configuration(format!(
                        "config file not found: {path:?}"
                    )));
                }
                Some(path.to_path_buf())
            }
            None => {
                let user = dirs::home_dir().map(|home| home.join(".huginn").join("config.toml"));
                let system = std::path::PathBuf::from("/etc/huginn/config.toml");
                user.filter(|p| p.exists())
                    .or_else(|| system.exists().then_some(system))
            }
        };
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    HuginnError::Configuration(format!("failed to read {path:?}: {e}"))
                })?;
                toml::from_str(&content).map_err(|e| {
                    HuginnError::Configuration(format!("failed to parse {path:?}: {e}"))
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay the environment contract onto the loaded file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(env::API_KEY) {
            self.backend.api_key = Some(key);
        }
        if let Ok(account) = std::env::var(env::ACCOUNT) {
            if let Ok(id) = account.parse() {
                self.backend.account = id;
            }
        }
        if let Ok(region) = std::env::var(env::REGION) {
            self.backend.region = region;
        }
        if let Ok(transport) = std::env::var(env::TRANSPORT) {
            self.server.transport = transport;
        }
        if let Ok(port) = std::env::var(env::PORT) {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(url) = std::env::var(env::CACHE_URL) {
            self.cache.url = Some(url);
        }
        if let Ok(level) = std::env::var(env::LOG_LEVEL) {
            self.server.log_level = level;
        }
    }

    /// The API key, which must come from the file or the environment.
    pub fn api_key(&self) -> Result<String> {
        self.backend
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                HuginnError::Configuration(format!(
                    "no backend API key; set {} or [backend] api_key",
                    env::API_KEY
                ))
            })
    }
}
