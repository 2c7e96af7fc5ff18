//! Configuration types for kvtree components

use crate::{KvTreeError, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Aggregate configuration for a serving session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvTreeConfig {
    /// Prefix cache configuration
    pub cache: CacheConfig,
    /// Page pool configuration
    pub pool: PoolConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Prefix cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Matching/splitting granularity in tokens
    pub page_size: usize,
    /// Maximum number of pages the tree may hold once eviction has run
    pub capacity: usize,
    /// Global bypass switch
    pub enabled: bool,
    /// Victim ordering used by eviction
    pub eviction_policy: EvictionPolicyKind,
    /// Merge an unlocked single-child parent into its child after eviction
    pub compact_on_evict: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 1,
            capacity: 16384,
            enabled: true,
            eviction_policy: EvictionPolicyKind::Lru,
            compact_on_evict: false,
        }
    }
}

impl CacheConfig {
    /// Config with the given page size and capacity, everything else default
    pub fn new(page_size: usize, capacity: usize) -> Self {
        Self {
            page_size,
            capacity,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact_on_evict = compact;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(KvTreeError::config("Page size must be at least 1"));
        }
        if self.capacity == 0 {
            return Err(KvTreeError::config("Cache capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Eviction policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    /// Least recently used first, larger nodes first on ties
    Lru,
    /// Least frequently hit first
    Lfu,
    /// Oldest insertion first
    Fifo,
    /// Largest node first
    Largest,
}

impl FromStr for EvictionPolicyKind {
    type Err = KvTreeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            "largest" => Ok(Self::Largest),
            other => Err(KvTreeError::config(format!(
                "Eviction policy must be one of: lru, lfu, fifo, largest (got {})",
                other
            ))),
        }
    }
}

impl fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
            Self::Largest => "largest",
        };
        f.write_str(name)
    }
}

/// Page pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of pages the pool can hand out
    pub max_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_pages: 16384 }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum requests admitted into one prefill batch
    pub max_batch_size: usize,
    /// Maximum newly cached (unmatched) tokens admitted per tick
    pub max_tokens_cached: usize,
    /// Maximum waiting queue size
    pub max_waiting_requests: usize,
    /// Admission ordering
    pub policy: SchedulePolicy,
    /// Requests older than this are aborted by `abort_expired`
    pub request_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_tokens_cached: 8192,
            max_waiting_requests: 1024,
            policy: SchedulePolicy::Lpm,
            request_timeout_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(KvTreeError::config("Max batch size must be greater than 0"));
        }
        if self.max_tokens_cached == 0 {
            return Err(KvTreeError::config(
                "Max tokens cached must be greater than 0",
            ));
        }
        if self.max_waiting_requests == 0 {
            return Err(KvTreeError::config(
                "Max waiting requests must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Admission ordering policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// Longest prefix match first, queue order on ties
    Lpm,
    /// First-come-first-served
    Fcfs,
}

impl FromStr for SchedulePolicy {
    type Err = KvTreeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lpm" => Ok(Self::Lpm),
            "fcfs" => Ok(Self::Fcfs),
            other => Err(KvTreeError::config(format!(
                "Schedule policy must be one of: lpm, fcfs (got {})",
                other
            ))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, what: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| KvTreeError::config(format!("Invalid {}: {}", what, raw))),
        Err(_) => Ok(None),
    }
}

impl KvTreeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Cache configuration
        if let Some(page_size) = env_parse("KVTREE_PAGE_SIZE", "page size")? {
            config.cache.page_size = page_size;
        }
        if let Some(capacity) = env_parse("KVTREE_CAPACITY", "cache capacity")? {
            config.cache.capacity = capacity;
        }
        if let Some(enabled) = env_parse("KVTREE_CACHE_ENABLED", "cache enabled flag")? {
            config.cache.enabled = enabled;
        }
        if let Ok(policy) = std::env::var("KVTREE_EVICTION_POLICY") {
            config.cache.eviction_policy = policy.parse()?;
        }

        // Pool configuration
        if let Some(max_pages) = env_parse("KVTREE_POOL_PAGES", "pool size")? {
            config.pool.max_pages = max_pages;
        }

        // Scheduler configuration
        if let Some(batch) = env_parse("KVTREE_MAX_BATCH_SIZE", "max batch size")? {
            config.scheduler.max_batch_size = batch;
        }
        if let Some(budget) = env_parse("KVTREE_MAX_TOKENS_CACHED", "max tokens cached")? {
            config.scheduler.max_tokens_cached = budget;
        }
        if let Ok(policy) = std::env::var("KVTREE_SCHEDULE_POLICY") {
            config.scheduler.policy = policy.parse()?;
        }
        if let Some(timeout) = env_parse("KVTREE_REQUEST_TIMEOUT_SECS", "request timeout")? {
            config.scheduler.request_timeout_secs = Some(timeout);
        }

        // Logging configuration
        if let Ok(level) = std::env::var("KVTREE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("KVTREE_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KvTreeError::config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.scheduler.validate()?;

        if self.pool.max_pages == 0 {
            return Err(KvTreeError::config("Pool size must be greater than 0"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(KvTreeError::config(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }
        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err(KvTreeError::config("Log format must be one of: json, pretty"));
        }

        Ok(())
    }
}
