//! Configuration module for `gudgeon`.
//!
//! Defines the structure and default values for the proxy's configuration.
//! Uses `serde` for deserialization and `toml` for the file format.
//!
//! # Example Config
//! ```toml
//! home = "/var/lib/gudgeon"
//!
//! [storage]
//! rules = "memory"
//! cache = true
//!
//! [[groups]]
//! name = "default"
//! lists = ["ads"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

/// Main configuration struct holding all settings for the DNS proxy.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Base directory for session and list data.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// Rule store and cache backends.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Global TTL bounds and default block response.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listener configuration.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Named upstream source bundles.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Named resolvers composing sources.
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,

    /// Allow/block lists.
    #[serde(default)]
    pub lists: Vec<ListConfig>,

    /// Consumer groups bundling lists and resolvers.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Client-address policy buckets.
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,

    /// Query logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Statistics collection configuration.
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Backend selection for the rule store and query cache.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Rule store backend: one of `memory`, `hash`, `hash32`, `bloom`,
    /// `sqlite`, `bloom+sqlite`, `hash+sqlite`, `hash32+sqlite`.
    #[serde(default = "default_rule_store")]
    pub rules: String,

    /// Whether the query cache is enabled.
    #[serde(default = "default_cache_enable")]
    pub cache: bool,

    /// Maximum cached entries per group.
    #[serde(default = "default_cache_entries")]
    pub cache_entries: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GlobalConfig {
    /// Ceiling applied to response TTLs before caching.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,

    /// Floor applied to response TTLs before caching.
    #[serde(default)]
    pub min_ttl: u32,

    /// Default block response: `nxdomain`, `endpoint`, or a literal IP.
    #[serde(default = "default_block_response")]
    pub block_response: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// Serve TCP.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Serve UDP.
    #[serde(default = "default_true")]
    pub udp: bool,

    /// Listener endpoints.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InterfaceConfig {
    pub ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// A named bundle of upstream endpoint specifications, e.g.
/// `["8.8.8.8", "1.1.1.1:853/tcp-tls"]`. Referenced from resolvers by name.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub spec: Vec<String>,
    #[serde(default)]
    pub balance: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    pub name: String,

    /// Inline endpoint specifications, tried in order.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// References to named sources or other resolvers.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Globs restricting which query names this resolver handles.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Suffixes appended to single-label queries on empty results.
    #[serde(default)]
    pub search: Vec<String>,

    /// Rotate the source start index per query instead of walking in order.
    #[serde(default)]
    pub balance: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListConfig {
    pub name: String,

    /// `allow` or `block`.
    #[serde(default = "default_list_type", rename = "type")]
    pub kind: String,

    /// Path of the list file on disk. When empty the list is looked up at
    /// `<home>/lists/<canonical>.list`.
    #[serde(default)]
    pub src: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl ListConfig {
    /// Stable identity combining the owning group and list name, used for
    /// filesystem and store keys.
    pub fn canonical_name(&self, group: &str) -> String {
        format!("{}/{}", group, self.name)
    }

    /// On-disk location of the raw list text.
    pub fn path(&self, group: &str, home: &Path) -> PathBuf {
        if self.src.is_empty() {
            home.join("lists")
                .join(format!("{}.list", self.canonical_name(group).replace('/', "_")))
        } else {
            PathBuf::from(&self.src)
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GroupConfig {
    pub name: String,

    /// Resolver names queried in order. Empty falls back to `default`.
    #[serde(default)]
    pub resolvers: Vec<String>,

    /// Lists selected by name.
    #[serde(default)]
    pub lists: Vec<String>,

    /// Lists selected by tag.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides `global.block_response` for this group.
    #[serde(default)]
    pub block_response: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsumerConfig {
    pub name: String,

    /// Group names, in order, applied to matched clients.
    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub matches: Vec<MatchConfig>,

    /// Short-circuit every query from this consumer to a blocked response.
    #[serde(default)]
    pub block: bool,
}

/// One address matcher; exactly one of the fields should be set.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MatchConfig {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub range: Option<RangeConfig>,
    #[serde(default)]
    pub net: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RangeConfig {
    pub start: String,
    pub end: String,
}

/// Configuration for query logging.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Global switch to enable/disable query logging.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Whether to log blocked queries.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Whether to log all queries (allowed & blocked).
    #[serde(default = "default_true")]
    pub log_all_queries: bool,

    /// Format of the logs (`text` or `json`).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level passed to the tracing filter.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Configuration for metrics and statistics.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Interval in seconds for dumping stats to logs.
    #[serde(default = "default_stats_interval")]
    pub log_interval_seconds: u64,
}

/// Parsed form of a `block_response` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResponse {
    NxDomain,
    Endpoint,
    Literal(IpAddr),
}

impl FromStr for BlockResponse {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "nxdomain" => Ok(Self::NxDomain),
            "endpoint" => Ok(Self::Endpoint),
            other => {
                let ip: IpAddr = other
                    .parse()
                    .with_context(|| format!("unrecognized block response '{}'", s))?;
                Ok(Self::Literal(ip))
            }
        }
    }
}

// Defaults
fn default_home() -> PathBuf {
    PathBuf::from("./.gudgeon")
}
fn default_rule_store() -> String {
    "memory".to_string()
}
fn default_cache_enable() -> bool {
    true
}
fn default_cache_entries() -> u64 {
    20_000
}
fn default_max_ttl() -> u32 {
    86_400
}
fn default_block_response() -> String {
    "nxdomain".to_string()
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    53
}
fn default_interfaces() -> Vec<InterfaceConfig> {
    vec![InterfaceConfig {
        ip: IpAddr::from([127, 0, 0, 1]),
        port: 5354,
    }]
}
fn default_list_type() -> String {
    "block".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_stats_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            storage: StorageConfig::default(),
            global: GlobalConfig::default(),
            network: NetworkConfig::default(),
            sources: Vec::new(),
            resolvers: Vec::new(),
            lists: Vec::new(),
            groups: Vec::new(),
            consumers: Vec::new(),
            logging: LoggingConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rules: default_rule_store(),
            cache: default_cache_enable(),
            cache_entries: default_cache_entries(),
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_ttl: default_max_ttl(),
            min_ttl: 0,
            block_response: default_block_response(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: true,
            interfaces: default_interfaces(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable: true,
            log_blocked: true,
            log_all_queries: true,
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            log_interval_seconds: default_stats_interval(),
        }
    }
}

impl Config {
    /// Loads the configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if the TOML parsing
    /// fails.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }

    /// The group's block response, falling back to the global default.
    pub fn block_response_for(&self, group: &GroupConfig) -> Result<BlockResponse> {
        group
            .block_response
            .as_deref()
            .unwrap_or(&self.global.block_response)
            .parse()
    }
}
