//! Configuration types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Token pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long to wait for a busy matching token to be released.
    #[serde(with = "millis")]
    pub match_timeout: Duration,
    /// How long to wait for a matching token to register when none exists.
    #[serde(with = "millis")]
    pub no_match_timeout: Duration,
    /// Tokens not touched within this duration are invalidated (`None` = never).
    #[serde(with = "opt_millis")]
    pub keepalive_timeout: Option<Duration>,
    /// Interval of the keepalive sweep.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            match_timeout: Duration::from_secs(60),
            no_match_timeout: Duration::from_secs(10),
            keepalive_timeout: None,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Client-side file cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    /// Root directory of the versioned file cache.
    pub cache_dir: PathBuf,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("grid-filecache"),
        }
    }
}

/// Worker (agent) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Id the agent registers its tokens under.
    pub agent_id: String,
    /// Number of tokens the agent offers to the pool.
    pub token_count: usize,
    /// Attributes advertised by every token of this agent.
    pub attributes: BTreeMap<String, String>,
    /// Call timeout applied when the input message does not carry one.
    #[serde(with = "millis")]
    pub default_call_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            token_count: 1,
            attributes: BTreeMap::new(),
            default_call_timeout: Duration::from_secs(180),
        }
    }
}

/// Grid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub pool: PoolConfig,
    pub files: FileCacheConfig,
    pub agent: AgentConfig,
}

impl GridConfig {
    /// Load defaults, then overlay `GRID_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("GRID_MATCH_TIMEOUT_MS")? {
            config.pool.match_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("GRID_NO_MATCH_TIMEOUT_MS")? {
            config.pool.no_match_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("GRID_KEEPALIVE_TIMEOUT_MS")? {
            config.pool.keepalive_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("GRID_SWEEP_INTERVAL_MS")? {
            config.pool.sweep_interval = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("GRID_FILE_CACHE_DIR") {
            config.files.cache_dir = PathBuf::from(dir);
        }
        if let Ok(id) = std::env::var("GRID_AGENT_ID") {
            config.agent.agent_id = id;
        }
        if let Some(count) = env_parse::<usize>("GRID_AGENT_TOKENS")? {
            config.agent.token_count = count;
        }
        if let Ok(attrs) = std::env::var("GRID_AGENT_ATTRIBUTES") {
            config.agent.attributes = parse_attributes(&attrs)?;
        }
        if let Some(ms) = env_parse::<u64>("GRID_CALL_TIMEOUT_MS")? {
            config.agent.default_call_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse `key=value,key=value` into an attribute map.
fn parse_attributes(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "GRID_AGENT_ATTRIBUTES".to_string(),
                    message: format!("expected key=value, got `{pair}`"),
                })
        })
        .collect()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}
