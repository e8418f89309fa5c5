use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    cache::CacheGateway,
    classify::MergePolicy,
    fetch::{RetryPolicy, PAGE_PAUSE},
};

fn default_timezone() -> String {
    "UTC".to_owned()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct MergeConfig {
    pub tolerance_secs: i64,
    pub kind_prefix_len: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: 2,
            kind_prefix_len: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SourceConfig {
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub api_key: Option<String>,
    /// Account opening date, the first quarter to fetch
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub since: Option<NaiveDate>,
    #[serde(skip)]
    pub full_path: PathBuf,
}

impl SourceConfig {
    pub(crate) fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.source_type } else { &self.name }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            timezone: default_timezone(),
            merge: MergeConfig::default(),
            retry: RetryConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration, resolving relative paths against the
    /// directory of the configuration file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;

        let base_dir = path.parent().unwrap_or(Path::new(""));
        for source in config.sources.iter_mut().filter(|source| !source.path.is_empty()) {
            source.full_path = base_dir.join(&source.path);
        }
        config.cache_dir = config.cache_dir.map(|dir| base_dir.join(dir));

        Ok(config)
    }

    pub(crate) fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid timezone {:?}: {}", self.timezone, err))
    }

    pub(crate) fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            tolerance: chrono::Duration::seconds(self.merge.tolerance_secs),
            kind_prefix_len: self.merge.kind_prefix_len,
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
        }
    }
}

/// Everything a source run needs besides its own configuration.
pub(crate) struct Settings {
    pub cache: CacheGateway,
    pub retry: RetryPolicy,
    pub merge: MergePolicy,
    pub timezone: Tz,
    pub now: NaiveDateTime,
    pub page_pause: Duration,
}

impl Settings {
    pub(crate) fn from_config(config: &Config, now: NaiveDateTime) -> Result<Self> {
        let cache = match config.cache_dir.clone().or_else(CacheGateway::default_dir) {
            Some(dir) => {
                info!("Using cache directory {}", dir.display());
                CacheGateway::open(dir)
            }
            None => CacheGateway::disabled(),
        };
        if !cache.is_enabled() {
            warn!("Running without cache, every page will be fetched");
        }

        Ok(Self {
            cache,
            retry: config.retry_policy(),
            merge: config.merge_policy(),
            timezone: config.timezone()?,
            now,
            page_pause: PAGE_PAUSE,
        })
    }
}
