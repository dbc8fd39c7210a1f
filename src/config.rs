use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "TALES";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub ui: UIConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    crate::platform::API_BASE.to_string()
}

fn default_user_agent() -> String {
    format!("tales-tui/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Cap on how many cards stay resident in the window.
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,
    /// How many cached feed contexts stay constructed.
    #[serde(default = "default_page_cache_size")]
    pub page_cache_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_window_size: default_max_window_size(),
            page_cache_size: default_page_cache_size(),
        }
    }
}

fn default_max_window_size() -> usize {
    30
}

fn default_page_cache_size() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: Option<PathBuf>,
    /// Unset means the 30-day default, resolved at startup; `None` here keeps
    /// a file-set value distinguishable from "never configured" when configs
    /// merge.
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            retention: None,
        }
    }
}

fn default_history_path() -> Option<PathBuf> {
    crate::history::default_path()
}

pub fn default_history_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
        }
    }
}

fn default_theme() -> String {
    "default".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix)?);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.platform.base_url.is_empty() {
        base.platform.base_url = other.platform.base_url;
    }
    if !other.platform.user_agent.is_empty() {
        base.platform.user_agent = other.platform.user_agent;
    }

    if other.feed.max_window_size != 0 {
        base.feed.max_window_size = other.feed.max_window_size;
    }
    if other.feed.page_cache_size != 0 {
        base.feed.page_cache_size = other.feed.page_cache_size;
    }

    if other.history.path.is_some() {
        base.history.path = other.history.path;
    }
    if other.history.retention.is_some() {
        base.history.retention = other.history.retention;
    }

    if !other.ui.theme.is_empty() {
        base.ui.theme = other.ui.theme;
    }

    base
}

fn load_env(prefix: &str) -> Result<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    if map.is_empty() {
        return Ok(Config::default());
    }

    let mut cfg = Config::default();

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "platform.base_url" => cfg.platform.base_url = value,
        "platform.user_agent" => cfg.platform.user_agent = value,
        "feed.max_window_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.max_window_size = parsed;
            }
        }
        "feed.page_cache_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.page_cache_size = parsed;
            }
        }
        "history.path" => cfg.history.path = Some(PathBuf::from(value)),
        "history.retention" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.history.retention = Some(duration);
            }
        }
        "ui.theme" => cfg.ui.theme = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tales-tui").join("config.yaml"))
}
