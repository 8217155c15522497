use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_BASE_URL;
use crate::auth::DEFAULT_TOKEN_URL;
use crate::feed::{DEFAULT_PAGE_SIZE, DEFAULT_SENTINEL_THRESHOLD, RECOMMENDED_PAGE_SIZE};
use crate::upload::MIN_THUMBNAIL_WIDTH;

const DEFAULT_ENV_PREFIX: &str = "SCUFFTUBE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_refresh_skew", with = "humantime_serde")]
    pub refresh_skew: Duration,
    /// Fixed bearer token; skips the stored sign-in entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            token_url: default_token_url(),
            refresh_skew: default_refresh_skew(),
            id_token: None,
        }
    }
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.into()
}

fn default_refresh_skew() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_recommended_page_size")]
    pub recommended_page_size: u32,
    #[serde(default = "default_sentinel_threshold")]
    pub sentinel_threshold: f32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            recommended_page_size: default_recommended_page_size(),
            sentinel_threshold: default_sentinel_threshold(),
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_recommended_page_size() -> u32 {
    RECOMMENDED_PAGE_SIZE
}

fn default_sentinel_threshold() -> f32 {
    DEFAULT_SENTINEL_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_min_thumbnail_width")]
    pub min_thumbnail_width: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_thumbnail_width: default_min_thumbnail_width(),
        }
    }
}

fn default_min_thumbnail_width() -> u32 {
    MIN_THUMBNAIL_WIDTH
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.or_else(default_config_path);
    if let Some(path) = path {
        if path.exists() {
            let from_file = read_config_file(&path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix));

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Overlays every value in `other` that differs from the built-in default.
fn merge_config(mut base: Config, other: Config) -> Config {
    let defaults = Config::default();

    if other.api.base_url != defaults.api.base_url && !other.api.base_url.is_empty() {
        base.api.base_url = other.api.base_url;
    }
    if other.api.timeout != defaults.api.timeout {
        base.api.timeout = other.api.timeout;
    }

    if !other.auth.api_key.is_empty() {
        base.auth.api_key = other.auth.api_key;
    }
    if other.auth.token_url != defaults.auth.token_url && !other.auth.token_url.is_empty() {
        base.auth.token_url = other.auth.token_url;
    }
    if other.auth.refresh_skew != defaults.auth.refresh_skew {
        base.auth.refresh_skew = other.auth.refresh_skew;
    }
    if other.auth.id_token.is_some() {
        base.auth.id_token = other.auth.id_token;
    }

    if other.feed.page_size != defaults.feed.page_size && other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    if other.feed.recommended_page_size != defaults.feed.recommended_page_size
        && other.feed.recommended_page_size != 0
    {
        base.feed.recommended_page_size = other.feed.recommended_page_size;
    }
    if other.feed.sentinel_threshold != defaults.feed.sentinel_threshold {
        base.feed.sentinel_threshold = other.feed.sentinel_threshold;
    }

    if other.upload.min_thumbnail_width != defaults.upload.min_thumbnail_width {
        base.upload.min_thumbnail_width = other.upload.min_thumbnail_width;
    }

    base
}

fn load_env(prefix: &str) -> Config {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    let mut cfg = Config::default();
    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "auth.api_key" => cfg.auth.api_key = value,
        "auth.token_url" => cfg.auth.token_url = value,
        "auth.refresh_skew" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.auth.refresh_skew = duration;
            }
        }
        "auth.id_token" => {
            let value = value.trim();
            if !value.is_empty() {
                cfg.auth.id_token = Some(value.to_string());
            }
        }
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.page_size = parsed;
            }
        }
        "feed.recommended_page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.feed.recommended_page_size = parsed;
            }
        }
        "feed.sentinel_threshold" => {
            if let Ok(parsed) = value.parse::<f32>() {
                cfg.feed.sentinel_threshold = parsed.clamp(0.0, 1.0);
            }
        }
        "upload.min_thumbnail_width" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.upload.min_thumbnail_width = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scufftube").join("config.yaml"))
}

/// Writes the identity provider's API key into the config file, keeping
/// everything else that file already holds.
pub fn save_api_key(path: Option<PathBuf>, api_key: &str) -> Result<PathBuf> {
    let api_key = api_key.trim();
    anyhow::ensure!(!api_key.is_empty(), "config: auth.api_key is required");

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };
    cfg.auth.api_key = api_key.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}
