//! Retouch Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const API_KEY_ENV: &str = "RETOUCH_API_KEY";

const DEFAULT_PROMPT_PREFIX: &str = "Edit the attached image instead of generating a new one. \
Keep the subject, composition, viewpoint and background unchanged and only apply the requested changes.";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub onebot: Option<OneBotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: None,
            log_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_prompt_prefix")]
    pub prompt_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Delay after a non-200 answer before the next attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Delay after a timeout or connection failure.
    #[serde(default = "default_transport_retry_delay_ms")]
    pub transport_retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            model_id: default_model_id(),
            api_key: String::new(),
            prompt_prefix: default_prompt_prefix(),
            timeout_secs: default_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            transport_retry_delay_ms: default_transport_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupControlMode {
    #[default]
    Off,
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub group_control_mode: GroupControlMode,
    #[serde(default)]
    pub group_list: Vec<String>,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,
    #[serde(default = "default_rate_limit_max_calls")]
    pub rate_limit_max_calls: u32,
    #[serde(default)]
    pub admin_users: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            group_control_mode: GroupControlMode::Off,
            group_list: Vec::new(),
            rate_limit_enabled: true,
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
            rate_limit_max_calls: default_rate_limit_max_calls(),
            admin_users: Vec::new(),
        }
    }
}

impl AccessConfig {
    pub fn is_admin(&self, user_id: &str) -> bool {
        let user_id = user_id.trim();
        !user_id.is_empty() && self.admin_users.iter().any(|admin| admin.trim() == user_id)
    }
}

/// How chatty the bot is while a task runs. Unknown values read as `Minimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusMessageMode {
    Verbose,
    #[default]
    Minimal,
    Silent,
}

impl StatusMessageMode {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "verbose" => Self::Verbose,
            "silent" => Self::Silent,
            _ => Self::Minimal,
        }
    }
}

impl<'de> Deserialize<'de> for StatusMessageMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub status_message_mode: StatusMessageMode,
    #[serde(default = "default_max_images_per_response")]
    pub max_images_per_response: usize,
    #[serde(default)]
    pub save_image_enabled: bool,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            status_message_mode: StatusMessageMode::Minimal,
            max_images_per_response: default_max_images_per_response(),
            save_image_enabled: false,
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RelayConfig {
    /// Host and port, when both are set.
    pub fn target(&self) -> Option<(String, u16)> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let port = self.port.filter(|p| *p != 0)?;
        Some((host.to_string(), port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneBotConfig {
    pub api_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_true() -> bool {
    true
}

fn default_server_url() -> String {
    "https://api.x.ai".to_string()
}

fn default_model_id() -> String {
    "grok-imagine-0.9".to_string()
}

fn default_prompt_prefix() -> String {
    DEFAULT_PROMPT_PREFIX.to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_transport_retry_delay_ms() -> u64 {
    1000
}

fn default_rate_limit_window_seconds() -> u64 {
    3600
}

fn default_rate_limit_max_calls() -> u32 {
    5
}

fn default_max_images_per_response() -> usize {
    4
}

fn default_delivery_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(std::env::var(API_KEY_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses and normalizes without touching the environment or validating.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("retouch").join("config.toml"))
    }

    fn normalize(&mut self) {
        self.api.server_url = self.api.server_url.trim().trim_end_matches('/').to_string();
        self.api.prompt_prefix = self.api.prompt_prefix.trim().to_string();
        self.api.api_key = self.api.api_key.trim().to_string();
    }

    pub fn apply_env_overrides(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.map(|k| k.trim().to_string()) {
            if !key.is_empty() {
                self.api.api_key = key;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let server_url = self.api.server_url.as_str();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            anyhow::bail!("api.server_url must be an http(s) URL, got '{}'", server_url);
        }
        if self.api.model_id.trim().is_empty() {
            anyhow::bail!("api.model_id cannot be empty");
        }
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs must be greater than 0");
        }
        if self.api.max_retry_attempts == 0 {
            anyhow::bail!("api.max_retry_attempts must be at least 1");
        }
        if self.access.rate_limit_enabled {
            if self.access.rate_limit_window_seconds == 0 {
                anyhow::bail!("access.rate_limit_window_seconds must be greater than 0");
            }
            if self.access.rate_limit_max_calls == 0 {
                anyhow::bail!("access.rate_limit_max_calls must be greater than 0");
            }
        }
        if self.output.max_images_per_response == 0 {
            anyhow::bail!("output.max_images_per_response must be at least 1");
        }
        let relay_host = self
            .relay
            .host
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        if !relay_host.is_empty() && self.relay.port.unwrap_or(0) == 0 {
            anyhow::bail!("relay.host '{}' is set but relay.port is missing", relay_host);
        }
        if let Some(onebot) = &self.onebot {
            if onebot.api_url.trim().is_empty() {
                anyhow::bail!("onebot.api_url cannot be empty");
            }
        }
        self.api_endpoint()?;
        Ok(())
    }

    /// `<server_url>/v1/chat/completions`
    pub fn api_endpoint(&self) -> anyhow::Result<String> {
        let base = url::Url::parse(&format!("{}/", self.api.server_url))?;
        Ok(base.join("v1/chat/completions")?.to_string())
    }

    /// `core.data_dir` with `~` expanded, else the platform data directory.
    pub fn data_dir(&self) -> PathBuf {
        match self
            .core
            .data_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
        {
            Some("~") => home_dir(),
            Some(dir) if dir.starts_with("~/") => home_dir().join(&dir[2..]),
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join("retouch"))
                .unwrap_or_else(|| PathBuf::from(".retouch")),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir().join("images")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }
}
