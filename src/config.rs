//! Configuration: per-client numeric knobs and the demo binary's config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Request budget in bytes. Tool definitions and tool results may use half.
pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 5120;
/// Initial capacity reserved for response bodies.
pub const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum silence between two stream lines.
pub const DEFAULT_STREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);
/// Read granularity of the streaming transport.
pub const DEFAULT_STREAM_READ_CHUNK: usize = 512;

/// Runtime knobs of one [`crate::AiClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub request_buffer_size: usize,
    pub response_buffer_size: usize,
    pub http_timeout: Duration,
    pub stream_chunk_timeout: Duration,
    pub stream_read_chunk: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_buffer_size: DEFAULT_REQUEST_BUFFER_SIZE,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER_SIZE,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            stream_chunk_timeout: DEFAULT_STREAM_CHUNK_TIMEOUT,
            stream_read_chunk: DEFAULT_STREAM_READ_CHUNK,
        }
    }
}

impl ClientOptions {
    /// Byte budget shared by tool definitions and tool results.
    pub fn tool_budget(&self) -> usize {
        self.request_buffer_size / 2
    }
}

// --- Demo binary configuration ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ai: AiConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub platform: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub system_role: Option<String>,
}

fn default_api_key_env() -> String {
    "AI_CONNECT_API_KEY".to_string()
}

/// Transport and buffer settings, mapped onto [`ClientOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_request_buffer_size")]
    pub request_buffer_size: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_stream_chunk_timeout_ms")]
    pub stream_chunk_timeout_ms: u64,
    /// PEM file used as the only trust anchor. Unset means insecure TLS.
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
}

fn default_request_buffer_size() -> usize {
    DEFAULT_REQUEST_BUFFER_SIZE
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT.as_secs()
}

fn default_stream_chunk_timeout_ms() -> u64 {
    DEFAULT_STREAM_CHUNK_TIMEOUT.as_millis() as u64
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_buffer_size: default_request_buffer_size(),
            http_timeout_secs: default_http_timeout_secs(),
            stream_chunk_timeout_ms: default_stream_chunk_timeout_ms(),
            root_ca_path: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ai: AiConfig {
                platform: "openai".to_string(),
                model: "gpt-4.1-mini".to_string(),
                endpoint: None,
                api_key: None,
                api_key_env: default_api_key_env(),
                system_role: None,
            },
            client: ClientConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".ai-connect").join("config.toml"))
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(platform) = std::env::var("AI_CONNECT_PLATFORM") {
            self.ai.platform = platform;
        }
        if let Ok(model) = std::env::var("AI_CONNECT_MODEL") {
            self.ai.model = model;
        }
        if let Ok(endpoint) = std::env::var("AI_CONNECT_ENDPOINT") {
            self.ai.endpoint = Some(endpoint);
        }
    }

    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = &self.ai.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        std::env::var(&self.ai.api_key_env).with_context(|| {
            format!(
                "API key not found. Either:\n  \
                 1. Set api_key in config file: {}\n  \
                 2. Set environment variable: export {}=your-key",
                Self::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                self.ai.api_key_env
            )
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_buffer_size: self.client.request_buffer_size,
            http_timeout: Duration::from_secs(self.client.http_timeout_secs),
            stream_chunk_timeout: Duration::from_millis(self.client.stream_chunk_timeout_ms),
            ..ClientOptions::default()
        }
    }

    /// Read the configured root CA, if any.
    pub fn root_ca_pem(&self) -> Result<Option<String>> {
        match &self.client.root_ca_path {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("Failed to read root CA: {}", path.display())),
            None => Ok(None),
        }
    }

    pub fn save_default() -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        Self::default().save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}
