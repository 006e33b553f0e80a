//! # Configuration Management
//!
//! This module handles loading and managing the relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `DASHSCOPE_API_KEY` environment variables
//! 2. Environment variables with `APP_` prefix, `__` between levels
//!    (`APP_UPSTREAM__MODEL`, `APP_SERVER__WS_PATH`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::{bail, Result};           // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                         // For reading environment variables
use std::time::Duration;

/// Fixed DashScope realtime inference endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference/";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, upstream, performance, playback)
/// keeps each concern readable and lets `update_from_json` touch one group at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: RunMode,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub performance: PerformanceConfig,
    pub playback: PlaybackConfig,
}

/// How the process runs.
///
/// - `serve`: accept WebSocket clients and relay each one (default)
/// - `playback`: relay one local audio file, log the results, and exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Serve,
    Playback,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host` / `port`: where the HTTP server binds
/// - `ws_path`: path that accepts the WebSocket upgrade for audio clients
/// - `allowed_origins`: browser origins allowed to connect; `["*"]` allows any
/// - `heartbeat_interval_secs`: how often the server pings connected clients
/// - `client_timeout_secs`: how long a client may stay silent before it is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Upstream recognition service settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the recognition service
/// - `api_key`: bearer token, read from `DASHSCOPE_API_KEY`; never serialized
/// - `data_inspection`: send the `X-DashScope-DataInspection: enable` opt-in header
/// - `model`, `format`, `sample_rate`, `language_hints`: `run-task` parameters
/// - `vocabulary_id`, `disfluency_removal_enabled`: optional `run-task` parameters
/// - `task_start_timeout_secs`: how long to wait for `task-started`
/// - `finish_timeout_secs`: how long to wait for `task-finished` after input runs out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub data_inspection: bool,
    pub model: String,
    pub format: String,
    pub sample_rate: u32,
    pub language_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disfluency_removal_enabled: Option<bool>,
    pub task_start_timeout_secs: u64,
    pub finish_timeout_secs: u64,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: upper bound on simultaneously relayed clients
/// - `audio_queue_capacity`: audio frames buffered between a client socket and its session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub audio_queue_capacity: usize,
}

/// Offline playback settings (used when `mode = "playback"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub file: String,
    pub chunk_size: usize,
    pub chunk_interval_ms: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values let the relay start with nothing but `DASHSCOPE_API_KEY` set,
/// and document reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Serve,
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                ws_path: "/ws".to_string(),
                allowed_origins: vec!["*".to_string()],
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            upstream: UpstreamConfig {
                url: DEFAULT_UPSTREAM_URL.to_string(),
                api_key: String::new(),
                data_inspection: true,
                model: "paraformer-realtime-v2".to_string(),
                format: "pcm".to_string(),
                sample_rate: 16000,
                language_hints: vec!["zh".to_string()],
                vocabulary_id: None,
                disfluency_removal_enabled: None,
                task_start_timeout_secs: 60,
                finish_timeout_secs: 10,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                audio_queue_capacity: 64,
            },
            playback: PlaybackConfig {
                file: "asr_example_16k.pcm".to_string(),
                chunk_size: 1024,
                chunk_interval_ms: 20,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle `HOST`, `PORT` and `DASHSCOPE_API_KEY` directly
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__WS_PATH=/asr`: Override the WebSocket path
    /// - `APP_UPSTREAM__LANGUAGE_HINTS=zh,en`: Comma-separated list
    /// - `APP_MODE=playback`: Run the offline playback client
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .with_list_parse_key("upstream.language_hints")
                    .try_parsing(true),
            );

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("DASHSCOPE_API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 and the WebSocket path is absolute
    /// - Upstream URL is a ws:// or wss:// URL
    /// - `run-task` parameters are present (model, format, sample rate)
    /// - Timeouts, capacities and playback chunk size are positive
    ///
    /// The API key is checked separately by [`AppConfig::require_api_key`] so that
    /// the defaults stay valid on machines without credentials.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        if !self.server.ws_path.starts_with('/') {
            bail!("WebSocket path must start with '/': {}", self.server.ws_path);
        }

        if self.server.heartbeat_interval_secs == 0 || self.server.client_timeout_secs == 0 {
            bail!("Heartbeat interval and client timeout must be greater than 0");
        }

        let url = &self.upstream.url;
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            bail!("Upstream URL must use ws:// or wss://: {}", url);
        }

        if self.upstream.model.trim().is_empty() {
            bail!("Upstream model cannot be empty");
        }

        if self.upstream.format.trim().is_empty() {
            bail!("Upstream audio format cannot be empty");
        }

        if self.upstream.sample_rate == 0 {
            bail!("Upstream sample rate must be greater than 0");
        }

        if self.upstream.task_start_timeout_secs == 0 || self.upstream.finish_timeout_secs == 0 {
            bail!("Upstream timeouts must be greater than 0");
        }

        if self.performance.max_concurrent_sessions == 0 {
            bail!("Max concurrent sessions must be greater than 0");
        }

        if self.performance.audio_queue_capacity == 0 {
            bail!("Audio queue capacity must be greater than 0");
        }

        if self.playback.chunk_size == 0 {
            bail!("Playback chunk size must be greater than 0");
        }

        Ok(())
    }

    /// Fail unless an upstream API key is configured.
    ///
    /// Called once at startup; a missing key stops the process before it listens or dials.
    pub fn require_api_key(&self) -> Result<()> {
        if self.upstream.api_key.trim().is_empty() {
            bail!("DASHSCOPE_API_KEY is not set; check the environment or .env file");
        }
        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only recognition parameters and the session limit can change at runtime.
    /// For example, `{"upstream": {"language_hints": ["en"]}}` switches new sessions
    /// to English; sessions already running keep the parameters they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(model) = upstream.get("model").and_then(|v| v.as_str()) {
                self.upstream.model = model.to_string();
            }
            if let Some(rate) = upstream.get("sample_rate").and_then(|v| v.as_u64()) {
                self.upstream.sample_rate = u32::try_from(rate)?;
            }
            if let Some(hints) = upstream.get("language_hints").and_then(|v| v.as_array()) {
                self.upstream.language_hints = hints
                    .iter()
                    .filter_map(|hint| hint.as_str().map(str::to_string))
                    .collect();
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl UpstreamConfig {
    pub fn task_start_timeout(&self) -> Duration {
        Duration::from_secs(self.task_start_timeout_secs)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }
}

impl PlaybackConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The defaults are valid and match the upstream's documented parameters.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.mode, RunMode::Serve);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.upstream.url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.upstream.sample_rate, 16000);
        assert_eq!(config.upstream.language_hints, vec!["zh".to_string()]);
        assert_eq!(config.upstream.task_start_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.url = "https://dashscope.aliyuncs.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.ws_path = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.playback.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_required() {
        let mut config = AppConfig::default();
        assert!(config.require_api_key().is_err());

        config.upstream.api_key = "   ".to_string();
        assert!(config.require_api_key().is_err());

        config.upstream.api_key = "sk-test".to_string();
        assert!(config.require_api_key().is_ok());
    }

    /// The API key must never end up in serialized output (config endpoint, logs of defaults).
    #[test]
    fn test_api_key_not_serialized() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "sk-secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("api_key"));
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"language_hints": ["en", "ja"], "sample_rate": 8000}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.upstream.language_hints, vec!["en".to_string(), "ja".to_string()]);
        assert_eq!(config.upstream.sample_rate, 8000);
        // Untouched fields stay as they were
        assert_eq!(config.upstream.model, "paraformer-realtime-v2");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"upstream": {"model": ""}}"#).is_err());
        assert!(config
            .update_from_json(r#"{"performance": {"max_concurrent_sessions": 0}}"#)
            .is_err());
    }
}
