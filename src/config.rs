//! # Configuration Management
//!
//! This module handles loading and managing configuration from multiple sources:
//! - TOML configuration files (turnlink.toml)
//! - Environment variables (with TURNLINK_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (TURNLINK_GATEWAY__WS_BASE_URL, TURNLINK_SERVER__PORT, etc.)
//! 2. Configuration file (turnlink.toml, or the path given with `--config`)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **gateway**: Where the input/output channels and the stop endpoint live
//! - **client**: Timeouts used by the turn client
//! - **audio**: Media type of reassembled audio and capture segment size
//! - **server**: Settings for the loopback gateway (`turnlink serve`)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::time::Duration;
use url::Url;

/// Main configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements Debug, Clone, Serialize, Deserialize
/// - **pub fields**: Public fields that can be accessed directly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub client: ClientConfig,
    pub audio: AudioConfig,
    pub server: ServerConfig,
}

/// Backend endpoint configuration.
///
/// ## Fields:
/// - `ws_base_url`: Origin of both socket channels (e.g. "ws://127.0.0.1:8000")
/// - `http_base_url`: Origin of the out-of-band stop endpoint
/// - `input_path`: Path of the input channel (default "ws/input")
/// - `output_path`: Base path of the output channel; the task id is appended
/// - `stop_path`: Path of the interrupt endpoint (default "control/stop")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ws_base_url: String,
    pub http_base_url: String,
    pub input_path: String,
    pub output_path: String,
    pub stop_path: String,
}

/// Turn client timeouts, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound for opening either socket
    pub connect_timeout_ms: u64,
    /// Upper bound for the task id to arrive before audio segments are sent
    pub task_id_timeout_ms: u64,
    /// Upper bound for the stop request
    pub interrupt_timeout_ms: u64,
    /// Upper bound for `TurnClient::run_until_settled`
    pub turn_timeout_ms: u64,
}

/// Audio handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Media type tagged onto reassembled audio (the backend streams MP3)
    pub media_type: String,
    /// Segment size used when a recording file is split for upload
    pub capture_segment_bytes: usize,
}

/// Loopback gateway settings.
///
/// ## Fields:
/// - `host`/`port`: Where `turnlink serve` listens (port 0 picks a free port)
/// - `audio_chunk_bytes`: Size of each binary audio chunk on the output channel
/// - `heartbeat_interval_secs`/`client_timeout_secs`: WebSocket liveness checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
    pub audio_chunk_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The client can talk to a local gateway on port 8000 with no config file at all,
/// which is also where `turnlink serve` listens by default.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                ws_base_url: "ws://127.0.0.1:8000".to_string(),
                http_base_url: "http://127.0.0.1:8000".to_string(),
                input_path: "ws/input".to_string(),
                output_path: "ws/output".to_string(),
                stop_path: "control/stop".to_string(),
            },
            client: ClientConfig {
                connect_timeout_ms: 5_000,
                task_id_timeout_ms: 10_000,
                interrupt_timeout_ms: 5_000,
                turn_timeout_ms: 60_000,
            },
            audio: AudioConfig {
                media_type: "audio/mpeg".to_string(),
                capture_segment_bytes: 16 * 1024,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
                audio_chunk_bytes: 64 * 1024,   // 64KB chunks, same as the production backend
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

/// Strip leading and trailing slashes from a path segment.
fn normalize_segment(value: &str) -> &str {
    value.trim().trim_matches('/')
}

/// Strip a trailing slash from a base URL.
fn strip_trailing_slash(value: &str) -> &str {
    value.trim().trim_end_matches('/')
}

impl GatewayConfig {
    /// Full URL of the input channel.
    pub fn input_url(&self) -> String {
        format!(
            "{}/{}",
            strip_trailing_slash(&self.ws_base_url),
            normalize_segment(&self.input_path)
        )
    }

    /// Full URL of the output channel for one task.
    pub fn output_url(&self, task_id: &str) -> String {
        format!(
            "{}/{}/{}",
            strip_trailing_slash(&self.ws_base_url),
            normalize_segment(&self.output_path),
            task_id
        )
    }

    /// Full URL of the stop endpoint.
    pub fn stop_url(&self) -> String {
        format!(
            "{}/{}",
            strip_trailing_slash(&self.http_base_url),
            normalize_segment(&self.stop_path)
        )
    }

    /// Route patterns served by the loopback gateway, built from the same paths the
    /// client connects to.
    pub fn input_route(&self) -> String {
        format!("/{}", normalize_segment(&self.input_path))
    }

    pub fn output_route(&self) -> String {
        format!("/{}/{{task_id}}", normalize_segment(&self.output_path))
    }

    pub fn stop_route(&self) -> String {
        format!("/{}", normalize_segment(&self.stop_path))
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn task_id_timeout(&self) -> Duration {
        Duration::from_millis(self.task_id_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from `turnlink.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from the config file (if it exists)
    /// 3. Override with environment variables prefixed with TURNLINK_
    ///
    /// ## Environment Variable Examples:
    /// - `TURNLINK_GATEWAY__WS_BASE_URL=wss://example.org`
    /// - `TURNLINK_CLIENT__CONNECT_TIMEOUT_MS=2000`
    /// - `TURNLINK_SERVER__PORT=9000`
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        // An explicitly named file must exist; the default one is optional
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("turnlink").required(false),
        };

        let settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from the config file
            .add_source(file)
            // 3. Load from environment variables with TURNLINK_ prefix
            .add_source(
                config::Environment::with_prefix("TURNLINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Socket URLs use ws:// or wss://, the stop URL uses http:// or https://
    /// - Timeouts, chunk sizes and the server port are non-zero where required
    /// - The audio media type is not empty
    pub fn validate(&self) -> Result<()> {
        let ws = Url::parse(&self.gateway.ws_base_url)
            .map_err(|e| anyhow::anyhow!("Invalid ws_base_url: {}", e))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(anyhow::anyhow!("ws_base_url must use ws:// or wss://"));
        }

        let http = Url::parse(&self.gateway.http_base_url)
            .map_err(|e| anyhow::anyhow!("Invalid http_base_url: {}", e))?;
        if !matches!(http.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!("http_base_url must use http:// or https://"));
        }

        if normalize_segment(&self.gateway.input_path).is_empty()
            || normalize_segment(&self.gateway.output_path).is_empty()
        {
            return Err(anyhow::anyhow!("Channel paths cannot be empty"));
        }

        if self.client.connect_timeout_ms == 0
            || self.client.task_id_timeout_ms == 0
            || self.client.interrupt_timeout_ms == 0
            || self.client.turn_timeout_ms == 0
        {
            return Err(anyhow::anyhow!("Client timeouts must be greater than 0"));
        }

        if self.audio.media_type.trim().is_empty() {
            return Err(anyhow::anyhow!("Audio media type cannot be empty"));
        }

        if self.audio.capture_segment_bytes == 0 || self.server.audio_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Chunk sizes must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// Validate the loopback gateway section (only needed by `turnlink serve`).
    pub fn validate_server(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.server.heartbeat_interval_secs == 0
            || self.server.client_timeout_secs <= self.server.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }
        Ok(())
    }

    /// Update configuration from a JSON string (partial runtime overrides).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example
    /// `{"gateway": {"ws_base_url": "ws://10.0.0.2:8000"}}` changes only the socket origin.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(gateway) = partial_config.get("gateway") {
            let fields: [(&str, &mut String); 5] = [
                ("ws_base_url", &mut self.gateway.ws_base_url),
                ("http_base_url", &mut self.gateway.http_base_url),
                ("input_path", &mut self.gateway.input_path),
                ("output_path", &mut self.gateway.output_path),
                ("stop_path", &mut self.gateway.stop_path),
            ];
            for (key, slot) in fields {
                if let Some(value) = gateway.get(key).and_then(|v| v.as_str()) {
                    *slot = value.to_string();
                }
            }
        }

        if let Some(client) = partial_config.get("client") {
            let fields: [(&str, &mut u64); 4] = [
                ("connect_timeout_ms", &mut self.client.connect_timeout_ms),
                ("task_id_timeout_ms", &mut self.client.task_id_timeout_ms),
                ("interrupt_timeout_ms", &mut self.client.interrupt_timeout_ms),
                ("turn_timeout_ms", &mut self.client.turn_timeout_ms),
            ];
            for (key, slot) in fields {
                if let Some(value) = client.get(key).and_then(|v| v.as_u64()) {
                    *slot = value;
                }
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(media_type) = audio.get("media_type").and_then(|v| v.as_str()) {
                self.audio.media_type = media_type.to_string();
            }
            if let Some(bytes) = audio.get("capture_segment_bytes").and_then(|v| v.as_u64()) {
                self.audio.capture_segment_bytes = bytes as usize;
            }
        }

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;  // Convert u64 to u16 for port number
            }
            if let Some(bytes) = server.get("audio_chunk_bytes").and_then(|v| v.as_u64()) {
                self.server.audio_chunk_bytes = bytes as usize;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.audio.media_type, "audio/mpeg");
        assert!(config.validate().is_ok());
        assert!(config.validate_server().is_ok());
    }

    #[test]
    fn test_channel_urls_normalise_slashes() {
        let mut config = AppConfig::default();
        config.gateway.ws_base_url = "ws://gateway.local:9000/".to_string();
        config.gateway.input_path = "/ws/input/".to_string();
        config.gateway.output_path = "ws/output/".to_string();
        config.gateway.http_base_url = "http://gateway.local:9000/".to_string();
        config.gateway.stop_path = "/control/stop".to_string();

        assert_eq!(config.gateway.input_url(), "ws://gateway.local:9000/ws/input");
        assert_eq!(config.gateway.output_url("t1"), "ws://gateway.local:9000/ws/output/t1");
        assert_eq!(config.gateway.stop_url(), "http://gateway.local:9000/control/stop");

        assert_eq!(config.gateway.input_route(), "/ws/input");
        assert_eq!(config.gateway.output_route(), "/ws/output/{task_id}");
        assert_eq!(config.gateway.stop_route(), "/control/stop");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.gateway.ws_base_url = "http://127.0.0.1:8000".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_ok());
        assert!(config.validate_server().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"gateway": {"ws_base_url": "wss://example.org"}, "client": {"turn_timeout_ms": 1500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.gateway.ws_base_url, "wss://example.org");
        assert_eq!(config.client.turn_timeout_ms, 1500);
        // Other fields should remain unchanged
        assert_eq!(config.gateway.input_path, "ws/input");
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"audio": {"media_type": " "}}"#).is_err());
    }
}
