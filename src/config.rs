//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::connection::ConnectionOptions;
use crate::protocol::codec::PayloadCodec;
use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name used in logs
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Raw TCP port for game clients
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// WebSocket port for game clients
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Payload codec shared by every connection
    #[serde(default)]
    pub payload_codec: PayloadCodec,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Default reply timeout for server-initiated requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Interval between keep-alives
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Connections idle longer than this are closed
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Kernel worker poll interval
    #[serde(default = "default_kernel_poll_interval")]
    pub kernel_poll_interval_ms: u64,

    /// Interval between character delta pushes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Maximum connections per IP
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Outbound frames buffered per connection
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Development mode flag
    #[serde(default)]
    pub dev_mode: bool,

    /// Session token configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Session token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the web site
    #[serde(default)]
    pub jwt_secret: String,

    /// Clock-skew allowance in seconds
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: default_leeway(),
        }
    }
}

// Default value functions
fn default_server_name() -> String {
    "IdleSync".to_string()
}

fn default_tcp_port() -> u16 {
    3920
}

fn default_websocket_port() -> u16 {
    3921
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_session_idle_timeout() -> u64 {
    120
}

fn default_kernel_poll_interval() -> u64 {
    250
}

fn default_sync_interval() -> u64 {
    1000
}

fn default_max_connections_per_ip() -> usize {
    10
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_leeway() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            server_name: default_server_name(),
            tcp_port: default_tcp_port(),
            websocket_port: default_websocket_port(),
            payload_codec: PayloadCodec::default(),
            max_frame_size: default_max_frame_size(),
            request_timeout_ms: default_request_timeout(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            kernel_poll_interval_ms: default_kernel_poll_interval(),
            sync_interval_ms: default_sync_interval(),
            max_connections_per_ip: default_max_connections_per_ip(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            log_format: LogFormat::default(),
            dev_mode: false,
            auth: AuthConfig::default(),
        }
    }
}

fn env_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("IDLESYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        // Try to load from file
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", config_path.display());
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("IDLESYNC_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("IDLESYNC_TCP_PORT") {
            if let Ok(port) = val.parse() {
                self.tcp_port = port;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_WEBSOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_PAYLOAD_CODEC") {
            match val.parse() {
                Ok(codec) => self.payload_codec = codec,
                Err(e) => tracing::warn!(value = %val, error = %e, "Ignoring IDLESYNC_PAYLOAD_CODEC"),
            }
        }
        if let Ok(val) = env::var("IDLESYNC_MAX_FRAME_SIZE") {
            if let Ok(size) = val.parse() {
                self.max_frame_size = size;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.request_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_SESSION_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.session_idle_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_SYNC_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.sync_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_MAX_CONNECTIONS_PER_IP") {
            if let Ok(max) = val.parse() {
                self.max_connections_per_ip = max;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_LOG_FORMAT") {
            if let Ok(format) = val.parse() {
                self.log_format = format;
            }
        }
        if let Ok(val) = env::var("IDLESYNC_DEV_MODE") {
            self.dev_mode = env_flag(&val);
        }

        // Secrets come from the environment in production
        if let Ok(val) = env::var("IDLESYNC_JWT_SECRET") {
            self.auth.jwt_secret = val;
        }
        if let Ok(val) = env::var("IDLESYNC_JWT_LEEWAY_SECS") {
            if let Ok(secs) = val.parse() {
                self.auth.leeway_secs = secs;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tcp_port == 0 || self.websocket_port == 0 {
            anyhow::bail!("Ports must be non-zero");
        }

        // Ports must be unique
        if self.tcp_port == self.websocket_port {
            anyhow::bail!("TCP port and WebSocket port must be different");
        }

        if self.request_timeout_ms == 0
            || self.keep_alive_interval_secs == 0
            || self.session_idle_timeout_secs == 0
            || self.sync_interval_ms == 0
        {
            anyhow::bail!("Timeouts and intervals must be non-zero");
        }

        if self.kernel_poll_interval_ms == 0 || self.kernel_poll_interval_ms > 1000 {
            anyhow::bail!("Kernel poll interval must be between 1ms and 1000ms");
        }

        if self.max_frame_size < 64 {
            anyhow::bail!("Max frame size must be at least 64 bytes");
        }

        if self.max_connections_per_ip == 0 || self.outbound_queue_capacity == 0 {
            anyhow::bail!("Connection limits must be non-zero");
        }

        if self.auth.jwt_secret.is_empty() && !self.dev_mode {
            anyhow::bail!("auth.jwt_secret is required outside dev mode");
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn kernel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.kernel_poll_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Per-connection settings derived from this config
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout(),
            queue_capacity: self.outbound_queue_capacity,
        }
    }
}
