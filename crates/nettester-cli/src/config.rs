//! Configuration file for the NetTester CLI.

use nettester_core::{ClientConfig, ConnectionConfig, RetransmitPolicy};
use nettester_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// NetTester configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Socket configuration
    pub network: NetworkConfig,
    /// Per-connection protocol configuration
    pub connection: ConnectionSection,
    /// Session loop configuration
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
    /// Send buffer size in bytes
    pub send_buffer_size: usize,
    /// Connection timeout floor imposed by the transport
    pub transport_timeout_ms: u64,
}

/// Per-connection protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Silence allowed before a connection fails
    pub timeout_ms: u64,
    /// Idle time before a keepalive is sent
    pub keepalive_ms: u64,
    /// First retransmission delay
    pub retransmit_initial_ms: u64,
    /// Retransmission delay ceiling
    pub retransmit_max_ms: u64,
    /// Delay multiplier per attempt
    pub retransmit_backoff: f64,
    /// Largest payload in one Data frame
    pub max_frame_payload: usize,
    /// Token sent in the Hello (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,
    /// Token required from connecting peers (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_token: Option<String>,
}

/// Session loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ticks per second
    pub tick_hz: u32,
    /// Peers a listener accepts at once
    pub max_connections: usize,
    /// How long `send` waits for the handshake
    pub handshake_wait_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            recv_buffer_size: transport.recv_buffer_size,
            send_buffer_size: transport.send_buffer_size,
            transport_timeout_ms: duration_ms(transport.default_timeout),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            timeout_ms: duration_ms(connection.timeout),
            keepalive_ms: duration_ms(connection.keepalive_interval),
            retransmit_initial_ms: duration_ms(connection.retransmit.initial),
            retransmit_max_ms: duration_ms(connection.retransmit.max),
            retransmit_backoff: connection.retransmit.backoff,
            max_frame_payload: connection.max_frame_payload,
            security_token: None,
            expected_token: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_hz: 30,
            max_connections: ClientConfig::default().max_connections,
            handshake_wait_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("nettester/config.toml")
    }

    /// Load `path` if given, else the default path if it exists, else defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or any file fails to parse.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path)
                .map_err(|e| anyhow::anyhow!("cannot load config {}: {}", path.display(), e)),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Time between ticks
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.session.tick_hz.max(1)
    }

    /// Build the transport settings
    #[must_use]
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            recv_buffer_size: self.network.recv_buffer_size,
            send_buffer_size: self.network.send_buffer_size,
            default_timeout: Duration::from_millis(self.network.transport_timeout_ms),
        }
    }

    /// Build the client settings
    ///
    /// # Errors
    ///
    /// Returns an error if a token is not valid hex.
    pub fn to_client_config(&self) -> anyhow::Result<ClientConfig> {
        let section = &self.connection;
        let security_token = section
            .security_token
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid security_token: {}", e))?
            .unwrap_or_default();
        let expected_token = section
            .expected_token
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid expected_token: {}", e))?;

        Ok(ClientConfig {
            connection: ConnectionConfig {
                timeout: Duration::from_millis(section.timeout_ms),
                keepalive_interval: Duration::from_millis(section.keepalive_ms),
                retransmit: RetransmitPolicy {
                    initial: Duration::from_millis(section.retransmit_initial_ms),
                    max: Duration::from_millis(section.retransmit_max_ms),
                    backoff: section.retransmit_backoff,
                },
                max_frame_payload: section.max_frame_payload,
                security_token,
                expected_token,
                ..ConnectionConfig::default()
            },
            max_connections: self.session.max_connections,
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.session.tick_hz == 0 || self.session.tick_hz > 1000 {
            anyhow::bail!("tick_hz must be between 1 and 1000");
        }

        if self.network.recv_buffer_size == 0 || self.network.send_buffer_size == 0 {
            anyhow::bail!("Socket buffer sizes must be non-zero");
        }

        // Library-level checks cover timeouts, retransmit policy and limits
        self.to_client_config()?.validate()?;

        Ok(())
    }
}
