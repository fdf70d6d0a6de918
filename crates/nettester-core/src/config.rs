//! Client configuration

use crate::error::ClientError;
use crate::{DEFAULT_MAX_FRAME_PAYLOAD, MAX_FRAME_PAYLOAD, MAX_TOKEN_LEN, PROTOCOL_VERSION};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-connection settings
    pub connection: ConnectionConfig,

    /// Most accepted connections a listener keeps at once
    pub max_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 16,
        }
    }
}

impl ClientConfig {
    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_connections == 0 {
            return Err(ClientError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.connection.validate()
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Silence allowed before the connection is failed.
    ///
    /// Only raises the transport's own default, never lowers it.
    pub timeout: Duration,

    /// Send a keepalive after this long without sending anything
    pub keepalive_interval: Duration,

    /// Retransmission timing for reliable frames and the Hello
    pub retransmit: RetransmitPolicy,

    /// Largest payload in one Data frame; bigger reliable sends are fragmented
    pub max_frame_payload: usize,

    /// Version sent in the Hello and required from the peer
    pub protocol_version: u32,

    /// Token sent in the Hello (empty when no security handshake is wanted)
    pub security_token: Vec<u8>,

    /// Token a listener requires from incoming Hellos
    pub expected_token: Option<Vec<u8>>,

    /// Out-of-order reliable frames buffered per channel
    pub reorder_window: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            retransmit: RetransmitPolicy::default(),
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            protocol_version: PROTOCOL_VERSION,
            security_token: Vec::new(),
            expected_token: None,
            reorder_window: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.keepalive_interval.is_zero() {
            return Err(invalid("keepalive_interval must be non-zero"));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(ClientError::InvalidConfig(format!(
                "max_frame_payload must be between 1 and {MAX_FRAME_PAYLOAD} bytes"
            )));
        }
        if self.reorder_window == 0 {
            return Err(invalid("reorder_window must be non-zero"));
        }
        if self.security_token.len() > MAX_TOKEN_LEN {
            return Err(invalid("security_token does not fit in one datagram"));
        }
        self.retransmit.validate()
    }
}

/// Retransmission timing with capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetransmitPolicy {
    /// Delay before the first retransmission
    pub initial: Duration,

    /// Upper bound on the delay between retransmissions
    pub max: Duration,

    /// Multiplier applied to the delay after every attempt
    pub backoff: f64,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(2),
            backoff: 1.5,
        }
    }
}

impl RetransmitPolicy {
    /// Delay before retransmitting a frame already sent `attempts` times
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let delay = self.initial.as_nanos() as f64 * self.backoff.powi(exponent);
        let capped = delay.min(self.max.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.initial.is_zero() {
            return Err(invalid("retransmit initial delay must be non-zero"));
        }
        if self.max < self.initial {
            return Err(invalid("retransmit max delay must not be below the initial delay"));
        }
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err(invalid("retransmit backoff must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ClientError {
    ClientError::InvalidConfig(message.to_string())
}
